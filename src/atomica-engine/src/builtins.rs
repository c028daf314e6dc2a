// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use serde::{Deserialize, Serialize};

/// The location of a symbol within an equation, in bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Loc {
    pub start: u16,
    pub end: u16,
}

impl Loc {
    pub fn new(start: usize, end: usize) -> Self {
        Loc {
            start: start as u16,
            end: end as u16,
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        Loc {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(PartialEq, Clone, Debug)]
pub struct UntypedBuiltinFn<Expr>(pub String, pub Vec<Expr>);

/// The pure scalar functions available in parameter expressions.
#[derive(PartialEq, Clone, Debug, Serialize, Deserialize)]
pub enum BuiltinFn<Expr> {
    Abs(Box<Expr>),
    Exp(Box<Expr>),
    Ln(Box<Expr>),
    Sqrt(Box<Expr>),
    Floor(Box<Expr>),
    Ceil(Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    /// Branchless select: `if(cond, a, b)`.
    If(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// The four cross-population aggregation forms.  `Src*` aggregates over
/// populations that are a source of an interaction terminating at the
/// current population; `Tgt*` aggregates over the transposed direction.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum AggOp {
    SrcPopSum,
    SrcPopAvg,
    TgtPopSum,
    TgtPopAvg,
}

impl AggOp {
    pub fn is_avg(&self) -> bool {
        matches!(self, AggOp::SrcPopAvg | AggOp::TgtPopAvg)
    }

    /// Whether the aggregation walks interaction edges source-to-target.
    pub fn is_transposed(&self) -> bool {
        matches!(self, AggOp::TgtPopSum | AggOp::TgtPopAvg)
    }
}

pub fn is_builtin_fn(name: &str) -> bool {
    matches!(
        name,
        "abs" | "exp" | "log" | "sqrt" | "floor" | "ceil" | "min" | "max" | "if"
    )
}

pub fn agg_op(name: &str) -> Option<AggOp> {
    match name {
        "src_pop_sum" => Some(AggOp::SrcPopSum),
        "src_pop_avg" => Some(AggOp::SrcPopAvg),
        "tgt_pop_sum" => Some(AggOp::TgtPopSum),
        "tgt_pop_avg" => Some(AggOp::TgtPopAvg),
        _ => None,
    }
}

pub fn is_aggregator_fn(name: &str) -> bool {
    agg_op(name).is_some()
}

#[test]
fn test_is_builtin_fn() {
    assert!(is_builtin_fn("min"));
    assert!(is_builtin_fn("if"));
    assert!(!is_builtin_fn("minz"));
    assert!(!is_builtin_fn("src_pop_sum"));
}

#[test]
fn test_agg_op() {
    assert_eq!(Some(AggOp::SrcPopAvg), agg_op("src_pop_avg"));
    assert_eq!(None, agg_op("pop_avg"));
    assert!(agg_op("tgt_pop_avg").unwrap().is_transposed());
    assert!(!agg_op("src_pop_sum").unwrap().is_avg());
}
