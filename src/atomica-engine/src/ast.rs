// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

pub use crate::builtins::Loc;

use crate::builtins::{agg_op, is_builtin_fn, AggOp, BuiltinFn, UntypedBuiltinFn};
use crate::common::{canonicalize, EquationError, EquationResult, Ident};
use crate::eqn_err;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnaryOp {
    Positive,
    Negative,
}

/// The parse-stage expression: identifiers unresolved, function
/// applications untyped.
#[derive(PartialEq, Clone, Debug)]
pub enum Expr0 {
    Const(String, f64, Loc),
    Var(Ident, Loc),
    App(UntypedBuiltinFn<Expr0>, Loc),
    Op1(UnaryOp, Box<Expr0>, Loc),
    Op2(BinaryOp, Box<Expr0>, Box<Expr0>, Loc),
}

impl Expr0 {
    pub fn get_loc(&self) -> Loc {
        match self {
            Expr0::Const(_, _, loc)
            | Expr0::Var(_, loc)
            | Expr0::App(_, loc)
            | Expr0::Op1(_, _, loc)
            | Expr0::Op2(_, _, _, loc) => *loc,
        }
    }
}

/// A cross-population aggregation call, checked for shape but with
/// identifiers still unresolved.
#[derive(PartialEq, Clone, Debug)]
pub struct AggExpr {
    pub op: AggOp,
    pub var: Ident,
    pub interaction: Option<Ident>,
    pub weight: Option<Ident>,
}

/// The checked expression: builtin applications are typed and aggregation
/// forms are explicit.  Identifier resolution to graph slots happens later,
/// at graph-construction time.
#[derive(PartialEq, Clone, Debug)]
pub enum Expr {
    Const(f64, Loc),
    Var(Ident, Loc),
    App(BuiltinFn<Expr>, Loc),
    Agg(AggExpr, Loc),
    Op1(UnaryOp, Box<Expr>, Loc),
    Op2(BinaryOp, Box<Expr>, Box<Expr>, Loc),
}

impl Expr {
    pub fn get_loc(&self) -> Loc {
        match self {
            Expr::Const(_, loc)
            | Expr::Var(_, loc)
            | Expr::App(_, loc)
            | Expr::Agg(_, loc)
            | Expr::Op1(_, _, loc)
            | Expr::Op2(_, _, _, loc) => *loc,
        }
    }

    /// Lower a parse-stage expression: type builtin applications, recognize
    /// aggregation forms, canonicalize identifiers.
    pub fn from(expr: Expr0) -> EquationResult<Expr> {
        let expr = match expr {
            Expr0::Const(_, n, loc) => Expr::Const(n, loc),
            Expr0::Var(ident, loc) => Expr::Var(canonicalize(&ident), loc),
            Expr0::App(UntypedBuiltinFn(name, args), loc) => {
                if let Some(op) = agg_op(&name) {
                    return lower_aggregation(op, args, loc);
                }
                if !is_builtin_fn(&name) {
                    return eqn_err!(UnknownBuiltin, loc.start, loc.end);
                }
                let mut args = args
                    .into_iter()
                    .map(Expr::from)
                    .collect::<EquationResult<Vec<Expr>>>()?
                    .into_iter();
                let arity_err = || EquationError {
                    start: loc.start,
                    end: loc.end,
                    code: crate::common::ErrorCode::BadBuiltinArgs,
                };
                let mut arg1 = move || args.next().ok_or_else(arity_err);
                let builtin = match name.as_str() {
                    "abs" => BuiltinFn::Abs(Box::new(arg1()?)),
                    "exp" => BuiltinFn::Exp(Box::new(arg1()?)),
                    "log" => BuiltinFn::Ln(Box::new(arg1()?)),
                    "sqrt" => BuiltinFn::Sqrt(Box::new(arg1()?)),
                    "floor" => BuiltinFn::Floor(Box::new(arg1()?)),
                    "ceil" => BuiltinFn::Ceil(Box::new(arg1()?)),
                    "min" => BuiltinFn::Min(Box::new(arg1()?), Box::new(arg1()?)),
                    "max" => BuiltinFn::Max(Box::new(arg1()?), Box::new(arg1()?)),
                    "if" => BuiltinFn::If(
                        Box::new(arg1()?),
                        Box::new(arg1()?),
                        Box::new(arg1()?),
                    ),
                    _ => unreachable!(),
                };
                if arg1().is_ok() {
                    // extra arguments
                    return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                }
                Expr::App(builtin, loc)
            }
            Expr0::Op1(op, l, loc) => Expr::Op1(op, Box::new(Expr::from(*l)?), loc),
            Expr0::Op2(op, l, r, loc) => Expr::Op2(
                op,
                Box::new(Expr::from(*l)?),
                Box::new(Expr::from(*r)?),
                loc,
            ),
        };
        Ok(expr)
    }
}

/// Aggregator arguments must be bare variable names; arity is
/// `SRC_POP_SUM(var[, weight])` and `SRC_POP_AVG(var, interaction[, weight])`
/// (likewise for the `TGT_` forms).
fn lower_aggregation(op: AggOp, args: Vec<Expr0>, loc: Loc) -> EquationResult<Expr> {
    let mut idents = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Expr0::Var(ident, _) => idents.push(canonicalize(&ident)),
            _ => {
                return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
            }
        }
    }
    let mut idents = idents.into_iter();
    let var = match idents.next() {
        Some(v) => v,
        None => {
            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
        }
    };
    let (interaction, weight) = if op.is_avg() {
        let interaction = match idents.next() {
            Some(i) => i,
            None => {
                return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
            }
        };
        (Some(interaction), idents.next())
    } else {
        (None, idents.next())
    };
    if idents.next().is_some() {
        return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
    }
    Ok(Expr::Agg(
        AggExpr {
            op,
            var,
            interaction,
            weight,
        },
        loc,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn lower(input: &str) -> EquationResult<Expr> {
        let expr0 = parser::parse(input).unwrap().unwrap();
        Expr::from(expr0)
    }

    #[test]
    fn lowers_builtins() {
        let expr = lower("max(0, foi)").unwrap();
        match expr {
            Expr::App(BuiltinFn::Max(_, _), _) => {}
            _ => panic!("expected max"),
        }

        let expr = lower("if(x > 1, 1, x)").unwrap();
        match expr {
            Expr::App(BuiltinFn::If(_, _, _), _) => {}
            _ => panic!("expected if"),
        }
    }

    #[test]
    fn lowers_aggregations() {
        let expr = lower("src_pop_avg(foi_out, mixing, pop_size)").unwrap();
        match expr {
            Expr::Agg(agg, _) => {
                assert_eq!(AggOp::SrcPopAvg, agg.op);
                assert_eq!("foi_out", agg.var);
                assert_eq!(Some("mixing".to_owned()), agg.interaction);
                assert_eq!(Some("pop_size".to_owned()), agg.weight);
            }
            _ => panic!("expected aggregation"),
        }

        let expr = lower("SRC_POP_SUM(prev)").unwrap();
        match expr {
            Expr::Agg(agg, _) => {
                assert_eq!(AggOp::SrcPopSum, agg.op);
                assert_eq!("prev", agg.var);
                assert_eq!(None, agg.interaction);
                assert_eq!(None, agg.weight);
            }
            _ => panic!("expected aggregation"),
        }
    }

    #[test]
    fn rejects_bad_calls() {
        assert!(lower("min(1)").is_err());
        assert!(lower("max(1, 2, 3)").is_err());
        assert!(lower("frobnicate(1)").is_err());
        assert!(lower("src_pop_avg(foi_out)").is_err());
        assert!(lower("src_pop_sum(a + b)").is_err());
    }
}
