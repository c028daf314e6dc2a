// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::HashSet;

use crate::ast::{AggExpr, Expr};
use crate::builtins::BuiltinFn;
use crate::common::{canonicalize, EquationError, Ident};
use crate::datamodel;
use crate::datamodel::{Modality, Units};
use crate::parser;

/// A framework declaration compiled for model analysis: expressions parsed,
/// identifiers canonicalized, problems recorded on the variable itself.
#[derive(Clone, PartialEq, Debug)]
pub enum Variable {
    Compartment {
        ident: Ident,
        pop_type: Ident,
        is_source: bool,
        is_sink: bool,
        is_junction: bool,
        default_value: Option<f64>,
        setup: bool,
        errors: Vec<EquationError>,
    },
    Characteristic {
        ident: Ident,
        pop_type: Ident,
        includes: Vec<Ident>,
        denominator: Option<Ident>,
        setup: bool,
        errors: Vec<EquationError>,
    },
    Parameter {
        ident: Ident,
        pop_type: Ident,
        units: Units,
        ast: Option<Expr>,
        default_value: Option<f64>,
        min_value: Option<f64>,
        max_value: Option<f64>,
        targetable: bool,
        modality: Modality,
        errors: Vec<EquationError>,
    },
}

impl Variable {
    pub fn ident(&self) -> &str {
        match self {
            Variable::Compartment { ident, .. }
            | Variable::Characteristic { ident, .. }
            | Variable::Parameter { ident, .. } => ident.as_str(),
        }
    }

    pub fn pop_type(&self) -> &str {
        match self {
            Variable::Compartment { pop_type, .. }
            | Variable::Characteristic { pop_type, .. }
            | Variable::Parameter { pop_type, .. } => pop_type.as_str(),
        }
    }

    pub fn is_compartment(&self) -> bool {
        matches!(self, Variable::Compartment { .. })
    }

    pub fn is_characteristic(&self) -> bool {
        matches!(self, Variable::Characteristic { .. })
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self, Variable::Parameter { .. })
    }

    pub fn ast(&self) -> Option<&Expr> {
        match self {
            Variable::Parameter { ast: Some(ast), .. } => Some(ast),
            _ => None,
        }
    }

    pub fn errors(&self) -> &[EquationError] {
        match self {
            Variable::Compartment { errors, .. }
            | Variable::Characteristic { errors, .. }
            | Variable::Parameter { errors, .. } => errors,
        }
    }

    pub(crate) fn push_error(&mut self, err: EquationError) {
        match self {
            Variable::Compartment { errors, .. }
            | Variable::Characteristic { errors, .. }
            | Variable::Parameter { errors, .. } => errors.push(err),
        }
    }

    /// The variables this one reads when evaluated, by code name.  For
    /// aggregating parameters this includes the aggregated variable and the
    /// weight variable, which live in other populations.
    pub fn direct_deps(&self) -> HashSet<Ident> {
        match self {
            Variable::Compartment { .. } => HashSet::new(),
            Variable::Characteristic {
                includes,
                denominator,
                ..
            } => {
                let mut deps: HashSet<Ident> = includes.iter().cloned().collect();
                if let Some(denom) = denominator {
                    deps.insert(denom.clone());
                }
                deps
            }
            Variable::Parameter { ast, .. } => match ast {
                Some(ast) => identifier_set(ast),
                None => HashSet::new(),
            },
        }
    }

    /// The aggregation calls in this variable's expression, if any.
    pub fn aggregations(&self) -> Vec<&AggExpr> {
        let mut aggs = Vec::new();
        if let Some(ast) = self.ast() {
            collect_aggregations(ast, &mut aggs);
        }
        aggs
    }

    pub fn uses_aggregation(&self) -> bool {
        !self.aggregations().is_empty()
    }
}

/// Compile one framework compartment declaration.
pub fn compile_compartment(decl: &datamodel::Compartment) -> Variable {
    let mut errors = Vec::new();
    if decl.is_junction && (decl.is_source || decl.is_sink) {
        errors.push(EquationError {
            start: 0,
            end: 0,
            code: crate::common::ErrorCode::BadTransition,
        });
    }
    Variable::Compartment {
        ident: canonicalize(&decl.name),
        pop_type: canonicalize(&decl.pop_type),
        is_source: decl.is_source,
        is_sink: decl.is_sink,
        is_junction: decl.is_junction,
        default_value: decl.default_value,
        setup: decl.setup,
        errors,
    }
}

/// Compile one framework characteristic declaration.
pub fn compile_characteristic(decl: &datamodel::Characteristic) -> Variable {
    Variable::Characteristic {
        ident: canonicalize(&decl.name),
        pop_type: canonicalize(&decl.pop_type),
        includes: decl.includes.iter().map(|s| canonicalize(s)).collect(),
        denominator: decl.denominator.as_ref().map(|s| canonicalize(s)),
        setup: decl.setup,
        errors: Vec::new(),
    }
}

/// Compile one framework parameter declaration, parsing its expression.
pub fn compile_parameter(decl: &datamodel::Parameter) -> Variable {
    let mut errors = Vec::new();

    let ast = match &decl.expression {
        Some(eqn) => match parser::parse(eqn) {
            Ok(Some(expr0)) => match Expr::from(expr0) {
                Ok(expr) => Some(expr),
                Err(err) => {
                    errors.push(err);
                    None
                }
            },
            Ok(None) => {
                errors.push(EquationError {
                    start: 0,
                    end: 0,
                    code: crate::common::ErrorCode::EmptyEquation,
                });
                None
            }
            Err(errs) => {
                errors.extend(errs);
                None
            }
        },
        None => None,
    };

    Variable::Parameter {
        ident: canonicalize(&decl.name),
        pop_type: canonicalize(&decl.pop_type),
        units: decl.units,
        ast,
        default_value: decl.default_value,
        min_value: decl.min_value,
        max_value: decl.max_value,
        targetable: decl.targetable,
        modality: decl.modality,
        errors,
    }
}

struct IdentifierSetVisitor {
    identifiers: HashSet<Ident>,
}

impl IdentifierSetVisitor {
    fn walk(&mut self, expr: &Expr) {
        match expr {
            Expr::Const(_, _) => (),
            Expr::Var(id, _) => {
                self.identifiers.insert(id.clone());
            }
            Expr::App(builtin, _) => match builtin {
                BuiltinFn::Abs(a)
                | BuiltinFn::Exp(a)
                | BuiltinFn::Ln(a)
                | BuiltinFn::Sqrt(a)
                | BuiltinFn::Floor(a)
                | BuiltinFn::Ceil(a) => self.walk(a),
                BuiltinFn::Min(a, b) | BuiltinFn::Max(a, b) => {
                    self.walk(a);
                    self.walk(b);
                }
                BuiltinFn::If(c, t, f) => {
                    self.walk(c);
                    self.walk(t);
                    self.walk(f);
                }
            },
            Expr::Agg(agg, _) => {
                self.identifiers.insert(agg.var.clone());
                if let Some(weight) = &agg.weight {
                    self.identifiers.insert(weight.clone());
                }
            }
            Expr::Op1(_, l, _) => self.walk(l),
            Expr::Op2(_, l, r, _) => {
                self.walk(l);
                self.walk(r);
            }
        }
    }
}

pub fn identifier_set(ast: &Expr) -> HashSet<Ident> {
    let mut id_visitor = IdentifierSetVisitor {
        identifiers: HashSet::new(),
    };
    id_visitor.walk(ast);
    id_visitor.identifiers
}

fn collect_aggregations<'a>(expr: &'a Expr, into: &mut Vec<&'a AggExpr>) {
    match expr {
        Expr::Const(_, _) | Expr::Var(_, _) => (),
        Expr::App(builtin, _) => match builtin {
            BuiltinFn::Abs(a)
            | BuiltinFn::Exp(a)
            | BuiltinFn::Ln(a)
            | BuiltinFn::Sqrt(a)
            | BuiltinFn::Floor(a)
            | BuiltinFn::Ceil(a) => collect_aggregations(a, into),
            BuiltinFn::Min(a, b) | BuiltinFn::Max(a, b) => {
                collect_aggregations(a, into);
                collect_aggregations(b, into);
            }
            BuiltinFn::If(c, t, f) => {
                collect_aggregations(c, into);
                collect_aggregations(t, into);
                collect_aggregations(f, into);
            }
        },
        Expr::Agg(agg, _) => into.push(agg),
        Expr::Op1(_, l, _) => collect_aggregations(l, into),
        Expr::Op2(_, l, r, _) => {
            collect_aggregations(l, into);
            collect_aggregations(r, into);
        }
    }
}
