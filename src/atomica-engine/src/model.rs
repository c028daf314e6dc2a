// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::result::Result as StdResult;

use crate::builtins::{is_aggregator_fn, is_builtin_fn, AggOp};
use crate::common::{
    canonicalize, topo_sort, EquationError, Error, ErrorCode, Ident, Result,
};
use crate::datamodel::{self, Framework, JunctionFallback, Units};
use crate::variable::{
    compile_characteristic, compile_compartment, compile_parameter, Variable,
};
use crate::model_err;

pub type DependencySet = BTreeSet<Ident>;

/// A transition with all identifiers canonicalized and checked.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transition {
    pub from: Ident,
    pub to: Ident,
    pub parameter: Ident,
    pub pop_type: Ident,
}

/// The validated framework: every declaration compiled, all references
/// resolved, the dependency structure analyzed.  A `Model` is independent of
/// any particular databook; binding to populations happens at graph build.
#[derive(Clone, PartialEq, Debug)]
pub struct Model {
    pub name: String,
    pub pop_types: Vec<datamodel::PopulationType>,
    pub variables: HashMap<Ident, Variable>,
    /// Declaration-ordered compartment names per population type.
    pub comps: BTreeMap<Ident, Vec<Ident>>,
    /// Declaration-ordered characteristic names per population type.
    pub characs: BTreeMap<Ident, Vec<Ident>>,
    /// Declaration-ordered parameter names per population type.
    pub pars: BTreeMap<Ident, Vec<Ident>>,
    pub transitions: Vec<Transition>,
    pub interactions: HashMap<Ident, datamodel::Interaction>,
    pub junction_fallback: JunctionFallback,
    /// Transitive dependencies for every characteristic and parameter.
    /// Chains break at compartments, whose values lag by one timestep.
    pub deps: HashMap<Ident, DependencySet>,
    /// Variables that feed the integration: link drivers, program targets,
    /// and everything they transitively reference.
    pub dependent: BTreeSet<Ident>,
    /// Evaluation order for dependent characteristics and parameters,
    /// recomputed every timestep.
    pub run_order: Vec<Ident>,
    /// Evaluation order over all characteristics and parameters, for the
    /// vectorized post-run pass.
    pub full_order: Vec<Ident>,
}

impl Model {
    pub fn new(framework: &Framework) -> Result<Model> {
        let pop_types = framework.pop_types_or_default();
        let type_names: HashSet<Ident> =
            pop_types.iter().map(|pt| canonicalize(&pt.name)).collect();

        let mut variables: HashMap<Ident, Variable> = HashMap::new();
        let mut comps: BTreeMap<Ident, Vec<Ident>> = BTreeMap::new();
        let mut characs: BTreeMap<Ident, Vec<Ident>> = BTreeMap::new();
        let mut pars: BTreeMap<Ident, Vec<Ident>> = BTreeMap::new();

        let insert = |variables: &mut HashMap<Ident, Variable>,
                          order: &mut BTreeMap<Ident, Vec<Ident>>,
                          var: Variable|
         -> Result<()> {
            let ident = var.ident().to_owned();
            if is_builtin_fn(&ident) || is_aggregator_fn(&ident) {
                return model_err!(DuplicateVariable, ident);
            }
            if variables.contains_key(&ident) {
                return model_err!(DuplicateVariable, ident);
            }
            if !type_names.contains(var.pop_type()) {
                return model_err!(BadPopulationType, format!("{}: {}", ident, var.pop_type()));
            }
            order
                .entry(var.pop_type().to_owned())
                .or_default()
                .push(ident.clone());
            variables.insert(ident, var);
            Ok(())
        };

        for decl in framework.compartments.iter() {
            insert(&mut variables, &mut comps, compile_compartment(decl))?;
        }
        for decl in framework.characteristics.iter() {
            insert(&mut variables, &mut characs, compile_characteristic(decl))?;
        }
        for decl in framework.parameters.iter() {
            insert(&mut variables, &mut pars, compile_parameter(decl))?;
        }

        let mut interactions: HashMap<Ident, datamodel::Interaction> = HashMap::new();
        for decl in framework.interactions.iter() {
            let name = canonicalize(&decl.name);
            if variables.contains_key(&name) || interactions.contains_key(&name) {
                return model_err!(DuplicateVariable, name);
            }
            let from_type = canonicalize(&decl.from_type);
            let to_type = canonicalize(&decl.to_type);
            if !type_names.contains(&from_type) || !type_names.contains(&to_type) {
                return model_err!(BadInteraction, name);
            }
            interactions.insert(
                name.clone(),
                datamodel::Interaction {
                    name,
                    label: decl.label.clone(),
                    from_type,
                    to_type,
                },
            );
        }

        let transitions = check_transitions(framework, &variables)?;
        check_junction_cycles(&transitions, &variables)?;
        check_characteristics(&mut variables);
        check_parameter_references(&mut variables, &interactions);

        let var_errors: Vec<String> = {
            let mut failed: Vec<&Variable> = variables
                .values()
                .filter(|v| !v.errors().is_empty())
                .collect();
            failed.sort_by_key(|v| v.ident().to_owned());
            failed
                .iter()
                .flat_map(|v| {
                    v.errors()
                        .iter()
                        .map(|e| format!("{}: {}", v.ident(), e))
                        .collect::<Vec<String>>()
                })
                .collect()
        };
        if !var_errors.is_empty() {
            return model_err!(VariablesHaveErrors, var_errors.join("; "));
        }

        let deps = all_deps(&variables).map_err(Error::from)?;

        // dependent seeds: everything driving a link, plus anything a
        // program could overwrite
        let mut dependent: BTreeSet<Ident> = BTreeSet::new();
        for transition in transitions.iter() {
            dependent.insert(transition.parameter.clone());
        }
        for var in variables.values() {
            if let Variable::Parameter {
                ident,
                targetable: true,
                ..
            } = var
            {
                dependent.insert(ident.clone());
            }
        }
        let seeds: Vec<Ident> = dependent.iter().cloned().collect();
        for seed in seeds {
            for dep in deps[&seed].iter() {
                if variables[dep].is_compartment() {
                    continue;
                }
                dependent.insert(dep.clone());
            }
        }

        // evaluation orders: characteristics and parameters in declaration
        // order, refined topologically
        let declared: Vec<Ident> = characs
            .values()
            .flatten()
            .chain(pars.values().flatten())
            .cloned()
            .collect();
        let full_order: Vec<Ident> = {
            let runlist: Vec<&str> = declared.iter().map(|s| s.as_str()).collect();
            topo_sort(runlist, &deps)
                .into_iter()
                .map(|s| s.to_owned())
                .collect()
        };
        let run_order: Vec<Ident> = full_order
            .iter()
            .filter(|ident| dependent.contains(*ident))
            .cloned()
            .collect();

        Ok(Model {
            name: framework.name.clone(),
            pop_types,
            variables,
            comps,
            characs,
            pars,
            transitions,
            interactions,
            junction_fallback: framework.junction_fallback,
            deps,
            dependent,
            run_order,
            full_order,
        })
    }

    pub fn get_variable(&self, ident: &str) -> Option<&Variable> {
        self.variables.get(ident)
    }

    pub fn is_dependent(&self, ident: &str) -> bool {
        self.dependent.contains(ident)
    }

    /// The outflow transitions of a junction, in declaration order.
    pub fn junction_outflows(&self, junction: &str) -> Vec<&Transition> {
        self.transitions
            .iter()
            .filter(|t| t.from == junction)
            .collect()
    }

    /// The interactions usable by an aggregation hosted in `host_type`:
    /// those terminating at `host_type` for the `Src*` ops, those starting
    /// at `host_type` for the transposed `Tgt*` ops.
    pub fn aggregation_interactions(
        &self,
        op: AggOp,
        host_type: &str,
    ) -> Vec<&datamodel::Interaction> {
        let mut result: Vec<&datamodel::Interaction> = self
            .interactions
            .values()
            .filter(|i| {
                if op.is_transposed() {
                    i.from_type == host_type
                } else {
                    i.to_type == host_type
                }
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }
}

fn check_transitions(
    framework: &Framework,
    variables: &HashMap<Ident, Variable>,
) -> Result<Vec<Transition>> {
    let mut transitions = Vec::with_capacity(framework.transitions.len());

    for decl in framework.transitions.iter() {
        let from = canonicalize(&decl.from);
        let to = canonicalize(&decl.to);
        let parameter = canonicalize(&decl.parameter);

        let from_var = match variables.get(&from) {
            Some(v) if v.is_compartment() => v,
            _ => return model_err!(BadTransition, format!("{} -> {}: {}", from, to, from)),
        };
        let to_var = match variables.get(&to) {
            Some(v) if v.is_compartment() => v,
            _ => return model_err!(BadTransition, format!("{} -> {}: {}", from, to, to)),
        };
        let par_var = match variables.get(&parameter) {
            Some(v) if v.is_parameter() => v,
            _ => {
                return model_err!(BadTransition, format!("{} -> {}: {}", from, to, parameter))
            }
        };

        if from_var.pop_type() != to_var.pop_type() || from_var.pop_type() != par_var.pop_type()
        {
            return model_err!(
                MismatchedPopulationTypes,
                format!("{} -> {}", from, to)
            );
        }

        let (from_source, from_sink, from_junction) = compartment_flags(from_var);
        let (to_source, _, _) = compartment_flags(to_var);

        if from_sink {
            return model_err!(BadTransition, format!("{} -> {}: sink outflow", from, to));
        }
        if to_source {
            return model_err!(BadTransition, format!("{} -> {}: source inflow", from, to));
        }

        let units = parameter_units(par_var);
        if from_junction {
            if units != Units::Proportion {
                return model_err!(
                    BadJunctionOutflow,
                    format!("{} -> {}: {}", from, to, parameter)
                );
            }
        } else {
            match units {
                Units::Number | Units::Probability | Units::Duration => (),
                Units::Proportion | Units::Unknown => {
                    return model_err!(BadUnits, format!("{} -> {}: {}", from, to, parameter));
                }
            }
            if from_source && units != Units::Number {
                return model_err!(
                    BadUnits,
                    format!("{} -> {}: source outflow must be in number units", from, to)
                );
            }
        }

        transitions.push(Transition {
            from,
            to,
            parameter,
            pop_type: from_var.pop_type().to_owned(),
        });
    }

    // every junction needs somewhere to send arriving mass
    for var in variables.values() {
        if let Variable::Compartment {
            ident,
            is_junction: true,
            ..
        } = var
        {
            if !transitions.iter().any(|t| &t.from == ident) {
                return model_err!(BadJunctionOutflow, ident.clone());
            }
        }
    }

    Ok(transitions)
}

/// A cycle in the junction graph could never be flushed; reject it before
/// the integrator ever sees it.
fn check_junction_cycles(
    transitions: &[Transition],
    variables: &HashMap<Ident, Variable>,
) -> Result<()> {
    let is_junction = |ident: &str| -> bool {
        matches!(
            variables.get(ident),
            Some(Variable::Compartment {
                is_junction: true,
                ..
            })
        )
    };

    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for t in transitions.iter() {
        if is_junction(&t.from) && is_junction(&t.to) {
            edges.entry(t.from.as_str()).or_default().push(t.to.as_str());
        }
    }

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        on_path: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<String> {
        if done.contains(node) {
            return None;
        }
        if !on_path.insert(node) {
            return Some(node.to_owned());
        }
        if let Some(next) = edges.get(node) {
            for dst in next.iter() {
                if let Some(cycle) = visit(dst, edges, on_path, done) {
                    return Some(cycle);
                }
            }
        }
        on_path.remove(node);
        done.insert(node);
        None
    }

    let mut on_path: HashSet<&str> = HashSet::new();
    let mut done: HashSet<&str> = HashSet::new();
    let mut starts: Vec<&str> = edges.keys().copied().collect();
    starts.sort_unstable();
    for start in starts {
        if let Some(cycle) = visit(start, &edges, &mut on_path, &mut done) {
            return model_err!(JunctionCycle, cycle);
        }
    }
    Ok(())
}

fn compartment_flags(var: &Variable) -> (bool, bool, bool) {
    match var {
        Variable::Compartment {
            is_source,
            is_sink,
            is_junction,
            ..
        } => (*is_source, *is_sink, *is_junction),
        _ => (false, false, false),
    }
}

fn parameter_units(var: &Variable) -> Units {
    match var {
        Variable::Parameter { units, .. } => *units,
        _ => Units::Unknown,
    }
}

/// Resolve every characteristic's includes/denominator, recording problems
/// on the variable.
fn check_characteristics(variables: &mut HashMap<Ident, Variable>) {
    let idents: Vec<Ident> = variables
        .keys()
        .filter(|k| variables[*k].is_characteristic())
        .cloned()
        .collect();

    for ident in idents {
        let (includes, denominator, pop_type) = match &variables[&ident] {
            Variable::Characteristic {
                includes,
                denominator,
                pop_type,
                ..
            } => (includes.clone(), denominator.clone(), pop_type.clone()),
            _ => unreachable!(),
        };

        let mut errors: Vec<EquationError> = Vec::new();
        let check = |name: &Ident, errors: &mut Vec<EquationError>| match variables.get(name)
        {
            Some(v) if v.is_compartment() || v.is_characteristic() => {
                if v.pop_type() != pop_type {
                    errors.push(eqn_error(ErrorCode::MismatchedPopulationTypes));
                }
            }
            _ => errors.push(eqn_error(ErrorCode::UnknownDependency)),
        };
        for name in includes.iter() {
            check(name, &mut errors);
        }
        if let Some(denom) = &denominator {
            check(denom, &mut errors);
        }

        for err in errors {
            variables.get_mut(&ident).unwrap().push_error(err);
        }
    }
}

/// Resolve every parameter expression's references: plain identifiers must
/// exist in the same population type; aggregations must cite a usable
/// interaction and a variable that exists at the far end of it.
fn check_parameter_references(
    variables: &mut HashMap<Ident, Variable>,
    interactions: &HashMap<Ident, datamodel::Interaction>,
) {
    let idents: Vec<Ident> = variables
        .keys()
        .filter(|k| variables[*k].is_parameter())
        .cloned()
        .collect();

    for ident in idents {
        let var = &variables[&ident];
        let pop_type = var.pop_type().to_owned();
        let ast = match var.ast() {
            Some(ast) => ast.clone(),
            None => continue,
        };

        let mut errors: Vec<EquationError> = Vec::new();

        let aggregations = var.aggregations();
        let agg_idents: HashSet<Ident> = aggregations
            .iter()
            .flat_map(|agg| {
                let mut ids = vec![agg.var.clone()];
                if let Some(w) = &agg.weight {
                    ids.push(w.clone());
                }
                ids
            })
            .collect();

        for agg in aggregations {
            // the population types the aggregated variable must live in
            let far_types: Vec<Ident> = match &agg.interaction {
                Some(name) => match interactions.get(name) {
                    Some(interaction) => {
                        let (near, far) = if agg.op.is_transposed() {
                            (&interaction.from_type, &interaction.to_type)
                        } else {
                            (&interaction.to_type, &interaction.from_type)
                        };
                        if near != &pop_type {
                            errors.push(eqn_error(ErrorCode::MismatchedPopulationTypes));
                            continue;
                        }
                        vec![far.clone()]
                    }
                    None => {
                        errors.push(eqn_error(ErrorCode::BadInteraction));
                        continue;
                    }
                },
                None => {
                    let far_types: Vec<Ident> = interactions
                        .values()
                        .filter(|i| {
                            let near = if agg.op.is_transposed() {
                                &i.from_type
                            } else {
                                &i.to_type
                            };
                            near == &pop_type
                        })
                        .map(|i| {
                            if agg.op.is_transposed() {
                                i.to_type.clone()
                            } else {
                                i.from_type.clone()
                            }
                        })
                        .collect();
                    if far_types.is_empty() {
                        errors.push(eqn_error(ErrorCode::BadInteraction));
                        continue;
                    }
                    far_types
                }
            };

            for far_type in far_types {
                match variables.get(&agg.var) {
                    Some(v) if v.pop_type() == far_type => (),
                    Some(_) => errors.push(eqn_error(ErrorCode::MismatchedPopulationTypes)),
                    None => errors.push(eqn_error(ErrorCode::UnknownDependency)),
                }
                if let Some(weight) = &agg.weight {
                    match variables.get(weight) {
                        Some(v) if v.pop_type() == far_type => (),
                        Some(_) => errors.push(eqn_error(ErrorCode::MismatchedPopulationTypes)),
                        None => errors.push(eqn_error(ErrorCode::UnknownDependency)),
                    }
                }
            }
        }

        // plain references resolve within the hosting population
        for dep in crate::variable::identifier_set(&ast) {
            if agg_idents.contains(&dep) {
                continue;
            }
            match variables.get(&dep) {
                Some(v) if v.pop_type() == pop_type => (),
                Some(_) => errors.push(eqn_error(ErrorCode::MismatchedPopulationTypes)),
                None => errors.push(eqn_error(ErrorCode::UnknownDependency)),
            }
        }

        for err in errors {
            variables.get_mut(&ident).unwrap().push_error(err);
        }
    }
}

fn eqn_error(code: ErrorCode) -> EquationError {
    EquationError {
        start: 0,
        end: 0,
        code,
    }
}

// to ensure we sort the list of variables in O(n*log(n)) time, we
// need to iterate over the set of variables we have and compute
// their recursive dependencies
fn all_deps(
    variables: &HashMap<Ident, Variable>,
) -> StdResult<HashMap<Ident, DependencySet>, (Ident, EquationError)> {
    let mut processing: BTreeSet<Ident> = BTreeSet::new();
    let mut all_var_deps: HashMap<Ident, Option<DependencySet>> = variables
        .values()
        .filter(|v| !v.is_compartment())
        .map(|v| (v.ident().to_owned(), None))
        .collect();

    fn all_deps_inner(
        variables: &HashMap<Ident, Variable>,
        id: &str,
        processing: &mut BTreeSet<Ident>,
        all_var_deps: &mut HashMap<Ident, Option<DependencySet>>,
    ) -> StdResult<(), (Ident, EquationError)> {
        let var = &variables[id];

        // short circuit if we've already figured this out
        if all_var_deps[id].is_some() {
            return Ok(());
        }

        processing.insert(id.to_owned());

        // all deps start out as the direct deps
        let mut all_deps: DependencySet = BTreeSet::new();

        for dep in var.direct_deps().into_iter() {
            if !variables.contains_key(&dep) {
                return Err((
                    var.ident().to_owned(),
                    EquationError {
                        start: 0,
                        end: 0,
                        code: ErrorCode::UnknownDependency,
                    },
                ));
            }

            // dependency chains break at compartments, as we use their
            // value from the last dt timestep
            if variables[&dep].is_compartment() {
                all_deps.insert(dep);
                continue;
            }

            if processing.contains(&dep) {
                return Err((
                    var.ident().to_owned(),
                    EquationError {
                        start: 0,
                        end: 0,
                        code: ErrorCode::CircularDependency,
                    },
                ));
            }

            all_deps_inner(variables, &dep, processing, all_var_deps)?;
            all_deps.extend(all_var_deps[&dep].as_ref().unwrap().iter().cloned());
            all_deps.insert(dep);
        }

        processing.remove(id);
        all_var_deps.insert(id.to_owned(), Some(all_deps));

        Ok(())
    }

    let idents: Vec<Ident> = all_var_deps.keys().cloned().collect();
    for ident in idents {
        all_deps_inner(variables, &ident, &mut processing, &mut all_var_deps)?;
    }

    Ok(all_var_deps
        .into_iter()
        .map(|(k, v)| (k, v.unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{
        charac, comp, framework, junction, param, param_expr, sink, source, transition,
    };

    #[test]
    fn test_duplicate_names() {
        let fw = framework(
            vec![comp("sus"), comp("sus")],
            vec![],
            vec![param("rate", Units::Probability)],
            vec![transition("sus", "sus", "rate")],
        );
        let err = Model::new(&fw).unwrap_err();
        assert_eq!(ErrorCode::DuplicateVariable, err.code);
    }

    #[test]
    fn test_unknown_reference() {
        let fw = framework(
            vec![comp("sus"), comp("inf")],
            vec![],
            vec![param_expr("foi", Units::Probability, "beta * missing")],
            vec![transition("sus", "inf", "foi")],
        );
        let err = Model::new(&fw).unwrap_err();
        assert_eq!(ErrorCode::VariablesHaveErrors, err.code);
    }

    #[test]
    fn test_circular_dependency() {
        let fw = framework(
            vec![comp("sus"), comp("inf")],
            vec![],
            vec![
                param_expr("a", Units::Unknown, "b + 1"),
                param_expr("b", Units::Unknown, "a + 1"),
                param_expr("foi", Units::Probability, "a"),
            ],
            vec![transition("sus", "inf", "foi")],
        );
        let err = Model::new(&fw).unwrap_err();
        assert_eq!(ErrorCode::CircularDependency, err.code);
    }

    #[test]
    fn test_cycle_through_compartment_is_fine() {
        // feedback through a compartment is broken by the timestep lag
        let fw = framework(
            vec![comp("sus"), comp("inf")],
            vec![],
            vec![param_expr("foi", Units::Probability, "0.3 * inf / (sus + inf)")],
            vec![transition("sus", "inf", "foi")],
        );
        assert!(Model::new(&fw).is_ok());
    }

    #[test]
    fn test_junction_outflow_units() {
        let fw = framework(
            vec![comp("x"), junction("j"), comp("y")],
            vec![],
            vec![
                param("into_j", Units::Probability),
                param("split", Units::Probability),
            ],
            vec![transition("x", "j", "into_j"), transition("j", "y", "split")],
        );
        let err = Model::new(&fw).unwrap_err();
        assert_eq!(ErrorCode::BadJunctionOutflow, err.code);
    }

    #[test]
    fn test_sink_and_source_legality() {
        let fw = framework(
            vec![source("births"), comp("sus"), sink("dead")],
            vec![],
            vec![param("death_rate", Units::Probability)],
            vec![transition("dead", "sus", "death_rate")],
        );
        let err = Model::new(&fw).unwrap_err();
        assert_eq!(ErrorCode::BadTransition, err.code);

        let fw = framework(
            vec![source("births"), comp("sus"), sink("dead")],
            vec![],
            vec![param("birth_rate", Units::Probability)],
            vec![transition("births", "sus", "birth_rate")],
        );
        let err = Model::new(&fw).unwrap_err();
        assert_eq!(ErrorCode::BadUnits, err.code);
    }

    #[test]
    fn test_junction_cycle_rejected() {
        let fw = framework(
            vec![comp("x"), junction("j1"), junction("j2")],
            vec![],
            vec![
                param("influx", Units::Number),
                param("fwd", Units::Proportion),
                param("back", Units::Proportion),
            ],
            vec![
                transition("x", "j1", "influx"),
                transition("j1", "j2", "fwd"),
                transition("j2", "j1", "back"),
            ],
        );
        let err = Model::new(&fw).unwrap_err();
        assert_eq!(ErrorCode::JunctionCycle, err.code);
    }

    #[test]
    fn test_run_order_and_dependent() {
        let fw = framework(
            vec![comp("sus"), comp("inf")],
            vec![charac("alive", &["sus", "inf"], None)],
            vec![
                param_expr("beta", Units::Unknown, "0.3"),
                param_expr("foi", Units::Probability, "beta * inf / alive"),
                param_expr("unused", Units::Unknown, "beta * 2"),
            ],
            vec![transition("sus", "inf", "foi")],
        );
        let model = Model::new(&fw).unwrap();

        assert!(model.is_dependent("foi"));
        assert!(model.is_dependent("beta"));
        assert!(model.is_dependent("alive"));
        assert!(!model.is_dependent("unused"));

        let order = &model.run_order;
        let pos = |name: &str| order.iter().position(|v| v == name).unwrap();
        assert!(pos("beta") < pos("foi"));
        assert!(pos("alive") < pos("foi"));
        assert!(!order.contains(&"unused".to_owned()));
        assert!(model.full_order.contains(&"unused".to_owned()));
    }
}
