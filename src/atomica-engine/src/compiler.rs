// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Construction of the integration graph: the typed network of
//! per-population compartments, characteristics, parameters, and links the
//! integrator advances.  Expressions are compiled to slot-addressed form
//! here so the inner loop never touches identifiers.

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DMatrix, DVector};
use smallvec::SmallVec;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::builtins::{AggOp, BuiltinFn};
use crate::common::{canonicalize, ErrorCode, Ident, Result, Warning};
use crate::datamodel::{Databook, Framework, Modality, TimeSeries, Units};
use crate::model::Model;
use crate::variable::Variable;
use crate::{data_err, model_err};

/// A compartment's address: population index and index within it.
#[derive(Copy, Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct CompRef {
    pub pop: usize,
    pub idx: usize,
}

/// A local slot within one population's arrays.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Slot {
    Comp(usize),
    Charac(usize),
    Par(usize),
}

/// A parameter expression with identifiers resolved to local slots.
/// Aggregations index into the owning parameter's plan list.
#[derive(Clone, PartialEq, Debug)]
pub enum CExpr {
    Const(f64),
    Var(Slot),
    App(BuiltinFn<CExpr>),
    Agg(usize),
    Op1(UnaryOp, Box<CExpr>),
    Op2(BinaryOp, Box<CExpr>, Box<CExpr>),
}

/// One operand of a cross-population aggregation: a variable slot in a
/// source (or target) population, with its combined static weight.
#[derive(Clone, PartialEq, Debug)]
pub struct AggTerm {
    pub pop: usize,
    pub slot: Slot,
    pub weight_slot: Option<Slot>,
    pub weight: f64,
}

#[derive(Clone, PartialEq, Debug)]
pub struct AggPlan {
    pub op: AggOp,
    pub terms: Vec<AggTerm>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct CompSpec {
    pub ident: Ident,
    pub is_source: bool,
    pub is_sink: bool,
    pub is_junction: bool,
    pub default_value: f64,
    pub setup: bool,
    pub inlinks: SmallVec<[usize; 4]>,
    pub outlinks: SmallVec<[usize; 4]>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct CharacSpec {
    pub ident: Ident,
    pub includes: Vec<Slot>,
    pub denominator: Option<Slot>,
    pub setup: bool,
    pub dependent: bool,
}

#[derive(Clone, PartialEq, Debug)]
pub struct ParSpec {
    pub ident: Ident,
    pub units: Units,
    pub expr: Option<CExpr>,
    pub aggs: Vec<AggPlan>,
    /// The databook series for this population, if any.
    pub data: Option<TimeSeries>,
    pub default_value: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub targetable: bool,
    pub modality: Modality,
    pub dependent: bool,
    /// Links driven by this parameter, as global link ids.
    pub links: SmallVec<[usize; 2]>,
    /// Synthetic parameters carry a transfer's per-pair series and are not
    /// part of the framework's parameter list.
    pub is_transfer: bool,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Link {
    pub src: CompRef,
    pub dst: CompRef,
    /// The driving parameter lives in the source population.
    pub par: usize,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Population {
    pub name: Ident,
    pub label: String,
    pub pop_type: Ident,
    pub comps: Vec<CompSpec>,
    pub characs: Vec<CharacSpec>,
    pub pars: Vec<ParSpec>,
}

impl Population {
    pub fn get_comp(&self, ident: &str) -> Option<usize> {
        self.comps.iter().position(|c| c.ident == ident)
    }

    pub fn get_charac(&self, ident: &str) -> Option<usize> {
        self.characs.iter().position(|c| c.ident == ident)
    }

    pub fn get_par(&self, ident: &str) -> Option<usize> {
        self.pars.iter().position(|p| p.ident == ident)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StepKind {
    Charac,
    Par,
}

/// One entry of the per-timestep evaluation order: a variable name resolved
/// to its instances across populations.
#[derive(Clone, PartialEq, Debug)]
pub struct RunStep {
    pub ident: Ident,
    pub kind: StepKind,
    pub targets: Vec<(usize, usize)>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct IntegrationGraph {
    pub model: Model,
    pub pops: Vec<Population>,
    pub pops_of_type: BTreeMap<Ident, Vec<usize>>,
    pub links: Vec<Link>,
    /// Dependent variables in evaluation order, computed every timestep.
    pub run_steps: Vec<RunStep>,
    /// All characteristics and parameters in evaluation order, for the
    /// vectorized post-run pass.
    pub full_steps: Vec<RunStep>,
    /// Initial compartment sizes solved from the databook's setup values,
    /// before the initial junction flush.
    pub initial_defaults: Vec<Vec<f64>>,
}

impl IntegrationGraph {
    pub fn get_pop(&self, name: &str) -> Option<usize> {
        self.pops.iter().position(|p| p.name == name)
    }
}

/// The per-population-type slot layout shared by every population of that
/// type.
struct TypeLayout {
    index: HashMap<Ident, Slot>,
}

impl TypeLayout {
    fn new(model: &Model, pop_type: &str) -> Self {
        let mut index = HashMap::new();
        if let Some(comps) = model.comps.get(pop_type) {
            for (i, ident) in comps.iter().enumerate() {
                index.insert(ident.clone(), Slot::Comp(i));
            }
        }
        if let Some(characs) = model.characs.get(pop_type) {
            for (i, ident) in characs.iter().enumerate() {
                index.insert(ident.clone(), Slot::Charac(i));
            }
        }
        if let Some(pars) = model.pars.get(pop_type) {
            for (i, ident) in pars.iter().enumerate() {
                index.insert(ident.clone(), Slot::Par(i));
            }
        }
        TypeLayout { index }
    }

    fn get(&self, ident: &str) -> Option<Slot> {
        self.index.get(ident).copied()
    }
}

/// Build the integration graph for a framework/databook pair.  The databook
/// binds populations, data series, transfers, and interaction weights to the
/// validated framework structure.
pub fn build_model(framework: &Framework, databook: &Databook) -> Result<IntegrationGraph> {
    let model = Model::new(framework)?;
    build(model, databook)
}

pub(crate) fn build(model: Model, databook: &Databook) -> Result<IntegrationGraph> {
    let layouts: HashMap<Ident, TypeLayout> = model
        .pop_types
        .iter()
        .map(|pt| {
            let name = canonicalize(&pt.name);
            let layout = TypeLayout::new(&model, &name);
            (name, layout)
        })
        .collect();

    // 1. instantiate populations
    let mut pops: Vec<Population> = Vec::with_capacity(databook.populations.len());
    let mut pops_of_type: BTreeMap<Ident, Vec<usize>> = BTreeMap::new();
    for decl in databook.populations.iter() {
        let name = canonicalize(&decl.name);
        let pop_type = canonicalize(&decl.pop_type);
        if pops.iter().any(|p| p.name == name) {
            return data_err!(DuplicateVariable, name);
        }
        if !layouts.contains_key(&pop_type) {
            return data_err!(BadPopulationType, format!("{}: {}", name, pop_type));
        }
        pops_of_type.entry(pop_type.clone()).or_default().push(pops.len());
        pops.push(Population {
            name,
            label: decl.label.clone(),
            pop_type,
            comps: Vec::new(),
            characs: Vec::new(),
            pars: Vec::new(),
        });
    }

    // 2. instantiate compartments, characteristics, and parameters
    for pop in pops.iter_mut() {
        let empty: Vec<Ident> = Vec::new();
        let layout = &layouts[&pop.pop_type];

        for ident in model.comps.get(&pop.pop_type).unwrap_or(&empty) {
            let var = &model.variables[ident];
            if let Variable::Compartment {
                is_source,
                is_sink,
                is_junction,
                default_value,
                setup,
                ..
            } = var
            {
                pop.comps.push(CompSpec {
                    ident: ident.clone(),
                    is_source: *is_source,
                    is_sink: *is_sink,
                    is_junction: *is_junction,
                    default_value: default_value.unwrap_or(0.0),
                    setup: *setup,
                    inlinks: SmallVec::new(),
                    outlinks: SmallVec::new(),
                });
            }
        }

        for ident in model.characs.get(&pop.pop_type).unwrap_or(&empty) {
            let var = &model.variables[ident];
            if let Variable::Characteristic {
                includes,
                denominator,
                setup,
                ..
            } = var
            {
                pop.characs.push(CharacSpec {
                    ident: ident.clone(),
                    includes: includes
                        .iter()
                        .map(|name| layout.get(name).unwrap())
                        .collect(),
                    denominator: denominator.as_ref().map(|name| layout.get(name).unwrap()),
                    setup: *setup,
                    dependent: model.is_dependent(ident),
                });
            }
        }
    }

    // parameters want aggregation plans, which need the full population
    // list; build them in a second pass
    for pop_idx in 0..pops.len() {
        let pop_type = pops[pop_idx].pop_type.clone();
        let layout = &layouts[&pop_type];
        let empty: Vec<Ident> = Vec::new();

        let mut pars: Vec<ParSpec> = Vec::new();
        for ident in model.pars.get(&pop_type).unwrap_or(&empty) {
            let var = &model.variables[ident];
            if let Variable::Parameter {
                units,
                ast,
                default_value,
                min_value,
                max_value,
                targetable,
                modality,
                ..
            } = var
            {
                let mut aggs: Vec<AggPlan> = Vec::new();
                let expr = match ast {
                    Some(ast) => Some(compile_expr(
                        ast,
                        layout,
                        &model,
                        &layouts,
                        &pops,
                        &pops_of_type,
                        databook,
                        pop_idx,
                        &mut aggs,
                    )?),
                    None => None,
                };

                let data = databook
                    .data
                    .get(ident)
                    .and_then(|per_pop| per_pop.get(&pops[pop_idx].name))
                    .filter(|series| series.has_data())
                    .cloned();
                if expr.is_none() && data.is_none() && default_value.is_none() {
                    return data_err!(
                        MissingData,
                        format!("{} in {}", ident, pops[pop_idx].name)
                    );
                }

                pars.push(ParSpec {
                    ident: ident.clone(),
                    units: *units,
                    expr,
                    aggs,
                    data,
                    default_value: *default_value,
                    min_value: *min_value,
                    max_value: *max_value,
                    targetable: *targetable,
                    modality: *modality,
                    dependent: model.is_dependent(ident),
                    links: SmallVec::new(),
                    is_transfer: false,
                });
            }
        }
        pops[pop_idx].pars = pars;
    }

    // 3. links from transitions, one per population of the matching type
    let mut links: Vec<Link> = Vec::new();
    for (pop_idx, pop) in pops.iter_mut().enumerate() {
        for transition in model.transitions.iter() {
            if transition.pop_type != pop.pop_type {
                continue;
            }
            let src = pop.get_comp(&transition.from).unwrap();
            let dst = pop.get_comp(&transition.to).unwrap();
            let par = pop.get_par(&transition.parameter).unwrap();
            let link_id = links.len();
            links.push(Link {
                src: CompRef { pop: pop_idx, idx: src },
                dst: CompRef { pop: pop_idx, idx: dst },
                par,
            });
            pop.comps[src].outlinks.push(link_id);
            pop.comps[dst].inlinks.push(link_id);
            pop.pars[par].links.push(link_id);
        }
    }

    // 4. transfer links between populations of the same type, one per
    // ordinary compartment, driven by a synthetic parameter carrying the
    // transfer's per-pair series
    for transfer in databook.transfers.iter() {
        let name = canonicalize(&transfer.name);
        if !matches!(transfer.units, Units::Number | Units::Probability) {
            return data_err!(BadTransfer, name);
        }
        for entry in transfer.entries.iter() {
            let from_pop = canonicalize(&entry.from_pop);
            let to_pop = canonicalize(&entry.to_pop);
            let from = match pops.iter().position(|p| p.name == from_pop) {
                Some(idx) => idx,
                None => return data_err!(BadTransfer, format!("{}: {}", name, from_pop)),
            };
            let to = match pops.iter().position(|p| p.name == to_pop) {
                Some(idx) => idx,
                None => return data_err!(BadTransfer, format!("{}: {}", name, to_pop)),
            };
            if from == to || pops[from].pop_type != pops[to].pop_type {
                return data_err!(BadTransfer, format!("{}: {} -> {}", name, from_pop, to_pop));
            }
            if !entry.series.has_data() {
                return data_err!(MissingData, format!("{}: {} -> {}", name, from_pop, to_pop));
            }

            let par_ident = format!("{}_{}_to_{}", name, from_pop, to_pop);
            let par_idx = pops[from].pars.len();
            pops[from].pars.push(ParSpec {
                ident: par_ident,
                units: transfer.units,
                expr: None,
                aggs: Vec::new(),
                data: Some(entry.series.clone()),
                default_value: None,
                min_value: None,
                max_value: None,
                targetable: false,
                modality: Modality::Additive,
                dependent: true,
                links: SmallVec::new(),
                is_transfer: true,
            });

            let n_comps = pops[from].comps.len();
            for comp_idx in 0..n_comps {
                let spec = &pops[from].comps[comp_idx];
                if spec.is_source || spec.is_sink || spec.is_junction {
                    continue;
                }
                let link_id = links.len();
                links.push(Link {
                    src: CompRef { pop: from, idx: comp_idx },
                    dst: CompRef { pop: to, idx: comp_idx },
                    par: par_idx,
                });
                pops[from].comps[comp_idx].outlinks.push(link_id);
                pops[to].comps[comp_idx].inlinks.push(link_id);
                pops[from].pars[par_idx].links.push(link_id);
            }
        }
    }

    // 5. interaction weight tables must refer to declared interactions and
    // known populations of the declared types
    for weights in databook.interactions.iter() {
        let name = canonicalize(&weights.name);
        let interaction = match model.interactions.get(&name) {
            Some(interaction) => interaction,
            None => return data_err!(BadInteraction, name),
        };
        for entry in weights.entries.iter() {
            let from_pop = canonicalize(&entry.from_pop);
            let to_pop = canonicalize(&entry.to_pop);
            let from = match pops.iter().find(|p| p.name == from_pop) {
                Some(pop) => pop,
                None => return data_err!(BadInteraction, format!("{}: {}", name, from_pop)),
            };
            let to = match pops.iter().find(|p| p.name == to_pop) {
                Some(pop) => pop,
                None => return data_err!(BadInteraction, format!("{}: {}", name, to_pop)),
            };
            if from.pop_type != interaction.from_type || to.pop_type != interaction.to_type {
                return data_err!(
                    BadInteraction,
                    format!("{}: {} -> {}", name, from_pop, to_pop)
                );
            }
        }
    }

    // 6. evaluation orders resolved to slots
    let resolve_steps = |order: &[Ident]| -> Vec<RunStep> {
        order
            .iter()
            .map(|ident| {
                let var = &model.variables[ident];
                let kind = if var.is_characteristic() {
                    StepKind::Charac
                } else {
                    StepKind::Par
                };
                let targets: Vec<(usize, usize)> = pops_of_type
                    .get(var.pop_type())
                    .map(|pop_idxs| {
                        pop_idxs
                            .iter()
                            .map(|pop_idx| {
                                let pop = &pops[*pop_idx];
                                let idx = match kind {
                                    StepKind::Charac => pop.get_charac(ident).unwrap(),
                                    StepKind::Par => pop.get_par(ident).unwrap(),
                                };
                                (*pop_idx, idx)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                RunStep {
                    ident: ident.clone(),
                    kind,
                    targets,
                }
            })
            .collect()
    };
    let run_steps = resolve_steps(&model.run_order);
    let full_steps = resolve_steps(&model.full_order);

    let mut graph = IntegrationGraph {
        model,
        pops,
        pops_of_type,
        links,
        run_steps,
        full_steps,
        initial_defaults: Vec::new(),
    };

    // 7. solve initial compartment sizes from the databook's setup values,
    // which both validates the setup system and gives `run` its defaults
    let mut warnings: Vec<Warning> = Vec::new();
    let mut initial_defaults = Vec::with_capacity(graph.pops.len());
    for pop_idx in 0..graph.pops.len() {
        let pop_name = graph.pops[pop_idx].name.clone();
        let values = |ident: &str| -> Option<f64> {
            databook
                .data
                .get(ident)
                .and_then(|per_pop| per_pop.get(&pop_name))
                .and_then(|series| series.interpolate(f64::NEG_INFINITY))
        };
        initial_defaults.push(solve_initial(&graph, pop_idx, &values, &mut warnings)?);
    }
    graph.initial_defaults = initial_defaults;

    Ok(graph)
}

/// Expand a characteristic into compartment coefficients, following nested
/// characteristic includes down to compartments.
fn charac_coefficients(pop: &Population, charac: &CharacSpec, coeffs: &mut [f64]) {
    for slot in charac.includes.iter() {
        match slot {
            Slot::Comp(idx) => coeffs[*idx] += 1.0,
            Slot::Charac(idx) => charac_coefficients(pop, &pop.characs[*idx], coeffs),
            Slot::Par(_) => unreachable!(),
        }
    }
}

fn denominator_coefficients(pop: &Population, slot: Slot, coeffs: &mut [f64]) {
    match slot {
        Slot::Comp(idx) => coeffs[idx] += 1.0,
        Slot::Charac(idx) => charac_coefficients(pop, &pop.characs[idx], coeffs),
        Slot::Par(_) => unreachable!(),
    }
}

/// Solve one population's initial compartment sizes.
///
/// Setup characteristics contribute rows expressing their value as a linear
/// combination of compartment sizes (for fractions, `sum(includes) - value *
/// sum(denominator) = 0`); setup compartments pin their size directly.  The
/// system is solved least-squares; an inconsistent over-determined system is
/// a fatal error, compartments untouched by any row take their framework
/// default, and negative solutions are clamped to zero with a warning.
pub(crate) fn solve_initial(
    graph: &IntegrationGraph,
    pop_idx: usize,
    values: &dyn Fn(&str) -> Option<f64>,
    warnings: &mut Vec<Warning>,
) -> Result<Vec<f64>> {
    let pop = &graph.pops[pop_idx];
    let n = pop.comps.len();

    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut rhs: Vec<f64> = Vec::new();

    for (idx, comp) in pop.comps.iter().enumerate() {
        if !comp.setup {
            continue;
        }
        let value = match values(&comp.ident) {
            Some(v) => v,
            None => {
                return data_err!(
                    MissingData,
                    format!("{} in {}", comp.ident, pop.name)
                );
            }
        };
        let mut row = vec![0.0; n];
        row[idx] = 1.0;
        rows.push(row);
        rhs.push(value);
    }

    for charac in pop.characs.iter() {
        if !charac.setup {
            continue;
        }
        let value = match values(&charac.ident) {
            Some(v) => v,
            None => {
                return data_err!(
                    MissingData,
                    format!("{} in {}", charac.ident, pop.name)
                );
            }
        };
        let mut row = vec![0.0; n];
        charac_coefficients(pop, charac, &mut row);
        match charac.denominator {
            Some(denom) => {
                // fraction: sum(includes) - value * sum(denominator) = 0
                let mut denom_coeffs = vec![0.0; n];
                denominator_coefficients(pop, denom, &mut denom_coeffs);
                for (coeff, denom_coeff) in row.iter_mut().zip(denom_coeffs.iter()) {
                    *coeff -= value * denom_coeff;
                }
                rows.push(row);
                rhs.push(0.0);
            }
            None => {
                rows.push(row);
                rhs.push(value);
            }
        }
    }

    let mut result = vec![0.0; n];

    if !rows.is_empty() {
        let n_rows = rows.len();
        let a = DMatrix::from_fn(n_rows, n, |r, c| rows[r][c]);
        let b = DVector::from_iterator(n_rows, rhs.iter().cloned());
        let svd = a.clone().svd(true, true);
        let x = match svd.solve(&b, 1e-12) {
            Ok(x) => x,
            Err(_) => {
                return data_err!(BadInitialization, pop.name.clone());
            }
        };

        let scale = b.amax().max(1.0);
        let residual = (&a * &x - &b).amax();
        if residual > 1e-6 * scale {
            return data_err!(BadInitialization, pop.name.clone());
        }

        for idx in 0..n {
            result[idx] = x[idx];
        }

        // compartments no setup row touches take their framework default
        for idx in 0..n {
            if a.column(idx).iter().all(|coeff| *coeff == 0.0) {
                result[idx] = pop.comps[idx].default_value;
            }
        }
    } else {
        for (idx, comp) in pop.comps.iter().enumerate() {
            result[idx] = comp.default_value;
        }
    }

    for (idx, comp) in pop.comps.iter().enumerate() {
        if comp.is_source {
            result[idx] = 0.0;
            continue;
        }
        if result[idx] < 0.0 {
            if result[idx] < -1e-9 {
                warnings.push(Warning {
                    code: ErrorCode::NegativeCompartment,
                    t: None,
                    details: Some(format!("initial {} in {}", comp.ident, pop.name)),
                });
            }
            result[idx] = 0.0;
        }
    }

    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn compile_expr(
    expr: &Expr,
    layout: &TypeLayout,
    model: &Model,
    layouts: &HashMap<Ident, TypeLayout>,
    pops: &[Population],
    pops_of_type: &BTreeMap<Ident, Vec<usize>>,
    databook: &Databook,
    pop_idx: usize,
    aggs: &mut Vec<AggPlan>,
) -> Result<CExpr> {
    let result = match expr {
        Expr::Const(n, _) => CExpr::Const(*n),
        Expr::Var(ident, _) => match layout.get(ident) {
            Some(slot) => CExpr::Var(slot),
            None => return model_err!(UnknownDependency, ident.clone()),
        },
        Expr::App(builtin, _) => {
            let mut sub = |e: &Expr| -> Result<Box<CExpr>> {
                Ok(Box::new(compile_expr(
                    e,
                    layout,
                    model,
                    layouts,
                    pops,
                    pops_of_type,
                    databook,
                    pop_idx,
                    aggs,
                )?))
            };
            let builtin = match builtin {
                BuiltinFn::Abs(a) => BuiltinFn::Abs(sub(a)?),
                BuiltinFn::Exp(a) => BuiltinFn::Exp(sub(a)?),
                BuiltinFn::Ln(a) => BuiltinFn::Ln(sub(a)?),
                BuiltinFn::Sqrt(a) => BuiltinFn::Sqrt(sub(a)?),
                BuiltinFn::Floor(a) => BuiltinFn::Floor(sub(a)?),
                BuiltinFn::Ceil(a) => BuiltinFn::Ceil(sub(a)?),
                BuiltinFn::Min(a, b) => BuiltinFn::Min(sub(a)?, sub(b)?),
                BuiltinFn::Max(a, b) => BuiltinFn::Max(sub(a)?, sub(b)?),
                BuiltinFn::If(c, t, f) => BuiltinFn::If(sub(c)?, sub(t)?, sub(f)?),
            };
            CExpr::App(builtin)
        }
        Expr::Agg(agg, _) => {
            let host_type = &pops[pop_idx].pop_type;
            let host_name = &pops[pop_idx].name;

            let interactions: Vec<&crate::datamodel::Interaction> = match &agg.interaction {
                Some(name) => vec![&model.interactions[name]],
                None => model.aggregation_interactions(agg.op, host_type),
            };

            let mut terms: Vec<AggTerm> = Vec::new();
            for interaction in interactions {
                let far_type = if agg.op.is_transposed() {
                    &interaction.to_type
                } else {
                    &interaction.from_type
                };
                let far_layout = &layouts[far_type];
                let slot = match far_layout.get(&agg.var) {
                    Some(slot) => slot,
                    None => return model_err!(UnknownDependency, agg.var.clone()),
                };
                let weight_slot = match &agg.weight {
                    Some(weight) => match far_layout.get(weight) {
                        Some(slot) => Some(slot),
                        None => return model_err!(UnknownDependency, weight.clone()),
                    },
                    None => None,
                };

                let weight_entries = databook
                    .interactions
                    .iter()
                    .find(|w| canonicalize(&w.name) == interaction.name);

                let empty: Vec<usize> = Vec::new();
                for far_pop_idx in pops_of_type.get(far_type).unwrap_or(&empty) {
                    let far_name = &pops[*far_pop_idx].name;
                    // interaction edges run from_pop -> to_pop; the host is
                    // on the `to` side for Src ops and the `from` side for
                    // the transposed Tgt ops
                    let weight = weight_entries
                        .map(|weights| {
                            weights
                                .entries
                                .iter()
                                .filter(|e| {
                                    let (from, to) = if agg.op.is_transposed() {
                                        (host_name.as_str(), far_name.as_str())
                                    } else {
                                        (far_name.as_str(), host_name.as_str())
                                    };
                                    canonicalize(&e.from_pop) == from
                                        && canonicalize(&e.to_pop) == to
                                })
                                .map(|e| e.weight)
                                .sum::<f64>()
                        })
                        .unwrap_or(0.0);
                    if weight == 0.0 {
                        continue;
                    }
                    terms.push(AggTerm {
                        pop: *far_pop_idx,
                        slot,
                        weight_slot,
                        weight,
                    });
                }
            }

            let plan_idx = aggs.len();
            aggs.push(AggPlan { op: agg.op, terms });
            CExpr::Agg(plan_idx)
        }
        Expr::Op1(op, l, _) => CExpr::Op1(
            *op,
            Box::new(compile_expr(
                l,
                layout,
                model,
                layouts,
                pops,
                pops_of_type,
                databook,
                pop_idx,
                aggs,
            )?),
        ),
        Expr::Op2(op, l, r, _) => CExpr::Op2(
            *op,
            Box::new(compile_expr(
                l,
                layout,
                model,
                layouts,
                pops,
                pops_of_type,
                databook,
                pop_idx,
                aggs,
            )?),
            Box::new(compile_expr(
                r,
                layout,
                model,
                layouts,
                pops,
                pops_of_type,
                databook,
                pop_idx,
                aggs,
            )?),
        ),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::Units;
    use crate::testutils::{
        charac, comp, databook, framework, param, param_expr, pop, setup_charac, setup_comp,
        transfer, transition,
    };

    fn sir() -> (Framework, Databook) {
        let fw = framework(
            vec![setup_comp("sus"), setup_comp("inf"), comp("rec")],
            vec![charac("alive", &["sus", "inf", "rec"], None)],
            vec![
                param_expr("foi", Units::Probability, "0.3 * inf / alive"),
                param("rec_rate", Units::Probability),
            ],
            vec![
                transition("sus", "inf", "foi"),
                transition("inf", "rec", "rec_rate"),
            ],
        );
        let db = databook(
            vec![pop("adults")],
            &[
                ("sus", "adults", 900.0),
                ("inf", "adults", 100.0),
                ("rec_rate", "adults", 0.2),
            ],
        );
        (fw, db)
    }

    #[test]
    fn test_build_sir() {
        let (fw, db) = sir();
        let graph = build_model(&fw, &db).unwrap();

        assert_eq!(1, graph.pops.len());
        let pop = &graph.pops[0];
        assert_eq!(3, pop.comps.len());
        assert_eq!(1, pop.characs.len());
        assert_eq!(2, pop.pars.len());
        assert_eq!(2, graph.links.len());

        let sus = pop.get_comp("sus").unwrap();
        let inf = pop.get_comp("inf").unwrap();
        assert_eq!(1, pop.comps[sus].outlinks.len());
        assert_eq!(1, pop.comps[inf].inlinks.len());
        assert_eq!(1, pop.comps[inf].outlinks.len());

        let init = &graph.initial_defaults[0];
        assert!((init[0] - 900.0).abs() < 1e-6);
        assert!((init[1] - 100.0).abs() < 1e-6);
        assert!(init[2].abs() < 1e-6);
    }

    #[test]
    fn test_build_idempotent() {
        let (fw, db) = sir();
        let a = build_model(&fw, &db).unwrap();
        let b = build_model(&fw, &db).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_data() {
        let (fw, mut db) = sir();
        db.data.remove("rec_rate");
        let err = build_model(&fw, &db).unwrap_err();
        assert_eq!(ErrorCode::MissingData, err.code);
    }

    #[test]
    fn test_characteristic_initialization() {
        // alive and prevalence determine sus and inf
        let fw = framework(
            vec![comp("sus"), comp("inf")],
            vec![
                setup_charac("alive", &["sus", "inf"], None),
                setup_charac("prev", &["inf"], Some("alive")),
            ],
            vec![param("rate", Units::Probability)],
            vec![transition("sus", "inf", "rate")],
        );
        let db = databook(
            vec![pop("adults")],
            &[
                ("alive", "adults", 1000.0),
                ("prev", "adults", 0.1),
                ("rate", "adults", 0.1),
            ],
        );
        let graph = build_model(&fw, &db).unwrap();
        let init = &graph.initial_defaults[0];
        let sus = graph.pops[0].get_comp("sus").unwrap();
        let inf = graph.pops[0].get_comp("inf").unwrap();
        assert!((init[sus] - 900.0).abs() < 1e-6);
        assert!((init[inf] - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_inconsistent_initialization() {
        // two setup rows pin the same compartment to different values
        let fw = framework(
            vec![setup_comp("sus"), comp("inf")],
            vec![setup_charac("alive", &["sus"], None)],
            vec![param("rate", Units::Probability)],
            vec![transition("sus", "inf", "rate")],
        );
        let db = databook(
            vec![pop("adults")],
            &[
                ("sus", "adults", 100.0),
                ("alive", "adults", 500.0),
                ("rate", "adults", 0.1),
            ],
        );
        let err = build_model(&fw, &db).unwrap_err();
        assert_eq!(ErrorCode::BadInitialization, err.code);
    }

    #[test]
    fn test_transfer_links() {
        let (fw, mut db) = sir();
        db.populations.push(pop("kids"));
        for series in db.data.values_mut() {
            let v = series.values().next().unwrap().clone();
            series.insert("kids".to_string(), v);
        }
        db.transfers.push(transfer(
            "aging",
            Units::Number,
            vec![("kids", "adults", TimeSeries::constant(50.0))],
        ));
        let graph = build_model(&fw, &db).unwrap();

        let kids = graph.get_pop("kids").unwrap();
        let adults = graph.get_pop("adults").unwrap();
        let aging = graph.pops[kids].get_par("aging_kids_to_adults").unwrap();
        let spec = &graph.pops[kids].pars[aging];
        assert!(spec.is_transfer);
        // one link per ordinary compartment
        assert_eq!(3, spec.links.len());
        for link_id in spec.links.iter() {
            let link = &graph.links[*link_id];
            assert_eq!(kids, link.src.pop);
            assert_eq!(adults, link.dst.pop);
            assert_eq!(link.src.idx, link.dst.idx);
        }
    }

    #[test]
    fn test_transfer_requires_same_type() {
        let (fw, mut db) = sir();
        db.transfers.push(transfer(
            "aging",
            Units::Number,
            vec![("adults", "adults", TimeSeries::constant(50.0))],
        ));
        let err = build_model(&fw, &db).unwrap_err();
        assert_eq!(ErrorCode::BadTransfer, err.code);
    }
}
