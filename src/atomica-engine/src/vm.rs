// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The integrator: advances an integration graph one timestep at a time,
//! applying unit conversions, the outflow constraint, junction flushing,
//! and the program overlay.
//!
//! All state lives in preallocated per-variable arrays indexed `[t]`; the
//! inner loop does not allocate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use float_cmp::approx_eq;
use smallvec::SmallVec;

use crate::ast::{BinaryOp, UnaryOp};
use crate::builtins::BuiltinFn;
use crate::common::{Error, ErrorCode, ErrorKind, Result, Warning};
use crate::compiler::{
    solve_initial, CExpr, IntegrationGraph, ParSpec, Slot, StepKind,
};
use crate::datamodel::{JunctionFallback, ProgramInstructions, SimSpecs, Units};
use crate::model_err;
use crate::parset::ParSet;
use crate::programs::{ProgramSet, ProgramState};
use crate::results::{
    LinkResults, NamedSeries, PopulationResults, ProgramResults, Results, RunStatus,
};

pub(crate) fn is_truthy(n: f64) -> bool {
    let is_false = approx_eq!(f64, n, 0.0);
    !is_false
}

#[derive(Default)]
pub struct RunOptions<'a> {
    pub progset: Option<&'a ProgramSet>,
    pub instructions: Option<&'a ProgramInstructions>,
    pub abort_flag: Option<Arc<AtomicBool>>,
}

/// Accumulates integration warnings, keeping only the first occurrence of
/// each (code, detail) pair so a warning inside the inner loop cannot
/// balloon the result.
struct WarningLog {
    warnings: Vec<Warning>,
    seen: HashSet<(ErrorCode, String)>,
}

impl WarningLog {
    fn new() -> Self {
        WarningLog {
            warnings: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn push(&mut self, code: ErrorCode, t: Option<f64>, details: String) {
        if self.seen.insert((code, details.clone())) {
            self.warnings.push(Warning {
                code,
                t,
                details: Some(details),
            });
        }
    }
}

struct Vm<'a> {
    graph: &'a IntegrationGraph,
    parset: &'a ParSet,
    times: Vec<f64>,
    dt: f64,
    /// `[pop][comp][t]`
    comps: Vec<Vec<Vec<f64>>>,
    /// `[pop][charac][t]`
    characs: Vec<Vec<Vec<f64>>>,
    /// `[pop][par][t]`
    pars: Vec<Vec<Vec<f64>>>,
    /// `[link][t]`
    links: Vec<Vec<f64>>,
    programs: Option<ProgramState<'a>>,
    warnings: WarningLog,
}

/// Run the integrator over `[specs.start, specs.stop]`.
///
/// Configuration problems (bad specs, missing parameter-set data) are
/// returned as `Err`; integration errors and cancellation produce an `Ok`
/// partial result tagged `Failed` or `Cancelled`.
pub fn run(
    graph: &IntegrationGraph,
    parset: &ParSet,
    specs: &SimSpecs,
    options: RunOptions,
) -> Result<Results> {
    if !(specs.dt > 0.0) || !(specs.stop > specs.start) {
        return model_err!(
            BadSimSpecs,
            format!("start {}, stop {}, dt {}", specs.start, specs.stop, specs.dt)
        );
    }

    let mut vm = Vm::new(graph, parset, specs, options.progset, options.instructions)?;
    let status = vm.integrate(options.abort_flag);
    vm.finalize_lazy_variables();
    Ok(vm.into_results(status))
}

impl<'a> Vm<'a> {
    fn new(
        graph: &'a IntegrationGraph,
        parset: &'a ParSet,
        specs: &SimSpecs,
        progset: Option<&'a ProgramSet>,
        instructions: Option<&ProgramInstructions>,
    ) -> Result<Vm<'a>> {
        let times = specs.time_vector();
        let npts = times.len();

        let mut comps = Vec::with_capacity(graph.pops.len());
        let mut characs = Vec::with_capacity(graph.pops.len());
        let mut pars = Vec::with_capacity(graph.pops.len());
        for pop in graph.pops.iter() {
            comps.push(vec![vec![0.0; npts]; pop.comps.len()]);
            characs.push(vec![vec![0.0; npts]; pop.characs.len()]);
            pars.push(vec![vec![0.0; npts]; pop.pars.len()]);
        }
        let links = vec![vec![0.0; npts]; graph.links.len()];

        let programs = match progset {
            Some(set) => Some(ProgramState::new(set, instructions, &times)?),
            None => None,
        };

        let mut vm = Vm {
            graph,
            parset,
            times,
            dt: specs.dt,
            comps,
            characs,
            pars,
            links,
            programs,
            warnings: WarningLog::new(),
        };
        vm.prefill_data_parameters()?;
        vm.initialize_compartments()?;
        Ok(vm)
    }

    /// Interpolate every data-driven parameter's series onto the grid.
    /// Values are raw: y-factors and limits apply in `update_parameters`
    /// for dependent parameters and in the lazy pass for the rest.
    fn prefill_data_parameters(&mut self) -> Result<()> {
        for (pop_idx, pop) in self.graph.pops.iter().enumerate() {
            for (par_idx, spec) in pop.pars.iter().enumerate() {
                if spec.expr.is_some() {
                    continue;
                }
                let series = if spec.is_transfer {
                    spec.data.as_ref()
                } else {
                    self.parset
                        .get_series(&spec.ident, &pop.name)
                        .filter(|s| s.has_data())
                        .or(spec.data.as_ref())
                };
                let vals = match series.and_then(|s| s.sample_onto(&self.times)) {
                    Some(vals) => vals,
                    None => match spec.default_value {
                        Some(value) => vec![value; self.times.len()],
                        None => {
                            return Err(Error::new(
                                ErrorKind::Data,
                                ErrorCode::MissingData,
                                Some(format!("{} in {}", spec.ident, pop.name)),
                            ));
                        }
                    },
                };
                self.pars[pop_idx][par_idx] = vals;
            }
        }
        Ok(())
    }

    /// Solve initial compartment sizes from the parameter set's setup
    /// values at the start of the run.
    fn initialize_compartments(&mut self) -> Result<()> {
        let t0 = self.times[0];
        for pop_idx in 0..self.graph.pops.len() {
            let pop_name = &self.graph.pops[pop_idx].name;
            let parset = self.parset;
            let values = |ident: &str| parset.value_at(ident, pop_name, t0);
            let solved = solve_initial(
                self.graph,
                pop_idx,
                &values,
                &mut self.warnings.warnings,
            )?;
            for (comp_idx, value) in solved.into_iter().enumerate() {
                self.comps[pop_idx][comp_idx][0] = value;
            }
        }
        Ok(())
    }

    fn integrate(&mut self, abort_flag: Option<Arc<AtomicBool>>) -> RunStatus {
        let npts = self.times.len();

        self.update_parameters(0);
        if let Err(err) = self.flush_initial_junctions() {
            return self.fail(err);
        }
        self.update_links(0);
        if let Err(err) = self.update_junctions(0) {
            return self.fail(err);
        }

        for ti in 1..npts {
            if let Some(flag) = &abort_flag {
                if flag.load(Ordering::Relaxed) {
                    self.warnings
                        .push(ErrorCode::Cancelled, Some(self.times[ti]), "aborted".to_string());
                    return RunStatus::Cancelled;
                }
            }

            if let Err(err) = self.update_compartments(ti) {
                return self.fail(err);
            }
            self.update_parameters(ti);
            self.update_links(ti);
            if let Err(err) = self.update_junctions(ti) {
                return self.fail(err);
            }
        }

        RunStatus::Completed
    }

    fn fail(&mut self, err: Error) -> RunStatus {
        self.warnings
            .push(err.code, None, err.get_details().unwrap_or_default());
        RunStatus::Failed
    }

    /// Step compartment stocks forward: new size is the old size plus the
    /// net of the flows that ran over `[t-1, t]`.  Junctions stay at zero
    /// and sources hold an unbounded reservoir.
    fn update_compartments(&mut self, ti: usize) -> Result<()> {
        let t = self.times[ti];
        for (pop_idx, pop) in self.graph.pops.iter().enumerate() {
            for (comp_idx, spec) in pop.comps.iter().enumerate() {
                if spec.is_junction || spec.is_source {
                    continue;
                }
                let prev = self.comps[pop_idx][comp_idx][ti - 1];
                let inflow: f64 = spec
                    .inlinks
                    .iter()
                    .map(|l| self.links[*l][ti - 1])
                    .sum();
                let outflow: f64 = spec
                    .outlinks
                    .iter()
                    .map(|l| self.links[*l][ti - 1])
                    .sum();
                let mut val = prev + inflow - outflow;
                if !val.is_finite() {
                    return Err(Error::new(
                        ErrorKind::Simulation,
                        ErrorCode::NonFiniteValue,
                        Some(format!("{} in {}", spec.ident, pop.name)),
                    ));
                }
                if val < 0.0 {
                    if val < -1e-9 {
                        self.warnings.push(
                            ErrorCode::NegativeCompartment,
                            Some(t),
                            format!("{} in {}", spec.ident, pop.name),
                        );
                    }
                    val = 0.0;
                }
                self.comps[pop_idx][comp_idx][ti] = val;
            }
        }
        Ok(())
    }

    /// Evaluate dependent characteristics and parameters at `ti` in
    /// dependency order, overlaying program values where active.
    fn update_parameters(&mut self, ti: usize) {
        let t = self.times[ti];

        let overlay_active = {
            let comps = &self.comps;
            match self.programs.as_mut() {
                Some(state) => {
                    state.update_coverage(
                        ti,
                        |r| comps[r.pop][r.idx][ti],
                        &mut self.warnings.warnings,
                    );
                    state.overlay_active(t)
                }
                None => false,
            }
        };

        for step in self.graph.run_steps.iter() {
            match step.kind {
                StepKind::Charac => {
                    for (pop_idx, idx) in step.targets.iter() {
                        let spec = &self.graph.pops[*pop_idx].characs[*idx];
                        let numer: f64 = spec
                            .includes
                            .iter()
                            .map(|slot| self.read_slot(*pop_idx, *slot, ti))
                            .sum();
                        let val = match spec.denominator {
                            Some(slot) => {
                                let denom = self.read_slot(*pop_idx, slot, ti);
                                if denom == 0.0 {
                                    self.warnings.push(
                                        ErrorCode::DivideByZero,
                                        Some(t),
                                        spec.ident.clone(),
                                    );
                                    0.0
                                } else {
                                    numer / denom
                                }
                            }
                            None => numer,
                        };
                        self.characs[*pop_idx][*idx][ti] = val;
                    }
                }
                StepKind::Par => {
                    for (pop_idx, idx) in step.targets.iter() {
                        let spec = &self.graph.pops[*pop_idx].pars[*idx];
                        let mut val = match &spec.expr {
                            Some(expr) => eval(
                                expr,
                                spec,
                                *pop_idx,
                                ti,
                                &self.comps,
                                &self.characs,
                                &self.pars,
                                &mut self.warnings,
                            ),
                            None => self.pars[*pop_idx][*idx][ti],
                        };

                        if overlay_active && spec.targetable {
                            if let Some(state) = &self.programs {
                                if let Some(overlaid) = state.overlay(*pop_idx, *idx) {
                                    val = overlaid;
                                }
                            }
                        }

                        val *= self
                            .parset
                            .y_factor(&spec.ident, &self.graph.pops[*pop_idx].name);
                        val = apply_limits(spec, val);
                        self.pars[*pop_idx][*idx][ti] = val;
                    }
                }
            }
        }
    }

    /// Convert parameter values into per-step link flows, then rescale each
    /// compartment's outflows so no more than its current size leaves.
    fn update_links(&mut self, ti: usize) {
        let t = self.times[ti];
        let dt = self.dt;

        for (pop_idx, pop) in self.graph.pops.iter().enumerate() {
            for (par_idx, spec) in pop.pars.iter().enumerate() {
                if spec.links.is_empty() {
                    continue;
                }
                // junction outflows have no time dimension; the flush
                // distributes them
                if spec.units == Units::Proportion {
                    continue;
                }
                let v = self.pars[pop_idx][par_idx][ti];

                match spec.units {
                    Units::Number => {
                        // one annual count distributed across this
                        // parameter's links in proportion to source size
                        let total: f64 = spec
                            .links
                            .iter()
                            .map(|l| {
                                let src = self.graph.links[*l].src;
                                self.comps[src.pop][src.idx][ti]
                            })
                            .sum();
                        let even = 1.0 / spec.links.len() as f64;
                        for l in spec.links.iter() {
                            let src = self.graph.links[*l].src;
                            let share = if total > 0.0 {
                                self.comps[src.pop][src.idx][ti] / total
                            } else {
                                even
                            };
                            self.links[*l][ti] = (v * dt * share).max(0.0);
                        }
                    }
                    Units::Probability => {
                        let mut p = v * dt;
                        if p > 1.0 {
                            self.warnings.push(
                                ErrorCode::ClippedProbability,
                                Some(t),
                                spec.ident.clone(),
                            );
                            p = 1.0;
                        }
                        p = p.max(0.0);
                        for l in spec.links.iter() {
                            let src = self.graph.links[*l].src;
                            self.links[*l][ti] = p * self.comps[src.pop][src.idx][ti];
                        }
                    }
                    Units::Duration => {
                        if v <= 0.0 {
                            self.warnings.push(
                                ErrorCode::DivideByZero,
                                Some(t),
                                spec.ident.clone(),
                            );
                            for l in spec.links.iter() {
                                self.links[*l][ti] = 0.0;
                            }
                        } else {
                            for l in spec.links.iter() {
                                let src = self.graph.links[*l].src;
                                self.links[*l][ti] =
                                    (dt / v) * self.comps[src.pop][src.idx][ti];
                            }
                        }
                    }
                    Units::Proportion | Units::Unknown => unreachable!(),
                }
            }
        }

        // outflow constraint: inflows arriving this step do not add to the
        // size available to leave
        for (pop_idx, pop) in self.graph.pops.iter().enumerate() {
            for (comp_idx, spec) in pop.comps.iter().enumerate() {
                if spec.is_junction || spec.is_source || spec.outlinks.is_empty() {
                    continue;
                }
                let total_out: f64 = spec.outlinks.iter().map(|l| self.links[*l][ti]).sum();
                let size = self.comps[pop_idx][comp_idx][ti];
                if total_out > size && total_out > 0.0 {
                    let scale = size / total_out;
                    for l in spec.outlinks.iter() {
                        self.links[*l][ti] *= scale;
                    }
                }
            }
        }
    }

    /// Distribute the initial sizes of junction compartments downstream so
    /// every junction holds zero at time zero.  Mass moves directly into
    /// downstream compartment values; no link flow is recorded.
    fn flush_initial_junctions(&mut self) -> Result<()> {
        for pop_idx in 0..self.graph.pops.len() {
            for comp_idx in 0..self.graph.pops[pop_idx].comps.len() {
                if !self.graph.pops[pop_idx].comps[comp_idx].is_junction {
                    continue;
                }
                let amount = self.comps[pop_idx][comp_idx][0];
                if amount == 0.0 {
                    continue;
                }
                let mut seen: SmallVec<[(usize, usize); 8]> = SmallVec::new();
                seen.push((pop_idx, comp_idx));
                self.distribute(pop_idx, comp_idx, amount, 0, true, &mut seen)?;
                self.comps[pop_idx][comp_idx][0] = 0.0;
            }
        }
        Ok(())
    }

    /// Flush mass that arrived at junctions during this step straight
    /// through to their downstream endpoints, recursing through chains of
    /// junctions within the same step.
    fn update_junctions(&mut self, ti: usize) -> Result<()> {
        for pop_idx in 0..self.graph.pops.len() {
            for comp_idx in 0..self.graph.pops[pop_idx].comps.len() {
                let spec = &self.graph.pops[pop_idx].comps[comp_idx];
                if !spec.is_junction {
                    continue;
                }
                // mass arriving from upstream junctions is carried by the
                // recursion below, so only count ordinary inflows here
                let amount: f64 = spec
                    .inlinks
                    .iter()
                    .filter(|l| {
                        let src = self.graph.links[**l].src;
                        !self.graph.pops[src.pop].comps[src.idx].is_junction
                    })
                    .map(|l| self.links[*l][ti])
                    .sum();
                if amount == 0.0 {
                    continue;
                }
                let mut seen: SmallVec<[(usize, usize); 8]> = SmallVec::new();
                seen.push((pop_idx, comp_idx));
                self.distribute(pop_idx, comp_idx, amount, ti, false, &mut seen)?;
            }
        }
        Ok(())
    }

    fn distribute(
        &mut self,
        pop_idx: usize,
        comp_idx: usize,
        amount: f64,
        ti: usize,
        initial: bool,
        seen: &mut SmallVec<[(usize, usize); 8]>,
    ) -> Result<()> {
        let outlinks = self.graph.pops[pop_idx].comps[comp_idx].outlinks.clone();

        let mut total = 0.0;
        for l in outlinks.iter() {
            let link = &self.graph.links[*l];
            total += self.pars[pop_idx][link.par][ti].max(0.0);
        }

        for (i, l) in outlinks.iter().enumerate() {
            let link = &self.graph.links[*l];
            let share = if total > 0.0 {
                amount * self.pars[pop_idx][link.par][ti].max(0.0) / total
            } else {
                // all proportions are zero
                match self.graph.model.junction_fallback {
                    JunctionFallback::FirstOutflow => {
                        if i == 0 {
                            self.warnings.push(
                                ErrorCode::BadJunctionOutflow,
                                Some(self.times[ti]),
                                self.graph.pops[pop_idx].comps[comp_idx].ident.clone(),
                            );
                            amount
                        } else {
                            0.0
                        }
                    }
                    JunctionFallback::Error => {
                        return Err(Error::new(
                            ErrorKind::Simulation,
                            ErrorCode::BadJunctionOutflow,
                            Some(self.graph.pops[pop_idx].comps[comp_idx].ident.clone()),
                        ));
                    }
                }
            };
            if share == 0.0 {
                continue;
            }

            let dst = link.dst;
            let dst_is_junction = self.graph.pops[dst.pop].comps[dst.idx].is_junction;

            if !initial {
                self.links[*l][ti] += share;
            }

            if dst_is_junction {
                if seen.contains(&(dst.pop, dst.idx)) {
                    return Err(Error::new(
                        ErrorKind::Simulation,
                        ErrorCode::JunctionCycle,
                        Some(self.graph.pops[dst.pop].comps[dst.idx].ident.clone()),
                    ));
                }
                seen.push((dst.pop, dst.idx));
                self.distribute(dst.pop, dst.idx, share, ti, initial, seen)?;
                seen.pop();
            } else if initial {
                self.comps[dst.pop][dst.idx][0] += share;
            }
        }

        Ok(())
    }

    /// Compute non-dependent characteristics and parameters after the run,
    /// vectorized over the whole time grid in dependency order.
    fn finalize_lazy_variables(&mut self) {
        let npts = self.times.len();
        for step in self.graph.full_steps.iter() {
            if self.graph.model.is_dependent(&step.ident) {
                continue;
            }
            match step.kind {
                StepKind::Charac => {
                    for (pop_idx, idx) in step.targets.iter() {
                        let spec = &self.graph.pops[*pop_idx].characs[*idx];
                        for ti in 0..npts {
                            let numer: f64 = spec
                                .includes
                                .iter()
                                .map(|slot| self.read_slot(*pop_idx, *slot, ti))
                                .sum();
                            let val = match spec.denominator {
                                Some(slot) => {
                                    let denom = self.read_slot(*pop_idx, slot, ti);
                                    if denom == 0.0 { 0.0 } else { numer / denom }
                                }
                                None => numer,
                            };
                            self.characs[*pop_idx][*idx][ti] = val;
                        }
                    }
                }
                StepKind::Par => {
                    for (pop_idx, idx) in step.targets.iter() {
                        let spec = &self.graph.pops[*pop_idx].pars[*idx];
                        let y = self
                            .parset
                            .y_factor(&spec.ident, &self.graph.pops[*pop_idx].name);
                        for ti in 0..npts {
                            let mut val = match &spec.expr {
                                Some(expr) => eval(
                                    expr,
                                    spec,
                                    *pop_idx,
                                    ti,
                                    &self.comps,
                                    &self.characs,
                                    &self.pars,
                                    &mut self.warnings,
                                ),
                                None => self.pars[*pop_idx][*idx][ti],
                            };
                            val = apply_limits(spec, val * y);
                            self.pars[*pop_idx][*idx][ti] = val;
                        }
                    }
                }
            }
        }
    }

    fn read_slot(&self, pop: usize, slot: Slot, ti: usize) -> f64 {
        match slot {
            Slot::Comp(idx) => self.comps[pop][idx][ti],
            Slot::Charac(idx) => self.characs[pop][idx][ti],
            Slot::Par(idx) => self.pars[pop][idx][ti],
        }
    }

    fn into_results(self, status: RunStatus) -> Results {
        let mut pops = Vec::with_capacity(self.graph.pops.len());
        for (pop_idx, pop) in self.graph.pops.iter().enumerate() {
            let comps = pop
                .comps
                .iter()
                .enumerate()
                .map(|(i, spec)| NamedSeries {
                    ident: spec.ident.clone(),
                    vals: self.comps[pop_idx][i].clone(),
                })
                .collect();
            let characs = pop
                .characs
                .iter()
                .enumerate()
                .map(|(i, spec)| NamedSeries {
                    ident: spec.ident.clone(),
                    vals: self.characs[pop_idx][i].clone(),
                })
                .collect();
            let pars = pop
                .pars
                .iter()
                .enumerate()
                .map(|(i, spec)| NamedSeries {
                    ident: spec.ident.clone(),
                    vals: self.pars[pop_idx][i].clone(),
                })
                .collect();
            pops.push(PopulationResults {
                name: pop.name.clone(),
                pop_type: pop.pop_type.clone(),
                comps,
                characs,
                pars,
            });
        }

        let links = self
            .graph
            .links
            .iter()
            .enumerate()
            .map(|(i, link)| LinkResults {
                src: link.src,
                dst: link.dst,
                parameter: self.graph.pops[link.src.pop].pars[link.par].ident.clone(),
                vals: self.links[i].clone(),
            })
            .collect();

        let programs = match &self.programs {
            Some(state) => state
                .set
                .programs
                .iter()
                .enumerate()
                .map(|(i, prog)| ProgramResults {
                    ident: prog.ident.clone(),
                    coverage: state.coverage[i].clone(),
                    reached: state.reached[i].clone(),
                })
                .collect(),
            None => Vec::new(),
        };

        Results {
            name: self.parset.name.clone(),
            time: self.times,
            dt: self.dt,
            pops,
            links,
            programs,
            warnings: self.warnings.warnings,
            status,
        }
    }
}

fn apply_limits(spec: &ParSpec, mut val: f64) -> f64 {
    if let Some(min) = spec.min_value {
        val = val.max(min);
    }
    if let Some(max) = spec.max_value {
        val = val.min(max);
    }
    val
}

/// Tree-walk evaluation of a compiled expression for one population at one
/// timestep.
#[allow(clippy::too_many_arguments)]
fn eval(
    expr: &CExpr,
    spec: &ParSpec,
    pop: usize,
    ti: usize,
    comps: &[Vec<Vec<f64>>],
    characs: &[Vec<Vec<f64>>],
    pars: &[Vec<Vec<f64>>],
    warnings: &mut WarningLog,
) -> f64 {
    let read = |pop: usize, slot: Slot| -> f64 {
        match slot {
            Slot::Comp(idx) => comps[pop][idx][ti],
            Slot::Charac(idx) => characs[pop][idx][ti],
            Slot::Par(idx) => pars[pop][idx][ti],
        }
    };

    match expr {
        CExpr::Const(n) => *n,
        CExpr::Var(slot) => read(pop, *slot),
        CExpr::App(builtin) => match builtin {
            BuiltinFn::Abs(a) => {
                eval(a, spec, pop, ti, comps, characs, pars, warnings).abs()
            }
            BuiltinFn::Exp(a) => {
                eval(a, spec, pop, ti, comps, characs, pars, warnings).exp()
            }
            BuiltinFn::Ln(a) => eval(a, spec, pop, ti, comps, characs, pars, warnings).ln(),
            BuiltinFn::Sqrt(a) => {
                eval(a, spec, pop, ti, comps, characs, pars, warnings).sqrt()
            }
            BuiltinFn::Floor(a) => {
                eval(a, spec, pop, ti, comps, characs, pars, warnings).floor()
            }
            BuiltinFn::Ceil(a) => {
                eval(a, spec, pop, ti, comps, characs, pars, warnings).ceil()
            }
            BuiltinFn::Min(a, b) => {
                let a = eval(a, spec, pop, ti, comps, characs, pars, warnings);
                let b = eval(b, spec, pop, ti, comps, characs, pars, warnings);
                a.min(b)
            }
            BuiltinFn::Max(a, b) => {
                let a = eval(a, spec, pop, ti, comps, characs, pars, warnings);
                let b = eval(b, spec, pop, ti, comps, characs, pars, warnings);
                a.max(b)
            }
            BuiltinFn::If(c, t, f) => {
                let c = eval(c, spec, pop, ti, comps, characs, pars, warnings);
                if is_truthy(c) {
                    eval(t, spec, pop, ti, comps, characs, pars, warnings)
                } else {
                    eval(f, spec, pop, ti, comps, characs, pars, warnings)
                }
            }
        },
        CExpr::Agg(plan_idx) => {
            let plan = &spec.aggs[*plan_idx];
            let mut total_weight = 0.0;
            let mut weighted = 0.0;
            for term in plan.terms.iter() {
                let x = read(term.pop, term.slot);
                let w = match term.weight_slot {
                    Some(slot) => term.weight * read(term.pop, slot),
                    None => term.weight,
                };
                total_weight += w;
                weighted += w * x;
            }
            if plan.op.is_avg() {
                if total_weight > 0.0 {
                    weighted / total_weight
                } else {
                    0.0
                }
            } else {
                weighted
            }
        }
        CExpr::Op1(op, l) => {
            let l = eval(l, spec, pop, ti, comps, characs, pars, warnings);
            match op {
                UnaryOp::Positive => l,
                UnaryOp::Negative => -l,
            }
        }
        CExpr::Op2(op, l, r) => {
            let l = eval(l, spec, pop, ti, comps, characs, pars, warnings);
            let r = eval(r, spec, pop, ti, comps, characs, pars, warnings);
            match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => {
                    if r == 0.0 {
                        warnings.push(ErrorCode::DivideByZero, None, spec.ident.clone());
                        0.0
                    } else {
                        l / r
                    }
                }
                BinaryOp::Pow => l.powf(r),
                BinaryOp::Gt => (l > r) as i8 as f64,
                BinaryOp::Gte => (l >= r) as i8 as f64,
                BinaryOp::Lt => (l < r) as i8 as f64,
                BinaryOp::Lte => (l <= r) as i8 as f64,
                BinaryOp::Eq => approx_eq!(f64, l, r) as i8 as f64,
                BinaryOp::Neq => !approx_eq!(f64, l, r) as i8 as f64,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::build_model;
    use crate::datamodel::Units;
    use crate::testutils::{
        comp, databook, framework, junction, param, param_expr, pop, setup_comp, sink,
        source, transition,
    };

    fn specs() -> SimSpecs {
        SimSpecs::new(2000.0, 2010.0, 0.25)
    }

    fn run_simple(
        fw: &crate::datamodel::Framework,
        db: &crate::datamodel::Databook,
        specs: &SimSpecs,
    ) -> Results {
        let graph = build_model(fw, db).unwrap();
        let parset = ParSet::from_databook("default", db);
        run(&graph, &parset, specs, RunOptions::default()).unwrap()
    }

    #[test]
    fn test_bad_sim_specs() {
        let fw = framework(
            vec![setup_comp("a"), comp("b")],
            vec![],
            vec![param("rate", Units::Probability)],
            vec![transition("a", "b", "rate")],
        );
        let db = databook(vec![pop("p")], &[("a", "p", 1.0), ("rate", "p", 0.1)]);
        let graph = build_model(&fw, &db).unwrap();
        let parset = ParSet::from_databook("default", &db);
        let err = run(
            &graph,
            &parset,
            &SimSpecs::new(2000.0, 2000.0, 0.25),
            RunOptions::default(),
        )
        .unwrap_err();
        assert_eq!(ErrorCode::BadSimSpecs, err.code);
    }

    #[test]
    fn test_decay() {
        // inf -> rec at 0.2/year; linear per-step probability 0.2*0.25
        let fw = framework(
            vec![setup_comp("inf"), comp("rec")],
            vec![],
            vec![param("rate", Units::Probability)],
            vec![transition("inf", "rec", "rate")],
        );
        let db = databook(vec![pop("p")], &[("inf", "p", 100.0), ("rate", "p", 0.2)]);
        let results = run_simple(&fw, &db, &specs());

        assert_eq!(RunStatus::Completed, results.status);
        let inf = results.get_variable("inf", None)[0];
        let rec = results.get_variable("rec", None)[0];
        assert_eq!(41, inf.vals.len());
        assert!((inf.vals[0] - 100.0).abs() < 1e-12);

        let expected_inf = 100.0 * (1.0 - 0.2 * 0.25_f64).powi(40);
        assert!((inf.vals[40] - expected_inf).abs() < 1e-9);
        let expected_rec = 100.0 * (1.0 - (1.0 - 0.2 * 0.25_f64).powi(40));
        assert!((rec.vals[40] - expected_rec).abs() < 1e-9);

        // conservation
        for ti in 0..41 {
            assert!((inf.vals[ti] + rec.vals[ti] - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_outflow_constraint() {
        // two huge competing outflows cannot drain more than the source
        // compartment holds
        let fw = framework(
            vec![setup_comp("a"), comp("b"), comp("c")],
            vec![],
            vec![
                param("to_b", Units::Number),
                param("to_c", Units::Number),
            ],
            vec![transition("a", "b", "to_b"), transition("a", "c", "to_c")],
        );
        let db = databook(
            vec![pop("p")],
            &[("a", "p", 10.0), ("to_b", "p", 300.0), ("to_c", "p", 100.0)],
        );
        let results = run_simple(&fw, &db, &SimSpecs::new(2000.0, 2000.5, 0.25));

        let a = results.get_variable("a", None)[0];
        let b = results.get_variable("b", None)[0];
        let c = results.get_variable("c", None)[0];
        // proposed outflow is (300+100)*0.25 = 100 against a size of 10;
        // everything leaves in one step, split 3:1
        assert!((a.vals[1] - 0.0).abs() < 1e-9);
        assert!((b.vals[1] - 7.5).abs() < 1e-9);
        assert!((c.vals[1] - 2.5).abs() < 1e-9);
        assert!(a.vals[1] >= 0.0);
    }

    #[test]
    fn test_source_and_sink() {
        let fw = framework(
            vec![source("births"), setup_comp("alive"), sink("dead")],
            vec![],
            vec![
                param("birth_rate", Units::Number),
                param("death_rate", Units::Probability),
            ],
            vec![
                transition("births", "alive", "birth_rate"),
                transition("alive", "dead", "death_rate"),
            ],
        );
        let db = databook(
            vec![pop("p")],
            &[
                ("alive", "p", 1000.0),
                ("birth_rate", "p", 40.0),
                ("death_rate", "p", 0.0),
            ],
        );
        let results = run_simple(&fw, &db, &SimSpecs::new(2000.0, 2001.0, 0.25));

        let alive = results.get_variable("alive", None)[0];
        // 40/year for one year
        assert!((alive.vals[4] - 1040.0).abs() < 1e-9);
        let births = results.get_variable("births", None)[0];
        for v in births.vals.iter() {
            assert_eq!(0.0, *v);
        }
    }

    #[test]
    fn test_junction_cascade() {
        // x -> j1 -> j2 -> y with unit proportions: junctions always empty,
        // y receives everything x emits in the same step
        let fw = framework(
            vec![setup_comp("x"), junction("j1"), junction("j2"), comp("y")],
            vec![],
            vec![
                param("influx", Units::Number),
                param("all_of_it", Units::Proportion),
                param("all_again", Units::Proportion),
            ],
            vec![
                transition("x", "j1", "influx"),
                transition("j1", "j2", "all_of_it"),
                transition("j2", "y", "all_again"),
            ],
        );
        let db = databook(
            vec![pop("p")],
            &[
                ("x", "p", 1000.0),
                ("influx", "p", 40.0),
                ("all_of_it", "p", 1.0),
                ("all_again", "p", 1.0),
            ],
        );
        let results = run_simple(&fw, &db, &SimSpecs::new(2000.0, 2001.0, 0.25));
        assert_eq!(RunStatus::Completed, results.status);

        let j1 = results.get_variable("j1", None)[0];
        let j2 = results.get_variable("j2", None)[0];
        let y = results.get_variable("y", None)[0];
        for ti in 0..=4 {
            assert_eq!(0.0, j1.vals[ti]);
            assert_eq!(0.0, j2.vals[ti]);
        }
        // 40/year * 0.25 = 10 per step
        assert!((y.vals[1] - 10.0).abs() < 1e-9);
        assert!((y.vals[4] - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_fails() {
        // log of a negative number poisons the flow with NaN
        let fw = framework(
            vec![setup_comp("inf"), comp("rec")],
            vec![],
            vec![param_expr("wait", Units::Duration, "log(0 - inf)")],
            vec![transition("inf", "rec", "wait")],
        );
        let db = databook(vec![pop("p")], &[("inf", "p", 100.0)]);
        let results = run_simple(&fw, &db, &SimSpecs::new(2000.0, 2001.0, 0.25));
        assert_eq!(RunStatus::Failed, results.status);
        assert!(results
            .warnings
            .iter()
            .any(|w| w.code == ErrorCode::NonFiniteValue));
    }

    #[test]
    fn test_cancellation() {
        let fw = framework(
            vec![setup_comp("inf"), comp("rec")],
            vec![],
            vec![param("rate", Units::Probability)],
            vec![transition("inf", "rec", "rate")],
        );
        let db = databook(vec![pop("p")], &[("inf", "p", 100.0), ("rate", "p", 0.2)]);
        let graph = build_model(&fw, &db).unwrap();
        let parset = ParSet::from_databook("default", &db);

        let flag = Arc::new(AtomicBool::new(true));
        let results = run(
            &graph,
            &parset,
            &specs(),
            RunOptions {
                abort_flag: Some(flag),
                ..RunOptions::default()
            },
        )
        .unwrap();
        assert_eq!(RunStatus::Cancelled, results.status);
    }

    #[test]
    fn test_clipped_probability() {
        let fw = framework(
            vec![setup_comp("inf"), comp("rec")],
            vec![],
            vec![param("rate", Units::Probability)],
            vec![transition("inf", "rec", "rate")],
        );
        let db = databook(vec![pop("p")], &[("inf", "p", 100.0), ("rate", "p", 9.0)]);
        let results = run_simple(&fw, &db, &specs());

        assert!(results
            .warnings
            .iter()
            .any(|w| w.code == ErrorCode::ClippedProbability));
        // with the per-step probability clipped to 1, everything moves in
        // the first step
        let inf = results.get_variable("inf", None)[0];
        assert_eq!(0.0, inf.vals[1]);
    }

    #[test]
    fn test_expression_parameter() {
        let fw = framework(
            vec![setup_comp("sus"), setup_comp("inf"), comp("rec")],
            vec![],
            vec![
                param_expr("foi", Units::Probability, "0.3 * inf / (sus + inf + rec)"),
                param("rec_rate", Units::Probability),
            ],
            vec![
                transition("sus", "inf", "foi"),
                transition("inf", "rec", "rec_rate"),
            ],
        );
        let db = databook(
            vec![pop("p")],
            &[
                ("sus", "p", 900.0),
                ("inf", "p", 100.0),
                ("rec_rate", "p", 0.2),
            ],
        );
        let results = run_simple(&fw, &db, &specs());
        assert_eq!(RunStatus::Completed, results.status);

        let foi = results.get_variable("foi", None)[0];
        assert!((foi.vals[0] - 0.03).abs() < 1e-12);

        // total population is conserved
        let sus = results.get_variable("sus", None)[0];
        let inf = results.get_variable("inf", None)[0];
        let rec = results.get_variable("rec", None)[0];
        for ti in 0..sus.vals.len() {
            let total = sus.vals[ti] + inf.vals[ti] + rec.vals[ti];
            assert!((total - 1000.0).abs() < 1e-9);
        }
    }
}
