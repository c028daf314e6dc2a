// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The program overlay: converts money into coverage, and coverage into
//! parameter values that replace the databook values while programs are
//! active.

use std::collections::HashMap;

use crate::common::{canonicalize, ErrorCode, Ident, Result, Warning};
use crate::compiler::{CompRef, IntegrationGraph};
use crate::datamodel::{Modality, ProgramBook, ProgramInstructions, TimeSeries};
use crate::model_err;

#[derive(Clone, PartialEq, Debug)]
pub struct ProgramSpec {
    pub ident: Ident,
    pub label: String,
    pub is_continuous: bool,
    /// The coverage denominator: targeted compartments across targeted
    /// populations.
    pub target_comps: Vec<CompRef>,
    pub spending: TimeSeries,
    pub unit_cost: TimeSeries,
    pub capacity: Option<TimeSeries>,
    pub saturation: Option<TimeSeries>,
}

/// The outcome mapping for one parameter instance: its zero-coverage
/// baseline and the value each program attains at full coverage.
#[derive(Clone, PartialEq, Debug)]
pub struct EffectSpec {
    pub parameter: Ident,
    pub pop: usize,
    pub par: usize,
    pub baseline: f64,
    pub modality: Modality,
    pub effects: Vec<(usize, f64)>,
}

/// A program book resolved against an integration graph: names checked,
/// targets turned into compartment references, effects bound to parameter
/// slots.
#[derive(Clone, PartialEq, Debug)]
pub struct ProgramSet {
    pub name: String,
    pub programs: Vec<ProgramSpec>,
    pub effects: Vec<EffectSpec>,
    effect_index: HashMap<(usize, usize), usize>,
}

impl ProgramSet {
    pub fn compile(progbook: &ProgramBook, graph: &IntegrationGraph) -> Result<ProgramSet> {
        let mut programs: Vec<ProgramSpec> = Vec::with_capacity(progbook.programs.len());
        for decl in progbook.programs.iter() {
            let ident = canonicalize(&decl.name);
            if programs.iter().any(|p| p.ident == ident) {
                return model_err!(BadProgram, ident);
            }

            let mut target_comps: Vec<CompRef> = Vec::new();
            for pop_name in decl.target_pops.iter() {
                let pop_idx = match graph.get_pop(&canonicalize(pop_name)) {
                    Some(idx) => idx,
                    None => return model_err!(BadProgram, format!("{}: {}", ident, pop_name)),
                };
                for comp_name in decl.target_comps.iter() {
                    let comp_name = canonicalize(comp_name);
                    let comp_idx = match graph.pops[pop_idx].get_comp(&comp_name) {
                        Some(idx) => idx,
                        None => continue,
                    };
                    let spec = &graph.pops[pop_idx].comps[comp_idx];
                    if spec.is_source || spec.is_sink {
                        return model_err!(BadProgram, format!("{}: {}", ident, comp_name));
                    }
                    target_comps.push(CompRef {
                        pop: pop_idx,
                        idx: comp_idx,
                    });
                }
            }
            if target_comps.is_empty() {
                return model_err!(BadProgram, ident);
            }

            programs.push(ProgramSpec {
                ident,
                label: decl.label.clone(),
                is_continuous: decl.is_continuous,
                target_comps,
                spending: decl.spending.clone(),
                unit_cost: decl.unit_cost.clone(),
                capacity: decl.capacity.clone(),
                saturation: decl.saturation.clone(),
            });
        }

        let mut effects: Vec<EffectSpec> = Vec::new();
        let mut effect_index: HashMap<(usize, usize), usize> = HashMap::new();
        for decl in progbook.effects.iter() {
            let parameter = canonicalize(&decl.parameter);
            let pop_idx = match graph.get_pop(&canonicalize(&decl.population)) {
                Some(idx) => idx,
                None => {
                    return model_err!(
                        BadProgram,
                        format!("{}: {}", parameter, decl.population)
                    );
                }
            };
            let par_idx = match graph.pops[pop_idx].get_par(&parameter) {
                Some(idx) => idx,
                None => return model_err!(BadProgram, parameter),
            };
            let par_spec = &graph.pops[pop_idx].pars[par_idx];
            if !par_spec.targetable {
                return model_err!(BadProgram, format!("{} is not targetable", parameter));
            }
            if effect_index.contains_key(&(pop_idx, par_idx)) {
                return model_err!(
                    BadProgram,
                    format!("{}: duplicate effect in {}", parameter, decl.population)
                );
            }

            let mut resolved: Vec<(usize, f64)> = Vec::new();
            for (prog_name, value) in decl.effects.iter() {
                let prog_name = canonicalize(prog_name);
                let prog_idx = match programs.iter().position(|p| p.ident == prog_name) {
                    Some(idx) => idx,
                    None => return model_err!(BadProgram, prog_name),
                };
                resolved.push((prog_idx, *value));
            }

            effect_index.insert((pop_idx, par_idx), effects.len());
            effects.push(EffectSpec {
                parameter,
                pop: pop_idx,
                par: par_idx,
                baseline: decl.baseline,
                modality: par_spec.modality,
                effects: resolved,
            });
        }

        Ok(ProgramSet {
            name: progbook.name.clone(),
            programs,
            effects,
            effect_index,
        })
    }

    pub(crate) fn effect_for(&self, pop: usize, par: usize) -> Option<&EffectSpec> {
        self.effect_index
            .get(&(pop, par))
            .map(|idx| &self.effects[*idx])
    }
}

/// Per-run program state: series sampled onto the time grid, instruction
/// overrides applied, per-step coverage scratch, and the retained coverage
/// and number-reached outputs.
pub(crate) struct ProgramState<'a> {
    pub set: &'a ProgramSet,
    /// Simulation time at which the overlay starts replacing parameter
    /// values; infinite when no instructions were supplied.
    pub start_year: f64,
    spending: Vec<Vec<f64>>,
    unit_cost: Vec<Vec<f64>>,
    capacity: Vec<Option<Vec<f64>>>,
    saturation: Vec<Option<Vec<f64>>>,
    pub coverage: Vec<Vec<f64>>,
    pub reached: Vec<Vec<f64>>,
    /// Coverage at the step currently being evaluated.
    coverage_now: Vec<f64>,
}

impl<'a> ProgramState<'a> {
    pub fn new(
        set: &'a ProgramSet,
        instructions: Option<&ProgramInstructions>,
        times: &[f64],
    ) -> Result<ProgramState<'a>> {
        let npts = times.len();
        let mut spending = Vec::with_capacity(set.programs.len());
        let mut unit_cost = Vec::with_capacity(set.programs.len());
        let mut capacity = Vec::with_capacity(set.programs.len());
        let mut saturation = Vec::with_capacity(set.programs.len());

        for prog in set.programs.iter() {
            let spend_series = instructions
                .and_then(|ins| ins.spending.get(&prog.ident))
                .unwrap_or(&prog.spending);
            let spend = match spend_series.sample_onto(times) {
                Some(vals) => vals,
                None => return model_err!(MissingData, format!("{}: spending", prog.ident)),
            };
            let cost = match prog.unit_cost.sample_onto(times) {
                Some(vals) => vals,
                None => return model_err!(MissingData, format!("{}: unit cost", prog.ident)),
            };
            spending.push(spend);
            unit_cost.push(cost);
            capacity.push(prog.capacity.as_ref().and_then(|s| s.sample_onto(times)));
            saturation.push(prog.saturation.as_ref().and_then(|s| s.sample_onto(times)));
        }

        let n = set.programs.len();
        Ok(ProgramState {
            set,
            start_year: instructions.map(|ins| ins.start_year).unwrap_or(f64::INFINITY),
            spending,
            unit_cost,
            capacity,
            saturation,
            coverage: vec![vec![0.0; npts]; n],
            reached: vec![vec![0.0; npts]; n],
            coverage_now: vec![0.0; n],
        })
    }

    pub fn overlay_active(&self, t: f64) -> bool {
        t >= self.start_year
    }

    /// Compute every program's annualized reach and fractional coverage at
    /// timestep `ti` from current compartment sizes.
    pub fn update_coverage<F>(&mut self, ti: usize, comp_size: F, warnings: &mut Vec<Warning>)
    where
        F: Fn(CompRef) -> f64,
    {
        for (prog_idx, prog) in self.set.programs.iter().enumerate() {
            let denominator: f64 = prog.target_comps.iter().map(|r| comp_size(*r)).sum();

            let cost = self.unit_cost[prog_idx][ti];
            let mut reached = if cost > 0.0 {
                self.spending[prog_idx][ti] / cost
            } else {
                warnings.push(Warning {
                    code: ErrorCode::DivideByZero,
                    t: None,
                    details: Some(format!("{}: unit cost", prog.ident)),
                });
                0.0
            };
            if let Some(capacity) = &self.capacity[prog_idx] {
                reached = reached.min(capacity[ti]);
            }

            let mut coverage = if denominator > 0.0 {
                (reached / denominator).clamp(0.0, 1.0)
            } else {
                0.0
            };
            if let Some(saturation) = &self.saturation[prog_idx] {
                coverage = coverage.min(saturation[ti]);
            }

            self.reached[prog_idx][ti] = reached;
            self.coverage[prog_idx][ti] = coverage;
            self.coverage_now[prog_idx] = coverage;
        }
    }

    /// The overlaid value for a targeted parameter instance at the step
    /// last passed to `update_coverage`, or `None` if no effect targets it.
    pub fn overlay(&self, pop: usize, par: usize) -> Option<f64> {
        let effect = self.set.effect_for(pop, par)?;
        Some(combine(effect, &self.coverage_now))
    }
}

/// Combine program coverages into a parameter value per the parameter's
/// declared modality.
fn combine(effect: &EffectSpec, coverage: &[f64]) -> f64 {
    let baseline = effect.baseline;
    match effect.modality {
        Modality::Additive => {
            let mut value = baseline;
            for (prog_idx, full_value) in effect.effects.iter() {
                value += coverage[*prog_idx] * (full_value - baseline);
            }
            value
        }
        Modality::Multiplicative => {
            // each program acts on the shortfall left by the previous ones
            let mut value = baseline;
            for (prog_idx, full_value) in effect.effects.iter() {
                value += coverage[*prog_idx] * (full_value - value);
            }
            value
        }
        Modality::Random => {
            // coverage of the union assuming independence, effects weighted
            // by per-program share
            let mut union = 1.0;
            let mut total = 0.0;
            let mut weighted = 0.0;
            for (prog_idx, full_value) in effect.effects.iter() {
                let cov = coverage[*prog_idx];
                union *= 1.0 - cov;
                total += cov;
                weighted += cov * (full_value - baseline);
            }
            if total > 0.0 {
                baseline + (1.0 - union) * weighted / total
            } else {
                baseline
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn effect(modality: Modality, baseline: f64, effects: Vec<(usize, f64)>) -> EffectSpec {
        EffectSpec {
            parameter: "rate".to_string(),
            pop: 0,
            par: 0,
            baseline,
            modality,
            effects,
        }
    }

    #[test]
    fn test_additive() {
        let e = effect(Modality::Additive, 0.1, vec![(0, 0.5), (1, 0.9)]);
        let v = combine(&e, &[0.5, 0.25]);
        // 0.1 + 0.5*(0.5-0.1) + 0.25*(0.9-0.1)
        assert!((v - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_multiplicative() {
        let e = effect(Modality::Multiplicative, 0.0, vec![(0, 1.0), (1, 1.0)]);
        let v = combine(&e, &[0.5, 0.5]);
        // 0.5, then 0.5 + 0.5*(1.0-0.5)
        assert!((v - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_random() {
        let e = effect(Modality::Random, 0.0, vec![(0, 1.0), (1, 1.0)]);
        let v = combine(&e, &[0.5, 0.5]);
        // union coverage 0.75, both effects equal
        assert!((v - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_zero_coverage_keeps_baseline() {
        for modality in [Modality::Additive, Modality::Multiplicative, Modality::Random] {
            let e = effect(modality, 0.2, vec![(0, 0.9)]);
            let v = combine(&e, &[0.0]);
            assert!((v - 0.2).abs() < 1e-12, "{:?}", modality);
        }
    }
}
