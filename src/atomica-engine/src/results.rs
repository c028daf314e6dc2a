// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use serde::{Deserialize, Serialize};

use crate::common::{Ident, Warning};
use crate::compiler::CompRef;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    /// The abort flag was observed between steps; values beyond the last
    /// completed step are zero.
    Cancelled,
    /// Integration produced a non-finite value or a junction cycle.
    Failed,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct NamedSeries {
    pub ident: Ident,
    pub vals: Vec<f64>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PopulationResults {
    pub name: Ident,
    pub pop_type: Ident,
    pub comps: Vec<NamedSeries>,
    pub characs: Vec<NamedSeries>,
    pub pars: Vec<NamedSeries>,
}

/// Per-step flow over one link.  Endpoints are `(population, compartment)`
/// index pairs, which keeps the serialized form free of object references.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct LinkResults {
    pub src: CompRef,
    pub dst: CompRef,
    pub parameter: Ident,
    pub vals: Vec<f64>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProgramResults {
    pub ident: Ident,
    pub coverage: Vec<f64>,
    pub reached: Vec<f64>,
}

/// A matched series returned from a variable query.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SeriesRef<'a> {
    pub population: &'a str,
    pub vals: &'a [f64],
}

/// The retained output of a run: the full time-indexed state of the
/// integration graph, plus program outputs, warnings, and the run status.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Results {
    pub name: String,
    pub time: Vec<f64>,
    pub dt: f64,
    pub pops: Vec<PopulationResults>,
    pub links: Vec<LinkResults>,
    pub programs: Vec<ProgramResults>,
    pub warnings: Vec<Warning>,
    pub status: RunStatus,
}

impl Results {
    /// Look up a variable by code name, searching compartments,
    /// characteristics, and parameters in turn.  Code names are unique
    /// across kinds, so at most one series matches per population.
    pub fn get_variable(&self, ident: &str, population: Option<&str>) -> Vec<SeriesRef<'_>> {
        let mut result = Vec::new();
        for pop in self.pops.iter() {
            if let Some(name) = population {
                if pop.name != name {
                    continue;
                }
            }
            let found = pop
                .comps
                .iter()
                .chain(pop.characs.iter())
                .chain(pop.pars.iter())
                .find(|series| series.ident == ident);
            if let Some(series) = found {
                result.push(SeriesRef {
                    population: &pop.name,
                    vals: &series.vals,
                });
            }
        }
        result
    }

    /// The flows driven by a parameter, in link declaration order.
    pub fn get_flows(&self, parameter: &str) -> Vec<&LinkResults> {
        self.links
            .iter()
            .filter(|link| link.parameter == parameter)
            .collect()
    }

    pub fn get_program(&self, ident: &str) -> Option<&ProgramResults> {
        self.programs.iter().find(|p| p.ident == ident)
    }
}
