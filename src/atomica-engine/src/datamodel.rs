// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Plain-data representation of the three declarative inputs: the framework
//! (structure), the databook (population-specific numbers), and the program
//! book (intervention overlays).  Spreadsheet parsing lives outside the
//! engine; these types are what the I/O layer hands us.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::Ident;

/// The unit kind of a parameter value, all annualized.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    /// A count flow rate, people per year.
    Number,
    /// A per-year transition probability in [0, 1].
    Probability,
    /// A mean residence time in years.
    Duration,
    /// A unitless fraction; only meaningful for junction outflows.
    Proportion,
    /// An arbitrary scalar used as an intermediate.
    Unknown,
}

/// How multiple programs targeting the same parameter combine.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Additive,
    Multiplicative,
    Random,
}

impl Default for Modality {
    fn default() -> Self {
        Modality::Additive
    }
}

/// What to do when every outflow proportion of a junction is zero.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JunctionFallback {
    FirstOutflow,
    Error,
}

impl Default for JunctionFallback {
    fn default() -> Self {
        JunctionFallback::FirstOutflow
    }
}

/// A sparse, annually-indexed scalar series.  Values between knots are
/// linearly interpolated; beyond either end the nearest knot value holds.
/// An `assumption` is a single scalar standing in for time-specific data.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    pub t: Vec<f64>,
    pub v: Vec<f64>,
    pub assumption: Option<f64>,
}

impl TimeSeries {
    pub fn new(t: Vec<f64>, v: Vec<f64>) -> Self {
        assert_eq!(t.len(), v.len());
        TimeSeries {
            t,
            v,
            assumption: None,
        }
    }

    pub fn from_assumption(value: f64) -> Self {
        TimeSeries {
            t: vec![],
            v: vec![],
            assumption: Some(value),
        }
    }

    pub fn constant(value: f64) -> Self {
        Self::from_assumption(value)
    }

    pub fn has_data(&self) -> bool {
        !self.t.is_empty() || self.assumption.is_some()
    }

    /// Interpolate the series at time `t`, or `None` if the series is empty.
    pub fn interpolate(&self, t: f64) -> Option<f64> {
        if self.t.is_empty() {
            return self.assumption;
        }
        let n = self.t.len();
        if t <= self.t[0] {
            return Some(self.v[0]);
        }
        if t >= self.t[n - 1] {
            return Some(self.v[n - 1]);
        }
        // find the knot interval containing t; series are stored sorted
        let mut i = 0;
        while i + 1 < n && self.t[i + 1] < t {
            i += 1;
        }
        let (t0, t1) = (self.t[i], self.t[i + 1]);
        let (v0, v1) = (self.v[i], self.v[i + 1]);
        if t1 == t0 {
            return Some(v1);
        }
        Some(v0 + (v1 - v0) * (t - t0) / (t1 - t0))
    }

    /// Interpolate onto a full time grid.
    pub fn sample_onto(&self, times: &[f64]) -> Option<Vec<f64>> {
        if !self.has_data() {
            return None;
        }
        Some(times.iter().map(|t| self.interpolate(*t).unwrap()).collect())
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PopulationType {
    pub name: Ident,
    pub label: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Compartment {
    pub name: Ident,
    pub label: String,
    pub pop_type: Ident,
    #[serde(default)]
    pub is_source: bool,
    #[serde(default)]
    pub is_sink: bool,
    #[serde(default)]
    pub is_junction: bool,
    /// Initial size used when the setup system leaves this compartment free.
    pub default_value: Option<f64>,
    /// Whether the databook provides an initial value for this compartment.
    #[serde(default)]
    pub setup: bool,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Characteristic {
    pub name: Ident,
    pub label: String,
    pub pop_type: Ident,
    pub includes: Vec<Ident>,
    pub denominator: Option<Ident>,
    /// Whether the databook provides an initial value for this characteristic.
    #[serde(default)]
    pub setup: bool,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Parameter {
    pub name: Ident,
    pub label: String,
    pub pop_type: Ident,
    pub units: Units,
    /// An expression computing this parameter from other variables; a
    /// parameter without one reads its databook series instead.
    pub expression: Option<String>,
    pub default_value: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    /// Whether programs may overwrite this parameter's value.
    #[serde(default)]
    pub targetable: bool,
    #[serde(default)]
    pub modality: Modality,
}

/// One cell of the framework's transition matrix: mass moves from
/// compartment `from` to compartment `to` at the rate given by `parameter`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub from: Ident,
    pub to: Ident,
    pub parameter: Ident,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Interaction {
    pub name: Ident,
    pub label: String,
    pub from_type: Ident,
    pub to_type: Ident,
}

pub const DEFAULT_POP_TYPE: &str = "default";

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Framework {
    pub name: String,
    #[serde(default)]
    pub pop_types: Vec<PopulationType>,
    pub compartments: Vec<Compartment>,
    #[serde(default)]
    pub characteristics: Vec<Characteristic>,
    pub parameters: Vec<Parameter>,
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub junction_fallback: JunctionFallback,
}

impl Framework {
    /// The declared population types, or the implicit single default type.
    pub fn pop_types_or_default(&self) -> Vec<PopulationType> {
        if self.pop_types.is_empty() {
            vec![PopulationType {
                name: DEFAULT_POP_TYPE.to_owned(),
                label: "Default".to_owned(),
            }]
        } else {
            self.pop_types.clone()
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Population {
    pub name: Ident,
    pub label: String,
    pub pop_type: Ident,
}

/// One (from population, to population) leg of a transfer, with its own
/// time series in the transfer's units.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TransferEntry {
    pub from_pop: Ident,
    pub to_pop: Ident,
    pub series: TimeSeries,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Transfer {
    pub name: Ident,
    pub label: String,
    /// `number` or `probability`; checked at build.
    pub units: Units,
    pub entries: Vec<TransferEntry>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct InteractionWeight {
    pub from_pop: Ident,
    pub to_pop: Ident,
    pub weight: f64,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct InteractionWeights {
    pub name: Ident,
    pub entries: Vec<InteractionWeight>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Databook {
    pub populations: Vec<Population>,
    /// variable code name -> population code name -> series.  Covers
    /// parameters as well as setup compartments and characteristics.
    pub data: BTreeMap<Ident, BTreeMap<Ident, TimeSeries>>,
    #[serde(default)]
    pub transfers: Vec<Transfer>,
    #[serde(default)]
    pub interactions: Vec<InteractionWeights>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SimSpecs {
    pub start: f64,
    pub stop: f64,
    pub dt: f64,
}

impl SimSpecs {
    pub fn new(start: f64, stop: f64, dt: f64) -> Self {
        SimSpecs { start, stop, dt }
    }

    /// The integration grid: `start + i*dt` up to and including `stop`.
    pub fn time_vector(&self) -> Vec<f64> {
        let n = ((self.stop - self.start) / self.dt).round() as usize;
        (0..=n).map(|i| self.start + (i as f64) * self.dt).collect()
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Program {
    pub name: Ident,
    pub label: String,
    pub target_pops: Vec<Ident>,
    /// The coverage denominator: compartments whose occupants this program
    /// can reach.
    pub target_comps: Vec<Ident>,
    /// Continuous programs express unit cost per person-year and spending
    /// maps directly to current coverage; one-off programs reach
    /// `spending * dt / unit_cost` people per step.
    #[serde(default)]
    pub is_continuous: bool,
    pub spending: TimeSeries,
    pub unit_cost: TimeSeries,
    /// Absolute annual bound on the number of people reached.
    pub capacity: Option<TimeSeries>,
    /// Upper bound on attainable coverage.
    pub saturation: Option<TimeSeries>,
}

/// The outcome mapping for one (parameter, population): the value with no
/// coverage, and the value each program attains at full coverage.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProgramEffect {
    pub parameter: Ident,
    pub population: Ident,
    pub baseline: f64,
    pub effects: BTreeMap<Ident, f64>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProgramBook {
    pub name: String,
    pub programs: Vec<Program>,
    pub effects: Vec<ProgramEffect>,
}

/// Run-time program directives: when the overlay switches on, and optional
/// spending overrides replacing each program's databook spending series.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProgramInstructions {
    pub start_year: f64,
    #[serde(default)]
    pub spending: BTreeMap<Ident, TimeSeries>,
}

impl ProgramInstructions {
    pub fn from_start_year(start_year: f64) -> Self {
        ProgramInstructions {
            start_year,
            spending: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate() {
        let ts = TimeSeries::new(vec![2000.0, 2010.0], vec![0.0, 10.0]);
        assert_eq!(Some(0.0), ts.interpolate(1995.0));
        assert_eq!(Some(0.0), ts.interpolate(2000.0));
        assert_eq!(Some(5.0), ts.interpolate(2005.0));
        assert_eq!(Some(10.0), ts.interpolate(2010.0));
        assert_eq!(Some(10.0), ts.interpolate(2015.0));
    }

    #[test]
    fn test_interpolate_single_knot() {
        let ts = TimeSeries::new(vec![2000.0], vec![3.0]);
        assert_eq!(Some(3.0), ts.interpolate(1990.0));
        assert_eq!(Some(3.0), ts.interpolate(2030.0));
    }

    #[test]
    fn test_assumption() {
        let ts = TimeSeries::from_assumption(0.25);
        assert_eq!(Some(0.25), ts.interpolate(2007.0));
        let empty = TimeSeries::default();
        assert_eq!(None, empty.interpolate(2007.0));
    }

    #[test]
    fn test_time_vector() {
        let specs = SimSpecs::new(2000.0, 2001.0, 0.25);
        assert_eq!(vec![2000.0, 2000.25, 2000.5, 2000.75, 2001.0], specs.time_vector());
    }
}
