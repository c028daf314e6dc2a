// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Parameter sets: the numeric inputs a run actually consumes.  A `ParSet`
//! is extracted from a databook and carries per-population data series plus
//! calibration y-factors; sampling perturbs the y-factors for uncertainty
//! ensembles.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::common::Ident;
use crate::datamodel::{Databook, TimeSeries};

#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ParValues {
    /// population code name -> series
    pub series: BTreeMap<Ident, TimeSeries>,
    /// population code name -> calibration scale factor (default 1)
    pub y_factors: BTreeMap<Ident, f64>,
    /// scale factor applied across all populations
    pub meta_y_factor: f64,
}

impl ParValues {
    fn new() -> Self {
        ParValues {
            series: BTreeMap::new(),
            y_factors: BTreeMap::new(),
            meta_y_factor: 1.0,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ParSet {
    pub name: String,
    pub pars: BTreeMap<Ident, ParValues>,
}

impl ParSet {
    /// Extract a parameter set from a databook: every data entry is copied
    /// (parameters as well as setup compartments and characteristics), all
    /// y-factors start at 1.
    pub fn from_databook(name: &str, databook: &Databook) -> ParSet {
        let mut pars: BTreeMap<Ident, ParValues> = BTreeMap::new();
        for (ident, per_pop) in databook.data.iter() {
            let mut values = ParValues::new();
            for (pop, series) in per_pop.iter() {
                values.series.insert(pop.clone(), series.clone());
            }
            pars.insert(ident.clone(), values);
        }
        ParSet {
            name: name.to_string(),
            pars,
        }
    }

    pub fn get_series(&self, ident: &str, pop: &str) -> Option<&TimeSeries> {
        self.pars.get(ident).and_then(|values| values.series.get(pop))
    }

    /// Interpolated data value scaled by the y-factor.
    pub fn value_at(&self, ident: &str, pop: &str, t: f64) -> Option<f64> {
        let raw = self.get_series(ident, pop)?.interpolate(t)?;
        Some(raw * self.y_factor(ident, pop))
    }

    pub fn y_factor(&self, ident: &str, pop: &str) -> f64 {
        match self.pars.get(ident) {
            Some(values) => {
                values.meta_y_factor * values.y_factors.get(pop).copied().unwrap_or(1.0)
            }
            None => 1.0,
        }
    }

    pub fn set_y_factor(&mut self, ident: &str, pop: &str, factor: f64) {
        self.pars
            .entry(ident.to_string())
            .or_insert_with(ParValues::new)
            .y_factors
            .insert(pop.to_string(), factor);
    }

    pub fn set_meta_y_factor(&mut self, ident: &str, factor: f64) {
        self.pars
            .entry(ident.to_string())
            .or_insert_with(ParValues::new)
            .meta_y_factor = factor;
    }

    /// A copy with every y-factor multiplied by a log-normal perturbation
    /// with the given relative spread.  Used to build uncertainty ensembles.
    pub fn sample<R: Rng>(&self, rng: &mut R, rel_sigma: f64) -> ParSet {
        let mut sampled = self.clone();
        sampled.name = format!("{}_sampled", self.name);
        for values in sampled.pars.values_mut() {
            let pops: Vec<Ident> = values.series.keys().cloned().collect();
            for pop in pops {
                let current = values.y_factors.get(&pop).copied().unwrap_or(1.0);
                values
                    .y_factors
                    .insert(pop, current * lognormal(rng, rel_sigma));
            }
        }
        sampled
    }
}

/// A log-normal multiplier with median 1, via Box-Muller.
fn lognormal<R: Rng>(rng: &mut R, sigma: f64) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    let normal = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    (sigma * normal).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{databook, pop};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn parset() -> ParSet {
        let db = databook(
            vec![pop("adults")],
            &[("rec_rate", "adults", 0.2), ("sus", "adults", 900.0)],
        );
        ParSet::from_databook("default", &db)
    }

    #[test]
    fn test_from_databook() {
        let ps = parset();
        assert_eq!(Some(0.2), ps.value_at("rec_rate", "adults", 2000.0));
        assert_eq!(Some(900.0), ps.value_at("sus", "adults", 2000.0));
        assert_eq!(None, ps.value_at("missing", "adults", 2000.0));
    }

    #[test]
    fn test_y_factors() {
        let mut ps = parset();
        ps.set_y_factor("rec_rate", "adults", 2.0);
        assert_eq!(Some(0.4), ps.value_at("rec_rate", "adults", 2000.0));
        ps.set_meta_y_factor("rec_rate", 0.5);
        assert_eq!(Some(0.2), ps.value_at("rec_rate", "adults", 2000.0));
    }

    #[test]
    fn test_sample_perturbs_y_factors() {
        let ps = parset();
        let mut rng = StdRng::seed_from_u64(12345);
        let sampled = ps.sample(&mut rng, 0.1);
        let y = sampled.y_factor("rec_rate", "adults");
        assert!(y > 0.0);
        assert!(y != 1.0);
        // data itself is untouched
        assert_eq!(ps.get_series("rec_rate", "adults"), sampled.get_series("rec_rate", "adults"));
    }

    #[test]
    fn test_sample_deterministic_for_seed() {
        let ps = parset();
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        assert_eq!(ps.sample(&mut a, 0.2), ps.sample(&mut b, 0.2));
    }
}
