// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The Atomica core: builds a typed integration graph from declarative
//! inputs (a framework, a databook, and optionally a program book) and
//! advances it with an explicit forward-Euler integrator, producing time
//! series of compartment sizes, flows, and derived quantities.

#![forbid(unsafe_code)]

use rayon::prelude::*;

pub mod common;
pub mod datamodel;

mod ast;
mod builtins;
mod compiler;
mod model;
mod parser;
mod parset;
mod programs;
mod results;
mod token;
mod variable;
mod vm;

#[doc(hidden)]
pub mod testutils;

pub use self::common::{canonicalize, Error, ErrorCode, Ident, Result, Warning};
pub use self::compiler::{build_model, CompRef, IntegrationGraph};
pub use self::datamodel::{
    Databook, Framework, ProgramBook, ProgramInstructions, SimSpecs, TimeSeries, Units,
};
pub use self::parset::ParSet;
pub use self::programs::ProgramSet;
pub use self::results::{Results, RunStatus, SeriesRef};
pub use self::vm::{run, RunOptions};

/// Run one simulation per parameter set, in parallel.  Each run owns its
/// own state; a failed run does not disturb the others, and results come
/// back in input order.
pub fn run_ensemble(
    graph: &IntegrationGraph,
    parsets: &[ParSet],
    specs: &SimSpecs,
    progset: Option<&ProgramSet>,
    instructions: Option<&ProgramInstructions>,
) -> Vec<Result<Results>> {
    parsets
        .par_iter()
        .map(|parset| {
            run(
                graph,
                parset,
                specs,
                RunOptions {
                    progset,
                    instructions,
                    abort_flag: None,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{comp, databook, framework, param, pop, setup_comp, transition};

    #[test]
    fn test_run_ensemble() {
        let fw = framework(
            vec![setup_comp("inf"), comp("rec")],
            vec![],
            vec![param("rate", Units::Probability)],
            vec![transition("inf", "rec", "rate")],
        );
        let db = databook(vec![pop("p")], &[("inf", "p", 100.0), ("rate", "p", 0.2)]);
        let graph = build_model(&fw, &db).unwrap();

        let base = ParSet::from_databook("default", &db);
        let mut doubled = base.clone();
        doubled.set_y_factor("rate", "p", 2.0);
        let parsets = vec![base, doubled];

        let specs = SimSpecs::new(2000.0, 2005.0, 0.25);
        let results = run_ensemble(&graph, &parsets, &specs, None, None);
        assert_eq!(2, results.len());

        let slow = results[0].as_ref().unwrap();
        let fast = results[1].as_ref().unwrap();
        assert_eq!(RunStatus::Completed, slow.status);
        assert_eq!(RunStatus::Completed, fast.status);

        let slow_inf = slow.get_variable("inf", None)[0];
        let fast_inf = fast.get_variable("inf", None)[0];
        let last = slow_inf.vals.len() - 1;
        assert!(fast_inf.vals[last] < slow_inf.vals[last]);
    }
}
