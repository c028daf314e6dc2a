// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::BTreeMap;

use proptest::prelude::*;

use atomica_engine::datamodel::{
    Program, ProgramBook, ProgramEffect, ProgramInstructions, TimeSeries,
};
use atomica_engine::testutils::{
    charac, comp, databook, framework, interaction, interaction_weights, param, param_expr,
    pop, setup_comp, transfer, transition,
};
use atomica_engine::{
    build_model, run, ParSet, ProgramSet, Results, RunOptions, RunStatus, SimSpecs, Units,
};

fn run_default(
    fw: &atomica_engine::Framework,
    db: &atomica_engine::Databook,
    specs: &SimSpecs,
) -> Results {
    let graph = build_model(fw, db).unwrap();
    let parset = ParSet::from_databook("default", db);
    let results = run(&graph, &parset, specs, RunOptions::default()).unwrap();
    assert_eq!(RunStatus::Completed, results.status);
    results
}

#[test]
fn duration_parameter_tracks_exponential() {
    // a mean residence time of 5 years moves dt/tau of the compartment per
    // step, which should track 1 - exp(-t/tau) closely at dt=0.1
    let fw = framework(
        vec![setup_comp("inf"), comp("rec")],
        vec![],
        vec![param("recovery_time", Units::Duration)],
        vec![transition("inf", "rec", "recovery_time")],
    );
    let db = databook(
        vec![pop("p")],
        &[("inf", "p", 100.0), ("recovery_time", "p", 5.0)],
    );
    let results = run_default(&fw, &db, &SimSpecs::new(2000.0, 2020.0, 0.1));

    let rec = results.get_variable("rec", None)[0];
    let flows = results.get_flows("recovery_time");
    assert_eq!(1, flows.len());
    // per-step number moved is (dt / tau) * inf
    let inf0 = 100.0;
    assert!((flows[0].vals[0] - (0.1 / 5.0) * inf0).abs() < 1e-12);

    for (ti, t) in results.time.iter().enumerate() {
        let expected = 100.0 * (1.0 - (-(t - 2000.0) / 5.0_f64).exp());
        let tolerance = 1.0_f64.max(expected * 0.01);
        assert!(
            (rec.vals[ti] - expected).abs() < tolerance,
            "t={}: {} vs {}",
            t,
            rec.vals[ti],
            expected
        );
    }
}

fn sir_two_pops() -> (atomica_engine::Framework, atomica_engine::Databook) {
    let fw = framework(
        vec![setup_comp("sus"), setup_comp("inf"), setup_comp("rec")],
        vec![],
        vec![param("rec_rate", Units::Probability)],
        vec![transition("inf", "rec", "rec_rate")],
    );
    let db = databook(
        vec![pop("a"), pop("b")],
        &[
            ("sus", "a", 600.0),
            ("inf", "a", 300.0),
            ("rec", "a", 100.0),
            ("sus", "b", 500.0),
            ("inf", "b", 0.0),
            ("rec", "b", 0.0),
            ("rec_rate", "a", 0.0),
            ("rec_rate", "b", 0.0),
        ],
    );
    (fw, db)
}

#[test]
fn transfer_conserves_mass() {
    let (fw, mut db) = sir_two_pops();
    db.transfers.push(transfer(
        "migration",
        Units::Number,
        vec![("a", "b", TimeSeries::constant(100.0))],
    ));
    let results = run_default(&fw, &db, &SimSpecs::new(2000.0, 2005.0, 0.25));

    let total_at = |ti: usize| -> f64 {
        ["sus", "inf", "rec"]
            .iter()
            .flat_map(|name| results.get_variable(name, None))
            .map(|series| series.vals[ti])
            .sum()
    };

    let npts = results.time.len();
    for ti in 0..npts {
        assert!((total_at(ti) - 1500.0).abs() < 1e-9, "ti={}", ti);
    }

    // the annual count is split across compartments in proportion to their
    // sizes: 600/300/100 out of 1000 at the first step
    let flows = results.get_flows("migration_a_to_b");
    assert_eq!(3, flows.len());
    let first: Vec<f64> = flows.iter().map(|link| link.vals[0]).collect();
    assert!((first[0] - 100.0 * 0.25 * 0.6).abs() < 1e-9);
    assert!((first[1] - 100.0 * 0.25 * 0.3).abs() < 1e-9);
    assert!((first[2] - 100.0 * 0.25 * 0.1).abs() < 1e-9);

    // population a shrinks by 25 per step
    let sus_a = results.get_variable("sus", Some("a"))[0];
    assert!((sus_a.vals[1] - 585.0).abs() < 1e-9);
}

#[test]
fn interaction_weighted_average() {
    let mut fw = framework(
        vec![setup_comp("ppl")],
        vec![charac("alive", &["ppl"], None)],
        vec![
            param("foi_out", Units::Unknown),
            param_expr("foi_in", Units::Probability, "src_pop_avg(foi_out, mixing, alive)"),
        ],
        vec![],
    );
    fw.interactions.push(interaction("mixing", "default", "default"));

    let mut db = databook(
        vec![pop("a"), pop("b")],
        &[
            ("ppl", "a", 1000.0),
            ("ppl", "b", 500.0),
            ("foi_out", "a", 0.1),
            ("foi_out", "b", 0.2),
        ],
    );
    db.interactions.push(interaction_weights(
        "mixing",
        vec![("a", "b", 1.0), ("b", "b", 2.0)],
    ));

    let results = run_default(&fw, &db, &SimSpecs::new(2000.0, 2001.0, 0.25));

    let foi_in_b = results.get_variable("foi_in", Some("b"))[0];
    // (1*1000*0.1 + 2*500*0.2) / (1*1000 + 2*500)
    assert!((foi_in_b.vals[0] - 0.15).abs() < 1e-12);

    // nothing terminates at population a, so its average is empty
    let foi_in_a = results.get_variable("foi_in", Some("a"))[0];
    assert_eq!(0.0, foi_in_a.vals[0]);
}

#[test]
fn program_overlay_converts_spending_to_flow() {
    let fw = framework(
        vec![setup_comp("inf"), comp("rec")],
        vec![],
        vec![atomica_engine::datamodel::Parameter {
            targetable: true,
            ..param("rec_rate", Units::Probability)
        }],
        vec![transition("inf", "rec", "rec_rate")],
    );
    let db = databook(vec![pop("p")], &[("inf", "p", 100.0), ("rec_rate", "p", 0.0)]);
    let graph = build_model(&fw, &db).unwrap();
    let parset = ParSet::from_databook("default", &db);

    let progbook = ProgramBook {
        name: "treatment programs".to_string(),
        programs: vec![Program {
            name: "treat".to_string(),
            label: "Treatment".to_string(),
            target_pops: vec!["p".to_string()],
            target_comps: vec!["inf".to_string()],
            is_continuous: false,
            spending: TimeSeries::constant(1000.0),
            unit_cost: TimeSeries::constant(100.0),
            capacity: None,
            saturation: None,
        }],
        effects: vec![ProgramEffect {
            parameter: "rec_rate".to_string(),
            population: "p".to_string(),
            baseline: 0.0,
            effects: {
                let mut effects = BTreeMap::new();
                effects.insert("treat".to_string(), 0.9);
                effects
            },
        }],
    };
    let progset = ProgramSet::compile(&progbook, &graph).unwrap();
    let instructions = ProgramInstructions::from_start_year(2000.0);

    let results = run(
        &graph,
        &parset,
        &SimSpecs::new(2000.0, 2001.0, 0.25),
        RunOptions {
            progset: Some(&progset),
            instructions: Some(&instructions),
            abort_flag: None,
        },
    )
    .unwrap();
    assert_eq!(RunStatus::Completed, results.status);

    // $1000/year at $100/person reaches 10 people a year against 100
    // infected: coverage 0.1, overlaid rate 0.1 * 0.9 = 0.09/year
    let program = results.get_program("treat").unwrap();
    assert!((program.reached[0] - 10.0).abs() < 1e-12);
    assert!((program.coverage[0] - 0.1).abs() < 1e-12);

    let rec_rate = results.get_variable("rec_rate", None)[0];
    assert!((rec_rate.vals[0] - 0.09).abs() < 1e-12);

    // 0.09 * 0.25 * 100 infected
    let flows = results.get_flows("rec_rate");
    assert!((flows[0].vals[0] - 2.25).abs() < 1e-12);
}

#[test]
fn program_overlay_respects_start_year() {
    let fw = framework(
        vec![setup_comp("inf"), comp("rec")],
        vec![],
        vec![atomica_engine::datamodel::Parameter {
            targetable: true,
            ..param("rec_rate", Units::Probability)
        }],
        vec![transition("inf", "rec", "rec_rate")],
    );
    let db = databook(vec![pop("p")], &[("inf", "p", 100.0), ("rec_rate", "p", 0.5)]);
    let graph = build_model(&fw, &db).unwrap();
    let parset = ParSet::from_databook("default", &db);

    let progbook = ProgramBook {
        name: "programs".to_string(),
        programs: vec![Program {
            name: "treat".to_string(),
            label: "Treatment".to_string(),
            target_pops: vec!["p".to_string()],
            target_comps: vec!["inf".to_string()],
            is_continuous: false,
            spending: TimeSeries::constant(0.0),
            unit_cost: TimeSeries::constant(100.0),
            capacity: None,
            saturation: None,
        }],
        effects: vec![ProgramEffect {
            parameter: "rec_rate".to_string(),
            population: "p".to_string(),
            baseline: 0.0,
            effects: {
                let mut effects = BTreeMap::new();
                effects.insert("treat".to_string(), 0.9);
                effects
            },
        }],
    };
    let progset = ProgramSet::compile(&progbook, &graph).unwrap();
    let instructions = ProgramInstructions::from_start_year(2001.0);

    let results = run(
        &graph,
        &parset,
        &SimSpecs::new(2000.0, 2002.0, 0.25),
        RunOptions {
            progset: Some(&progset),
            instructions: Some(&instructions),
            abort_flag: None,
        },
    )
    .unwrap();

    let rec_rate = results.get_variable("rec_rate", None)[0];
    // before the start year the databook value applies; afterwards the
    // overlay's zero-spending baseline does
    assert!((rec_rate.vals[0] - 0.5).abs() < 1e-12);
    let switch = results.time.iter().position(|t| *t >= 2001.0).unwrap();
    assert!((rec_rate.vals[switch] - 0.0).abs() < 1e-12);
}

#[test]
fn equilibrium_is_preserved_across_step_sizes() {
    // with linear probability rescaling the equilibrium of sus <-> inf is
    // independent of dt
    let build = || {
        let fw = framework(
            vec![setup_comp("sus"), setup_comp("inf")],
            vec![],
            vec![
                param("infect", Units::Probability),
                param("recover", Units::Probability),
            ],
            vec![
                transition("sus", "inf", "infect"),
                transition("inf", "sus", "recover"),
            ],
        );
        let db = databook(
            vec![pop("p")],
            &[
                ("sus", "p", 900.0),
                ("inf", "p", 100.0),
                ("infect", "p", 0.3),
                ("recover", "p", 0.2),
            ],
        );
        (fw, db)
    };

    let mut final_fractions = Vec::new();
    for dt in [1.0, 0.25, 0.1, 0.05, 0.01] {
        let (fw, db) = build();
        let results = run_default(&fw, &db, &SimSpecs::new(2000.0, 2050.0, dt));
        let last = results.time.len() - 1;
        let sus = results.get_variable("sus", None)[0].vals[last];
        let inf = results.get_variable("inf", None)[0].vals[last];
        final_fractions.push(inf / (sus + inf));
    }

    // analytic equilibrium: inf/total = 0.3 / (0.3 + 0.2)
    for fraction in final_fractions.iter() {
        assert!(
            (fraction - 0.6).abs() < 0.006,
            "fraction {} deviates from equilibrium",
            fraction
        );
    }
}

proptest! {
    /// Averaging a constant over source populations returns the constant,
    /// whatever the (positive) interaction weights.
    #[test]
    fn aggregator_normalization(
        value in -100.0..100.0f64,
        w_aa in 0.001..10.0f64,
        w_ab in 0.001..10.0f64,
        w_ba in 0.001..10.0f64,
        w_bb in 0.001..10.0f64,
    ) {
        let mut fw = framework(
            vec![setup_comp("ppl")],
            vec![],
            vec![
                param("signal", Units::Unknown),
                param_expr("received", Units::Unknown, "src_pop_avg(signal, mixing)"),
            ],
            vec![],
        );
        fw.interactions.push(interaction("mixing", "default", "default"));

        let mut db = databook(
            vec![pop("a"), pop("b")],
            &[
                ("ppl", "a", 1000.0),
                ("ppl", "b", 500.0),
                ("signal", "a", value),
                ("signal", "b", value),
            ],
        );
        db.interactions.push(interaction_weights(
            "mixing",
            vec![("a", "a", w_aa), ("a", "b", w_ab), ("b", "a", w_ba), ("b", "b", w_bb)],
        ));

        let results = run_default(&fw, &db, &SimSpecs::new(2000.0, 2001.0, 0.5));
        for pop_name in ["a", "b"] {
            let received = results.get_variable("received", Some(pop_name))[0];
            prop_assert!((received.vals[0] - value).abs() < 1e-9);
        }
    }
}
