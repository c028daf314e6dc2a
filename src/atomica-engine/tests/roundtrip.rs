// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use atomica_engine::testutils::{
    charac, databook, framework, param, param_expr, pop, setup_comp, transition,
};
use atomica_engine::{
    build_model, run, ParSet, Results, RunOptions, RunStatus, SimSpecs, Units,
};

fn sir_results() -> Results {
    let fw = framework(
        vec![setup_comp("sus"), setup_comp("inf"), setup_comp("rec")],
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
            ("rec", "adults", 0.0),
            ("rec_rate", "adults", 0.2),
        ],
    );
    let graph = build_model(&fw, &db).unwrap();
    let parset = ParSet::from_databook("default", &db);
    let results = run(
        &graph,
        &parset,
        &SimSpecs::new(2000.0, 2005.0, 0.25),
        RunOptions::default(),
    )
    .unwrap();
    assert_eq!(RunStatus::Completed, results.status);
    results
}

#[test]
fn results_roundtrip_through_json() {
    let results = sir_results();

    let serialized = serde_json::to_string(&results).unwrap();
    let restored: Results = serde_json::from_str(&serialized).unwrap();
    assert_eq!(results, restored);

    // re-serializing the restored value is byte-identical
    let reserialized = serde_json::to_string(&restored).unwrap();
    assert_eq!(serialized, reserialized);

    // queries work against the reconstituted graph snapshot
    let inf = restored.get_variable("inf", Some("adults"));
    assert_eq!(1, inf.len());
    assert_eq!(results.time.len(), inf[0].vals.len());
    assert_eq!(2, restored.get_flows("rec_rate").len() + restored.get_flows("foi").len());
}

#[test]
fn parset_roundtrip_through_json() {
    let db = databook(
        vec![pop("adults")],
        &[("rec_rate", "adults", 0.2), ("inf", "adults", 100.0)],
    );
    let mut parset = ParSet::from_databook("default", &db);
    parset.set_y_factor("rec_rate", "adults", 1.5);

    let serialized = serde_json::to_string(&parset).unwrap();
    let restored: ParSet = serde_json::from_str(&serialized).unwrap();
    assert_eq!(parset, restored);
    assert_eq!(1.5, restored.y_factor("rec_rate", "adults"));
}
