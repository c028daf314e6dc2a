// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Builders for the declarative inputs, shared between unit and
//! integration tests.

use std::collections::BTreeMap;

use crate::datamodel::{
    Characteristic, Compartment, Databook, Framework, Interaction, InteractionWeight,
    InteractionWeights, JunctionFallback, Modality, Parameter, Population, PopulationType,
    TimeSeries, Transfer, TransferEntry, Transition, Units, DEFAULT_POP_TYPE,
};

pub fn comp(name: &str) -> Compartment {
    comp_in(name, DEFAULT_POP_TYPE)
}

pub fn comp_in(name: &str, pop_type: &str) -> Compartment {
    Compartment {
        name: name.to_string(),
        label: name.to_string(),
        pop_type: pop_type.to_string(),
        is_source: false,
        is_sink: false,
        is_junction: false,
        default_value: None,
        setup: false,
    }
}

pub fn setup_comp(name: &str) -> Compartment {
    Compartment {
        setup: true,
        ..comp(name)
    }
}

pub fn source(name: &str) -> Compartment {
    Compartment {
        is_source: true,
        ..comp(name)
    }
}

pub fn sink(name: &str) -> Compartment {
    Compartment {
        is_sink: true,
        ..comp(name)
    }
}

pub fn junction(name: &str) -> Compartment {
    Compartment {
        is_junction: true,
        ..comp(name)
    }
}

pub fn charac(name: &str, includes: &[&str], denominator: Option<&str>) -> Characteristic {
    charac_in(name, DEFAULT_POP_TYPE, includes, denominator)
}

pub fn charac_in(
    name: &str,
    pop_type: &str,
    includes: &[&str],
    denominator: Option<&str>,
) -> Characteristic {
    Characteristic {
        name: name.to_string(),
        label: name.to_string(),
        pop_type: pop_type.to_string(),
        includes: includes.iter().map(|s| s.to_string()).collect(),
        denominator: denominator.map(|s| s.to_string()),
        setup: false,
    }
}

pub fn setup_charac(name: &str, includes: &[&str], denominator: Option<&str>) -> Characteristic {
    Characteristic {
        setup: true,
        ..charac(name, includes, denominator)
    }
}

pub fn param(name: &str, units: Units) -> Parameter {
    param_in(name, DEFAULT_POP_TYPE, units)
}

pub fn param_in(name: &str, pop_type: &str, units: Units) -> Parameter {
    Parameter {
        name: name.to_string(),
        label: name.to_string(),
        pop_type: pop_type.to_string(),
        units,
        expression: None,
        default_value: None,
        min_value: None,
        max_value: None,
        targetable: false,
        modality: Modality::Additive,
    }
}

pub fn param_expr(name: &str, units: Units, expression: &str) -> Parameter {
    Parameter {
        expression: Some(expression.to_string()),
        ..param(name, units)
    }
}

pub fn param_expr_in(name: &str, pop_type: &str, units: Units, expression: &str) -> Parameter {
    Parameter {
        expression: Some(expression.to_string()),
        ..param_in(name, pop_type, units)
    }
}

pub fn targetable_param(name: &str, units: Units) -> Parameter {
    Parameter {
        targetable: true,
        ..param(name, units)
    }
}

pub fn transition(from: &str, to: &str, parameter: &str) -> Transition {
    Transition {
        from: from.to_string(),
        to: to.to_string(),
        parameter: parameter.to_string(),
    }
}

pub fn framework(
    compartments: Vec<Compartment>,
    characteristics: Vec<Characteristic>,
    parameters: Vec<Parameter>,
    transitions: Vec<Transition>,
) -> Framework {
    Framework {
        name: "test".to_string(),
        pop_types: vec![],
        compartments,
        characteristics,
        parameters,
        transitions,
        interactions: vec![],
        junction_fallback: JunctionFallback::FirstOutflow,
    }
}

pub fn pop_type(name: &str) -> PopulationType {
    PopulationType {
        name: name.to_string(),
        label: name.to_string(),
    }
}

pub fn interaction(name: &str, from_type: &str, to_type: &str) -> Interaction {
    Interaction {
        name: name.to_string(),
        label: name.to_string(),
        from_type: from_type.to_string(),
        to_type: to_type.to_string(),
    }
}

pub fn pop(name: &str) -> Population {
    pop_in(name, DEFAULT_POP_TYPE)
}

pub fn pop_in(name: &str, pop_type: &str) -> Population {
    Population {
        name: name.to_string(),
        label: name.to_string(),
        pop_type: pop_type.to_string(),
    }
}

/// A databook whose entries are `(variable, population, constant value)`.
pub fn databook(populations: Vec<Population>, entries: &[(&str, &str, f64)]) -> Databook {
    let mut data: BTreeMap<String, BTreeMap<String, TimeSeries>> = BTreeMap::new();
    for (var, pop, value) in entries.iter() {
        data.entry(var.to_string())
            .or_default()
            .insert(pop.to_string(), TimeSeries::constant(*value));
    }
    Databook {
        populations,
        data,
        transfers: vec![],
        interactions: vec![],
    }
}

pub fn transfer(
    name: &str,
    units: Units,
    entries: Vec<(&str, &str, TimeSeries)>,
) -> Transfer {
    Transfer {
        name: name.to_string(),
        label: name.to_string(),
        units,
        entries: entries
            .into_iter()
            .map(|(from_pop, to_pop, series)| TransferEntry {
                from_pop: from_pop.to_string(),
                to_pop: to_pop.to_string(),
                series,
            })
            .collect(),
    }
}

pub fn interaction_weights(name: &str, entries: Vec<(&str, &str, f64)>) -> InteractionWeights {
    InteractionWeights {
        name: name.to_string(),
        entries: entries
            .into_iter()
            .map(|(from_pop, to_pop, weight)| InteractionWeight {
                from_pop: from_pop.to_string(),
                to_pop: to_pop.to_string(),
                weight,
            })
            .collect(),
    }
}
