// Copyright 2026 The Atomica Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::{error, result};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub type Ident = String;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NoError,      // will never be produced
    DoesNotExist, // the named entity doesn't exist
    UnrecognizedToken,
    UnrecognizedEof,
    ExtraToken,
    ExpectedNumber,
    ExpectedIdent,
    UnknownBuiltin,
    BadBuiltinArgs,
    EmptyEquation,
    DuplicateVariable,
    UnknownDependency,
    CircularDependency,
    VariablesHaveErrors,
    BadPopulationType,
    MismatchedPopulationTypes,
    BadTransition,
    BadUnits,
    BadInteraction,
    BadTransfer,
    BadSimSpecs,
    MissingData,
    BadInitialization,
    JunctionCycle,
    BadJunctionOutflow,
    BadProgram,
    DivideByZero,
    ClippedProbability,
    NegativeCompartment,
    NonFiniteValue,
    Cancelled,
    Generic,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            DoesNotExist => "does_not_exist",
            UnrecognizedToken => "unrecognized_token",
            UnrecognizedEof => "unrecognized_eof",
            ExtraToken => "extra_token",
            ExpectedNumber => "expected_number",
            ExpectedIdent => "expected_ident",
            UnknownBuiltin => "unknown_builtin",
            BadBuiltinArgs => "bad_builtin_args",
            EmptyEquation => "empty_equation",
            DuplicateVariable => "duplicate_variable",
            UnknownDependency => "unknown_dependency",
            CircularDependency => "circular_dependency",
            VariablesHaveErrors => "variables_have_errors",
            BadPopulationType => "bad_population_type",
            MismatchedPopulationTypes => "mismatched_population_types",
            BadTransition => "bad_transition",
            BadUnits => "bad_units",
            BadInteraction => "bad_interaction",
            BadTransfer => "bad_transfer",
            BadSimSpecs => "bad_sim_specs",
            MissingData => "missing_data",
            BadInitialization => "bad_initialization",
            JunctionCycle => "junction_cycle",
            BadJunctionOutflow => "bad_junction_outflow",
            BadProgram => "bad_program",
            DivideByZero => "divide_by_zero",
            ClippedProbability => "clipped_probability",
            NegativeCompartment => "negative_compartment",
            NonFiniteValue => "non_finite_value",
            Cancelled => "cancelled",
            Generic => "generic",
        };

        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EquationError {
    pub start: u16,
    pub end: u16,
    pub code: ErrorCode,
}

impl fmt::Display for EquationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.end, self.code)
    }
}

impl From<Error> for EquationError {
    fn from(err: Error) -> Self {
        EquationError {
            code: err.code,
            start: 0,
            end: 0,
        }
    }
}

impl From<(Ident, EquationError)> for Error {
    fn from(err: (Ident, EquationError)) -> Self {
        Error {
            kind: ErrorKind::Variable,
            code: err.1.code,
            details: Some(err.0),
        }
    }
}

#[macro_export]
macro_rules! eqn_err(
    ($code:tt, $start:expr, $end:expr) => {{
        use $crate::common::{EquationError, ErrorCode};
        Err(EquationError{ start: $start, end: $end, code: ErrorCode::$code})
    }}
);

#[macro_export]
macro_rules! var_eqn_err(
    ($ident:expr, $code:tt, $start:expr, $end:expr) => {{
        use $crate::common::{EquationError, ErrorCode};
        Err(($ident, EquationError{ start: $start, end: $end, code: ErrorCode::$code}))
    }}
);

#[macro_export]
macro_rules! model_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error{
            kind: ErrorKind::Model,
            code: ErrorCode::$code,
            details: Some($str),
        })
    }}
);

#[macro_export]
macro_rules! data_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error{
            kind: ErrorKind::Data,
            code: ErrorCode::$code,
            details: Some($str),
        })
    }}
);

#[macro_export]
macro_rules! sim_err {
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Simulation,
            code: ErrorCode::$code,
            details: Some($str),
        })
    }};
    ($code:tt) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Simulation,
            code: ErrorCode::$code,
            details: None,
        })
    }};
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Model,
    Data,
    Simulation,
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub(crate) details: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: ErrorCode, details: Option<String>) -> Self {
        Error {
            kind,
            code,
            details,
        }
    }

    pub fn get_details(&self) -> Option<String> {
        self.details.clone()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Model => "ModelError",
            ErrorKind::Data => "DataError",
            ErrorKind::Simulation => "SimulationError",
            ErrorKind::Variable => "VariableError",
        };
        match self.details {
            Some(ref details) => write!(f, "{}{{{}: {}}}", kind, self.code, details),
            None => write!(f, "{}{{{}}}", kind, self.code),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;
pub type EquationResult<T> = result::Result<T, EquationError>;

/// A non-fatal condition observed while integrating.  Warnings accumulate
/// on the run's `Results` rather than stopping the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub code: ErrorCode,
    pub t: Option<f64>,
    pub details: Option<String>,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.t, &self.details) {
            (Some(t), Some(details)) => write!(f, "t={}: {}: {}", t, self.code, details),
            (Some(t), None) => write!(f, "t={}: {}", t, self.code),
            (None, Some(details)) => write!(f, "{}: {}", self.code, details),
            (None, None) => write!(f, "{}", self.code),
        }
    }
}

pub fn canonicalize(name: &str) -> String {
    let name = name.trim();

    lazy_static! {
        static ref UNDERSCORE_RE: Regex = Regex::new(r"(\\n|\\r|\n|\r| |\x{00A0})+").unwrap();
    }

    let name = UNDERSCORE_RE.replace_all(name, "_");
    name.to_lowercase()
}

#[test]
fn test_canonicalize() {
    assert_eq!("a_b", canonicalize("   a b"));
    assert_eq!("a_b", canonicalize("a \n b"));
    assert_eq!("sus", canonicalize("Sus"));
    assert_eq!("foi_out", canonicalize("foi out"));
}

pub fn topo_sort<'out>(
    runlist: Vec<&'out str>,
    dependencies: &'out HashMap<Ident, BTreeSet<Ident>>,
) -> Vec<&'out str> {
    use std::collections::HashSet;

    let runlist_len = runlist.len();
    let mut result: Vec<&'out str> = Vec::with_capacity(runlist_len);
    let mut used: HashSet<&str> = HashSet::new();

    // We want to do a postorder, recursive traversal of variables to ensure
    // dependencies are calculated before the variables that reference them.
    // By this point, we have already errored out if we have e.g. a cycle
    fn add<'a>(
        dependencies: &'a HashMap<Ident, BTreeSet<Ident>>,
        result: &mut Vec<&'a str>,
        used: &mut HashSet<&'a str>,
        ident: &'a str,
    ) {
        if used.contains(ident) {
            return;
        }
        used.insert(ident);
        for dep in dependencies[ident].iter() {
            if dependencies.contains_key(dep.as_str()) {
                add(dependencies, result, used, dep)
            }
        }
        result.push(ident);
    }

    for ident in runlist.into_iter() {
        add(dependencies, &mut result, &mut used, ident);
    }

    assert_eq!(runlist_len, result.len());
    result
}

#[test]
fn test_topo_sort() {
    let mut deps: HashMap<Ident, BTreeSet<Ident>> = HashMap::new();
    deps.insert(
        "c".to_owned(),
        ["a", "b"].iter().map(|s| s.to_string()).collect(),
    );
    deps.insert("b".to_owned(), ["a"].iter().map(|s| s.to_string()).collect());
    deps.insert("a".to_owned(), BTreeSet::new());

    let sorted = topo_sort(vec!["c", "b", "a"], &deps);
    assert_eq!(vec!["a", "b", "c"], sorted);
}
