//! Trace assertions for the `test` subcommand.
//!
//! Assertions are declared in a TOML file as `[[assert]]` tables and
//! evaluated against a loaded run. They complement, never replace, the
//! built-in invariant checks.

use crate::errors::HindsightError;
use crate::store::LoadedRun;
use crate::types::StepStatus;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// Terminal run status equals the given string.
    Status { equals: String },
    /// Step count bounds; any subset of the fields may be given.
    StepCount {
        equals: Option<u64>,
        min: Option<u64>,
        max: Option<u64>,
    },
    /// The run's phases, in order, equal the given sequence.
    PhaseSequence { phases: Vec<String> },
    /// No step carries `status=error`.
    NoErrors,
    /// The `truncated` metadata flag equals the given value.
    Truncated { equals: bool },
}

#[derive(Debug, Clone, Deserialize)]
struct AssertionFile {
    #[serde(rename = "assert", default)]
    asserts: Vec<Assertion>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssertionResult {
    pub description: String,
    pub passed: bool,
    pub detail: String,
}

pub fn load_assertions(path: &Path) -> Result<Vec<Assertion>, HindsightError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| HindsightError::Io(format!("{}: {e}", path.display())))?;
    let file: AssertionFile =
        toml::from_str(&raw).map_err(|e| HindsightError::ConfigParse(e.to_string()))?;
    Ok(file.asserts)
}

pub fn evaluate(run: &LoadedRun, assertions: &[Assertion]) -> Vec<AssertionResult> {
    assertions
        .iter()
        .map(|assertion| evaluate_one(run, assertion))
        .collect()
}

fn evaluate_one(run: &LoadedRun, assertion: &Assertion) -> AssertionResult {
    match assertion {
        Assertion::Status { equals } => {
            let actual = run.meta.status.as_str();
            AssertionResult {
                description: format!("status == {equals}"),
                passed: actual == equals,
                detail: format!("status is {actual}"),
            }
        }
        Assertion::StepCount { equals, min, max } => {
            let count = run.steps.len() as u64;
            let passed = equals.map_or(true, |e| count == e)
                && min.map_or(true, |m| count >= m)
                && max.map_or(true, |m| count <= m);
            AssertionResult {
                description: "step count bounds".to_string(),
                passed,
                detail: format!("{count} steps recorded"),
            }
        }
        Assertion::PhaseSequence { phases } => {
            let actual: Vec<&str> = run.steps.iter().map(|s| s.phase.as_str()).collect();
            let expected: Vec<&str> = phases.iter().map(String::as_str).collect();
            AssertionResult {
                description: format!("phase sequence {expected:?}"),
                passed: actual == expected,
                detail: format!("phases are {actual:?}"),
            }
        }
        Assertion::NoErrors => {
            let errors: Vec<u64> = run
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Error)
                .map(|s| s.step_id)
                .collect();
            AssertionResult {
                description: "no error steps".to_string(),
                passed: errors.is_empty(),
                detail: if errors.is_empty() {
                    "no error steps".to_string()
                } else {
                    format!("error steps: {errors:?}")
                },
            }
        }
        Assertion::Truncated { equals } => AssertionResult {
            description: format!("truncated == {equals}"),
            passed: run.meta.truncated == *equals,
            detail: format!("truncated is {}", run.meta.truncated),
        },
    }
}
