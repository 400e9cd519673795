//! Counterfactual construction: branch a recorded run at a pivot step.
//!
//! The result is a new run directory tagged `simulation`; the source run
//! is never touched. Kept steps reference the source run's snapshots by
//! relative path instead of duplicating them.

use crate::errors::HindsightError;
use crate::logging::random_hex;
use crate::record::{RunMeta, StepRecord};
use crate::store::{ArtifactStore, LoadedRun};
use crate::types::{RunStatus, StepStatus};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};

pub const SIMULATION_TAG: &str = "simulation";

/// What changes at the pivot step. The given payload replaces the recorded
/// one wholesale.
#[derive(Debug, Clone)]
pub enum PivotModification {
    Input(Map<String, Value>),
    Output(Map<String, Value>),
}

/// Build a counterfactual run under `base_dir`: all steps strictly before
/// the pivot verbatim, plus the pivot step with the modification applied
/// and `status=retry`. Returns the new run directory.
pub fn build_counterfactual(
    source: &LoadedRun,
    pivot_step: u64,
    modification: PivotModification,
    base_dir: &Path,
) -> Result<PathBuf, HindsightError> {
    let pivot_index = source
        .steps
        .iter()
        .position(|s| s.step_id == pivot_step)
        .ok_or_else(|| {
            HindsightError::InvalidArtifact(format!(
                "pivot step {pivot_step} not found in run {}",
                source.meta.run_id
            ))
        })?;

    let run_id = format!("run_{}", random_hex(16));
    let run_dir = base_dir.join(&run_id);
    let mut tags = source.meta.tags.clone();
    tags.push(SIMULATION_TAG.to_string());
    tags.push(format!("source:{}", source.meta.run_id));
    let meta = RunMeta {
        run_id,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        status: RunStatus::Active,
        termination_reason: None,
        truncated: false,
        tags,
        ..source.meta.clone()
    };

    let store = ArtifactStore::create(&run_dir, meta)?;
    let rel_source = relative_dir(&run_dir, &source.run_dir);

    for step in &source.steps[..pivot_index] {
        store.append_step(&reref_step(step.clone(), &rel_source))?;
    }

    let mut pivot = reref_step(source.steps[pivot_index].clone(), &rel_source);
    match modification {
        PivotModification::Input(input) => pivot.input = input,
        PivotModification::Output(output) => pivot.output = output,
    }
    pivot.status = StepStatus::Retry;
    store.append_step(&pivot)?;

    store.seal(RunStatus::Aborted, Some("counterfactual"), false)?;
    Ok(run_dir)
}

/// Rewrite snapshot and diff references so they resolve from the new run
/// directory into the source run.
fn reref_step(mut step: StepRecord, rel_source: &str) -> StepRecord {
    if let Some(state_ref) = step.state_ref.take() {
        step.state_ref = Some(format!("{rel_source}/{state_ref}"));
    }
    if let Some(diff_ref) = step.diff_ref.take() {
        step.diff_ref = Some(format!("{rel_source}/{diff_ref}"));
    }
    step
}

/// Relative path from `from_dir` to `to_dir`, rendered with `/` separators.
fn relative_dir(from_dir: &Path, to_dir: &Path) -> String {
    let from: Vec<Component> = from_dir.components().collect();
    let to: Vec<Component> = to_dir.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<String> = vec!["..".to_string(); from.len() - common];
    parts.extend(
        to[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
