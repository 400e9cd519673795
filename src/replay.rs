//! Replay engine: reproduce a run from artifacts with zero external effects.
//!
//! The engine presents substitute model and tool endpoints that consume the
//! recorded step sequence in order and return recorded outputs. Matching is
//! by phase plus tool name, never by step identifier, so reorderings by the
//! agent under replay surface as divergences instead of being papered over.
//! The engine never aborts mid-replay; divergences accumulate.

use crate::config::TraceConfig;
use crate::errors::HindsightError;
use crate::record::StepRecord;
use crate::recorder::{RunSpec, TraceRecorder};
use crate::store::LoadedRun;
use crate::types::{DivergenceKind, Phase, RunStatus};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

pub const REPLAY_TAG: &str = "replay";

#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub kind: DivergenceKind,
    /// Originating step in the source run, when one is implicated.
    pub step_id: Option<u64>,
    pub detail: String,
}

#[derive(Debug)]
pub struct ReplayReport {
    pub source_run_id: String,
    pub replay_run_id: String,
    pub replay_run_dir: PathBuf,
    /// Steps mirrored into the replay trace.
    pub replayed_steps: u64,
    pub divergences: Vec<Divergence>,
}

impl ReplayReport {
    pub fn is_clean(&self) -> bool {
        self.divergences.is_empty()
    }
}

// ── ReplayEngine ──────────────────────────────────────────────────────────────

pub struct ReplayEngine {
    source: LoadedRun,
    recorder: TraceRecorder,
    cursor: usize,
    mirrored: u64,
    divergences: Vec<Divergence>,
}

impl ReplayEngine {
    /// Open a replay session over a loaded run. A secondary recorder is
    /// initialized whose run carries the `replay` tag and the source run
    /// identifier.
    pub fn new(source: LoadedRun, config: &TraceConfig) -> Result<Self, HindsightError> {
        let mut tags = source.meta.tags.clone();
        tags.push(REPLAY_TAG.to_string());
        tags.push(format!("source:{}", source.meta.run_id));
        let spec = RunSpec {
            agent_version: source.meta.agent_version.clone(),
            llm: source.meta.llm.clone(),
            temperature: source.meta.temperature,
            seed: source.meta.seed,
            tools: source.meta.tools.clone(),
            tags,
        };
        // A truncated source already fills its entire step allowance; the
        // mirror needs room for every original step.
        let mut replay_config = config.clone();
        replay_config.recorder.max_steps = replay_config
            .recorder
            .max_steps
            .max(source.steps.len() as u64 + 1);
        let recorder = TraceRecorder::init(spec, &replay_config)?;
        Ok(Self {
            source,
            recorder,
            cursor: 0,
            mirrored: 0,
            divergences: Vec::new(),
        })
    }

    pub fn divergences(&self) -> &[Divergence] {
        &self.divergences
    }

    /// Substitute model endpoint: advance to the next recorded `reason`
    /// step and return its output. Nothing is executed.
    pub fn model(&mut self, _input: &Map<String, Value>) -> Result<Value, HindsightError> {
        loop {
            let Some(step) = self.source.steps.get(self.cursor).cloned() else {
                self.divergences.push(Divergence {
                    kind: DivergenceKind::ExtraStep,
                    step_id: None,
                    detail: "model requested past the end of the recording".to_string(),
                });
                return Err(HindsightError::CursorExhausted(
                    "no recorded reason step remains".to_string(),
                ));
            };
            match step.phase {
                Phase::Reason => {
                    self.cursor += 1;
                    self.mirror(&step)?;
                    return Ok(Value::Object(step.output));
                }
                Phase::Tool => {
                    self.cursor += 1;
                    self.mirror(&step)?;
                    let detail = format!(
                        "model requested but step {} recorded tool {:?}",
                        step.step_id,
                        step.tool_name().unwrap_or("?")
                    );
                    self.divergences.push(Divergence {
                        kind: DivergenceKind::OutputMismatch,
                        step_id: Some(step.step_id),
                        detail: detail.clone(),
                    });
                    return Ok(json!({ "error": detail }));
                }
                _ => {
                    self.cursor += 1;
                    self.mirror(&step)?;
                }
            }
        }
    }

    /// Substitute tool endpoint: advance to the next recorded `tool` step.
    /// A name mismatch records an `output_mismatch` divergence and returns
    /// an error result.
    pub fn tool(
        &mut self,
        name: &str,
        _input: &Map<String, Value>,
    ) -> Result<Value, HindsightError> {
        loop {
            let Some(step) = self.source.steps.get(self.cursor).cloned() else {
                self.divergences.push(Divergence {
                    kind: DivergenceKind::ExtraStep,
                    step_id: None,
                    detail: format!("tool {name:?} requested past the end of the recording"),
                });
                return Err(HindsightError::CursorExhausted(format!(
                    "no recorded tool step remains for {name:?}"
                )));
            };
            match step.phase {
                Phase::Tool => {
                    self.cursor += 1;
                    self.mirror(&step)?;
                    let recorded = step.tool_name().unwrap_or_default().to_string();
                    if recorded == name {
                        return Ok(Value::Object(step.output));
                    }
                    let detail = format!(
                        "tool {name:?} requested but step {} recorded {recorded:?}",
                        step.step_id
                    );
                    self.divergences.push(Divergence {
                        kind: DivergenceKind::OutputMismatch,
                        step_id: Some(step.step_id),
                        detail: detail.clone(),
                    });
                    return Ok(json!({ "error": detail }));
                }
                Phase::Reason => {
                    self.cursor += 1;
                    self.mirror(&step)?;
                    let detail = format!(
                        "tool {name:?} requested but step {} recorded a reason step",
                        step.step_id
                    );
                    self.divergences.push(Divergence {
                        kind: DivergenceKind::OutputMismatch,
                        step_id: Some(step.step_id),
                        detail: detail.clone(),
                    });
                    return Ok(json!({ "error": detail }));
                }
                _ => {
                    self.cursor += 1;
                    self.mirror(&step)?;
                }
            }
        }
    }

    /// Seal the replay trace, flag unconsumed recorded endpoint calls as
    /// `missing_step`, and compare final-snapshot key fields.
    pub fn finish(mut self) -> Result<ReplayReport, HindsightError> {
        let remaining: Vec<StepRecord> = self.source.steps[self.cursor..].to_vec();
        for step in remaining {
            self.cursor += 1;
            match step.phase {
                Phase::Reason | Phase::Tool => {
                    self.divergences.push(Divergence {
                        kind: DivergenceKind::MissingStep,
                        step_id: Some(step.step_id),
                        detail: format!(
                            "recorded {} step {} was never requested during replay",
                            step.phase.as_str(),
                            step.step_id
                        ),
                    });
                }
                _ => self.mirror(&step)?,
            }
        }

        let replay_run_id = self.recorder.run_id();
        let replay_run_dir = self.recorder.run_dir();
        self.recorder.stop(&seal_reason(&self.source))?;

        let replay_run = LoadedRun::load(&replay_run_dir)?;
        self.compare_final_state(&replay_run)?;

        Ok(ReplayReport {
            source_run_id: self.source.meta.run_id.clone(),
            replay_run_id,
            replay_run_dir,
            replayed_steps: self.mirrored,
            divergences: self.divergences,
        })
    }

    /// Append one step to the replay trace, preserving phase, input,
    /// output, status, and snapshot verbatim, marked with its origin.
    fn mirror(&mut self, step: &StepRecord) -> Result<(), HindsightError> {
        if let Some(snapshot) = self.source.snapshot(step.step_id)? {
            self.recorder.update_memory(snapshot.state())?;
        }
        let mut scope = self.recorder.step(step.phase, step.input.clone())?;
        for (key, value) in &step.output {
            scope.set_output(key, value.clone());
        }
        scope.set_status(step.status);
        scope.annotate("replayed", json!(true));
        scope.annotate("origin_step_id", json!(step.step_id));
        scope.close()?;
        self.mirrored += 1;
        Ok(())
    }

    fn compare_final_state(&mut self, replay_run: &LoadedRun) -> Result<(), HindsightError> {
        if replay_run.meta.status != self.source.meta.status {
            self.divergences.push(Divergence {
                kind: DivergenceKind::StateMismatch,
                step_id: None,
                detail: format!(
                    "final status differs: recorded {}, replayed {}",
                    self.source.meta.status.as_str(),
                    replay_run.meta.status.as_str()
                ),
            });
        }
        if replay_run.steps.len() != self.source.steps.len() {
            self.divergences.push(Divergence {
                kind: DivergenceKind::StateMismatch,
                step_id: None,
                detail: format!(
                    "step counter differs: recorded {}, replayed {}",
                    self.source.steps.len(),
                    replay_run.steps.len()
                ),
            });
        }
        let source_final = self.source.final_snapshot()?;
        let replay_final = replay_run.final_snapshot()?;
        match (source_final, replay_final) {
            (Some(source), Some(replay)) => {
                if source.state() != replay.state() {
                    self.divergences.push(Divergence {
                        kind: DivergenceKind::StateMismatch,
                        step_id: Some(source.step_id),
                        detail: "final snapshot state differs".to_string(),
                    });
                } else if goal_of(&source) != goal_of(&replay) {
                    self.divergences.push(Divergence {
                        kind: DivergenceKind::StateMismatch,
                        step_id: Some(source.step_id),
                        detail: "final goal differs".to_string(),
                    });
                }
            }
            (None, None) => {}
            (source, _) => {
                self.divergences.push(Divergence {
                    kind: DivergenceKind::StateMismatch,
                    step_id: None,
                    detail: format!(
                        "final snapshot present on {} side only",
                        if source.is_some() { "recorded" } else { "replayed" }
                    ),
                });
            }
        }
        Ok(())
    }
}

fn goal_of(snapshot: &crate::record::Snapshot) -> Option<Value> {
    if let Some(goal) = snapshot.tools_state.get("goal") {
        return Some(goal.clone());
    }
    snapshot
        .memory
        .iter()
        .find_map(|entry| entry.get("goal").cloned())
}

fn seal_reason(source: &LoadedRun) -> String {
    match source.meta.status {
        RunStatus::Success => "success".to_string(),
        RunStatus::Failure => source
            .meta
            .termination_reason
            .clone()
            .unwrap_or_else(|| "error".to_string()),
        RunStatus::LimitExceeded => "limit_exceeded".to_string(),
        RunStatus::Aborted => source
            .meta
            .termination_reason
            .clone()
            .unwrap_or_else(|| "aborted".to_string()),
        RunStatus::Active => "aborted".to_string(),
    }
}

/// Replay a recorded run against its own step sequence. An unmodified run
/// replays with zero divergences.
pub fn replay_identity(
    run_dir: &std::path::Path,
    config: &TraceConfig,
) -> Result<ReplayReport, HindsightError> {
    let source = LoadedRun::load(run_dir)?;
    let script: Vec<StepRecord> = source.steps.clone();
    let mut engine = ReplayEngine::new(source, config)?;
    for step in script {
        match step.phase {
            Phase::Reason => {
                let _ = engine.model(&step.input)?;
            }
            Phase::Tool => {
                let name = step.tool_name().unwrap_or_default().to_string();
                let _ = engine.tool(&name, &step.input)?;
            }
            _ => {}
        }
    }
    engine.finish()
}
