//! Tool and model wrappers: execute the wrapped action, record the step.
//!
//! A wrapper never retries silently. Each failed attempt under a retry
//! policy is its own `retry` step, and I/O captured during an attempt is
//! attributed only to that attempt's step identifier.

use crate::errors::HindsightError;
use crate::recorder::{StepScope, TraceRecorder};
use crate::types::{Phase, StepStatus};
use serde_json::{json, Map, Value};

/// Outcome of one invocation of a wrapped tool or model. The message of
/// the `Err` side is what the recorder persists as the failure cause.
pub type WrappedResult = Result<Value, String>;

// ── ToolWrapper ───────────────────────────────────────────────────────────────

/// Wraps a tool implementation and records a `tool` phase step per call.
/// With `retry_policy = N ≥ 1`, a failed attempt below the ceiling is
/// recorded as a `retry` step and the tool is invoked again, up to `N`
/// retries; exhaustion records a final `tool` step with `status=error`.
pub struct ToolWrapper {
    recorder: TraceRecorder,
    name: String,
    retry_policy: u32,
}

impl ToolWrapper {
    pub fn new(recorder: &TraceRecorder, name: &str, retry_policy: u32) -> Self {
        Self {
            recorder: recorder.clone(),
            name: name.to_string(),
            retry_policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the tool. The closure receives the call arguments and the
    /// open step scope, so it can stream captured stdout/stderr into the
    /// attempt's I/O channel.
    pub fn call<F>(&self, args: Map<String, Value>, mut tool: F) -> Result<Value, HindsightError>
    where
        F: FnMut(&Map<String, Value>, &StepScope) -> WrappedResult,
    {
        let max_attempts = 1 + self.retry_policy;
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let mut input = args.clone();
            input.insert("tool".to_string(), Value::String(self.name.clone()));
            let mut scope = self.recorder.step(Phase::Tool, input)?;
            if attempt > 1 {
                scope.merge_input("attempt", json!(attempt));
                scope.merge_input("max_attempts", json!(max_attempts));
            }
            match tool(&args, &scope) {
                Ok(value) => {
                    scope.set_output("result", value.clone());
                    scope.capture_stdout(render_result(&value).as_bytes())?;
                    scope.close()?;
                    return Ok(value);
                }
                Err(message) => {
                    scope.capture_stderr(message.as_bytes())?;
                    if attempt < max_attempts {
                        scope.set_phase(Phase::Retry);
                        scope.set_status(StepStatus::Retry);
                        scope.merge_input("attempt", json!(attempt));
                        scope.merge_input("max_attempts", json!(max_attempts));
                        scope.set_output("error", Value::String(message.clone()));
                        scope.close()?;
                        last_error = message;
                    } else {
                        scope.fail(&message)?;
                        return Err(HindsightError::Tool(format!(
                            "{} failed after {max_attempts} attempts: {message}",
                            self.name
                        )));
                    }
                }
            }
        }
        Err(HindsightError::Tool(format!(
            "{} failed: {last_error}",
            self.name
        )))
    }
}

fn render_result(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

// ── ModelWrapper ──────────────────────────────────────────────────────────────

/// Wraps a model call and records a `reason` phase step: prompt as input,
/// response as output.
pub struct ModelWrapper {
    recorder: TraceRecorder,
}

impl ModelWrapper {
    pub fn new(recorder: &TraceRecorder) -> Self {
        Self {
            recorder: recorder.clone(),
        }
    }

    pub fn call<F>(&self, prompt: Map<String, Value>, model: F) -> Result<Value, HindsightError>
    where
        F: FnOnce(&Map<String, Value>) -> WrappedResult,
    {
        let scope = self.recorder.step(Phase::Reason, prompt.clone())?;
        match model(&prompt) {
            Ok(response) => {
                let mut scope = scope;
                scope.set_output("response", response.clone());
                scope.close()?;
                Ok(response)
            }
            Err(message) => {
                scope.fail(&message)?;
                Err(HindsightError::Tool(format!("model call failed: {message}")))
            }
        }
    }
}

// ── retry_block ───────────────────────────────────────────────────────────────

/// Explicit retry grouping for an arbitrary block of logic. Success is
/// transparent (the block's own instrumentation records its steps); each
/// failed attempt records a `retry` phase step, the last one as `error`.
pub fn retry_block<F>(
    recorder: &TraceRecorder,
    max_attempts: u32,
    mut block: F,
) -> Result<Value, HindsightError>
where
    F: FnMut(u32) -> WrappedResult,
{
    let max_attempts = max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        match block(attempt) {
            Ok(value) => return Ok(value),
            Err(message) => {
                let mut input = Map::new();
                input.insert("attempt".to_string(), json!(attempt));
                input.insert("max_attempts".to_string(), json!(max_attempts));
                let mut scope = recorder.step(Phase::Retry, input)?;
                scope.set_output("error", Value::String(message.clone()));
                scope.set_status(if attempt < max_attempts {
                    StepStatus::Retry
                } else {
                    StepStatus::Error
                });
                scope.close()?;
                last_error = message;
            }
        }
    }
    Err(HindsightError::Tool(format!(
        "retry block exhausted after {max_attempts} attempts: {last_error}"
    )))
}
