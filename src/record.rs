//! Serializable artifact types.
//!
//! A run is a directory: `meta.json`, a `steps.jsonl` log (one `StepRecord`
//! JSON object per line), and per-step snapshot / diff / tool-I/O sidecars.

use crate::types::{Phase, RunStatus, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── RunMeta ───────────────────────────────────────────────────────────────────

/// Run metadata persisted as `meta.json`. Terminal fields (`status`,
/// `termination_reason`, `truncated`) are rewritten at seal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub agent_version: String,
    pub llm: String,
    pub temperature: f64,
    pub tools: Vec<String>,
    pub seed: i64,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

// ── StepRecord ────────────────────────────────────────────────────────────────

/// One line of `steps.jsonl`. Unknown fields survive a round-trip via the
/// flattened `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub phase: Phase,
    pub input: Map<String, Value>,
    pub output: Map<String, Value>,
    pub status: StepStatus,
    /// Relative path to this step's snapshot, e.g. `snapshots/step_3.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StepRecord {
    /// Tool name for `tool`/`retry` steps, taken from the input payload.
    pub fn tool_name(&self) -> Option<&str> {
        self.input.get("tool").and_then(Value::as_str)
    }

    pub fn is_replayed(&self) -> bool {
        self.extra
            .get("replayed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn origin_step_id(&self) -> Option<u64> {
        self.extra.get("origin_step_id").and_then(Value::as_u64)
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Agent memory and tool state, detached from any step. Staged by
/// `update_memory` and attached to the next step that closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    pub memory: Vec<Value>,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default)]
    pub tools_state: Map<String, Value>,
}

/// Point-in-time state persisted as `snapshots/step_<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub step_id: u64,
    pub memory: Vec<Value>,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default)]
    pub tools_state: Map<String, Value>,
}

impl Snapshot {
    pub fn from_state(step_id: u64, state: MemoryState) -> Self {
        Self {
            step_id,
            memory: state.memory,
            context_tokens: state.context_tokens,
            tools_state: state.tools_state,
        }
    }

    pub fn state(&self) -> MemoryState {
        MemoryState {
            memory: self.memory.clone(),
            context_tokens: self.context_tokens,
            tools_state: self.tools_state.clone(),
        }
    }
}

// ── SnapshotDiff ──────────────────────────────────────────────────────────────

/// One changed leaf between two consecutive snapshots. `old_value` /
/// `new_value` are `Null` when the path is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffChange {
    pub path: Vec<String>,
    pub old_value: Value,
    pub new_value: Value,
}

/// Structural delta persisted as `diffs/step_<id>.diff.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub step_id: u64,
    pub changes: Vec<DiffChange>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Compute the structural delta from `prev` to `next`, keyed by `next`'s
/// step id. Paths address `memory`, `context_tokens`, and `tools_state`;
/// sequence elements are addressed by index.
pub fn diff_snapshots(prev: &Snapshot, next: &Snapshot) -> SnapshotDiff {
    let old = snapshot_body(prev);
    let new = snapshot_body(next);
    let mut changes = Vec::new();
    diff_values(&mut Vec::new(), &old, &new, &mut changes);
    SnapshotDiff {
        step_id: next.step_id,
        changes,
    }
}

/// Apply a diff produced by [`diff_snapshots`] to `prev`, yielding the
/// successor snapshot. The round-trip
/// `apply_diff(prev, diff_snapshots(prev, next)) == next` holds.
pub fn apply_diff(prev: &Snapshot, diff: &SnapshotDiff) -> Snapshot {
    let mut body = snapshot_body(prev);
    for change in &diff.changes {
        apply_change(&mut body, &change.path, &change.new_value);
    }
    let state: MemoryState = serde_json::from_value(body).unwrap_or_default();
    Snapshot::from_state(diff.step_id, state)
}

fn snapshot_body(snapshot: &Snapshot) -> Value {
    serde_json::json!({
        "memory": snapshot.memory,
        "context_tokens": snapshot.context_tokens,
        "tools_state": snapshot.tools_state,
    })
}

fn diff_values(path: &mut Vec<String>, old: &Value, new: &Value, out: &mut Vec<DiffChange>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let old_child = old_map.get(key).unwrap_or(&Value::Null);
                let new_child = new_map.get(key).unwrap_or(&Value::Null);
                path.push(key.clone());
                diff_values(path, old_child, new_child, out);
                path.pop();
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let len = old_items.len().max(new_items.len());
            for index in 0..len {
                let old_child = old_items.get(index).unwrap_or(&Value::Null);
                let new_child = new_items.get(index).unwrap_or(&Value::Null);
                path.push(index.to_string());
                diff_values(path, old_child, new_child, out);
                path.pop();
            }
        }
        _ => {
            if old != new {
                out.push(DiffChange {
                    path: path.clone(),
                    old_value: old.clone(),
                    new_value: new.clone(),
                });
            }
        }
    }
}

fn apply_change(target: &mut Value, path: &[String], new_value: &Value) {
    let Some((head, rest)) = path.split_first() else {
        *target = new_value.clone();
        return;
    };
    match target {
        Value::Object(map) => {
            let slot = map.entry(head.clone()).or_insert(Value::Null);
            apply_change(slot, rest, new_value);
            if rest.is_empty() && new_value.is_null() {
                map.remove(head);
            }
        }
        Value::Array(items) => {
            let Ok(index) = head.parse::<usize>() else {
                return;
            };
            while items.len() <= index {
                items.push(Value::Null);
            }
            apply_change(&mut items[index], rest, new_value);
            while items.last().is_some_and(Value::is_null) {
                items.pop();
            }
        }
        other => {
            // Path descends into a scalar: rebuild the container shape.
            let mut replacement = if head.parse::<usize>().is_ok() {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            };
            apply_change(&mut replacement, path, new_value);
            *other = replacement;
        }
    }
}
