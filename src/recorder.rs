//! Trace recorder: sole writer during a run.
//!
//! Lifecycle is `idle → recording → sealed`. The active-run handle lives in
//! an `OnceLock<Mutex<Option<…>>>` slot so a second `init` without `stop`
//! is caught; strict mode turns misuse into errors, lenient mode logs and
//! drops the offending call.

use crate::config::TraceConfig;
use crate::errors::HindsightError;
use crate::logging::{diag, now_ms, random_hex};
use crate::record::{diff_snapshots, MemoryState, RunMeta, Snapshot, StepRecord};
use crate::redact::RedactionPolicy;
use crate::store::{ArtifactStore, IoStream};
use crate::types::{Phase, RunStatus, StepStatus};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

// ── Active-run slot ───────────────────────────────────────────────────────────

static ACTIVE_RUN: OnceLock<Mutex<Option<Arc<RecorderShared>>>> = OnceLock::new();

fn active_slot() -> &'static Mutex<Option<Arc<RecorderShared>>> {
    ACTIVE_RUN.get_or_init(|| Mutex::new(None))
}

fn clear_active_if(shared: &Arc<RecorderShared>) {
    let mut guard = active_slot().lock().expect("active run lock");
    if guard.as_ref().is_some_and(|a| Arc::ptr_eq(a, shared)) {
        *guard = None;
    }
}

// ── RunSpec ───────────────────────────────────────────────────────────────────

/// Caller-supplied description of the run under observation.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub agent_version: String,
    pub llm: String,
    pub temperature: f64,
    pub seed: i64,
    pub tools: Vec<String>,
    pub tags: Vec<String>,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            agent_version: "0.0.1".to_string(),
            llm: "unknown".to_string(),
            temperature: 0.0,
            seed: 42,
            tools: Vec::new(),
            tags: Vec::new(),
        }
    }
}

// ── Recorder internals ────────────────────────────────────────────────────────

struct RecorderState {
    next_step_id: u64,
    open_step: Option<u64>,
    staged: Option<MemoryState>,
    prev_snapshot: Option<Snapshot>,
    sealed: bool,
}

struct RecorderShared {
    store: ArtifactStore,
    policy: RedactionPolicy,
    max_steps: u64,
    max_snapshot_bytes: u64,
    strict: bool,
    state: Mutex<RecorderState>,
    dropped_io_bytes: AtomicU64,
}

impl RecorderShared {
    fn is_sealed(&self) -> bool {
        self.state.lock().expect("recorder state lock").sealed
    }
}

fn seal_status_for_reason(reason: &str) -> (RunStatus, Option<String>) {
    match reason {
        "success" => (RunStatus::Success, None),
        "error" | "failure" => (RunStatus::Failure, Some(reason.to_string())),
        "limit_exceeded" => (RunStatus::LimitExceeded, Some(reason.to_string())),
        _ => (RunStatus::Aborted, Some(reason.to_string())),
    }
}

// ── TraceRecorder ─────────────────────────────────────────────────────────────

/// Handle to the recording run. Cheap to clone; all clones share one run.
#[derive(Clone)]
pub struct TraceRecorder {
    shared: Arc<RecorderShared>,
}

impl TraceRecorder {
    /// Allocate a run identifier, create the artifact store, and transition
    /// to `recording`. At most one recorder per process may be recording: a
    /// second `init` without `stop` is `AlreadyActive` in strict mode and
    /// implicitly stops the previous run in lenient mode.
    pub fn init(spec: RunSpec, config: &TraceConfig) -> Result<Self, HindsightError> {
        let policy = config.redaction_policy()?;

        {
            let guard = active_slot().lock().expect("active run lock");
            if let Some(existing) = guard.as_ref() {
                if !existing.is_sealed() {
                    if config.recorder.strict {
                        return Err(HindsightError::AlreadyActive(existing.store.run_id()));
                    }
                    let previous = Arc::clone(existing);
                    drop(guard);
                    diag(
                        "warn",
                        "run.implicit_stop",
                        json!({"run_id": previous.store.run_id()}),
                    );
                    let _ = seal_shared(&previous, "restarted");
                }
            }
        }

        let run_id = format!("run_{}", random_hex(16));
        let run_dir = config.recorder.base_dir.join(&run_id);
        let meta = RunMeta {
            run_id: run_id.clone(),
            agent_version: spec.agent_version,
            llm: spec.llm,
            temperature: spec.temperature,
            tools: spec.tools,
            seed: spec.seed,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            status: RunStatus::Active,
            termination_reason: None,
            truncated: false,
            tags: spec.tags,
        };
        let store = ArtifactStore::create(&run_dir, meta)?;
        let shared = Arc::new(RecorderShared {
            store,
            policy,
            max_steps: config.recorder.max_steps,
            max_snapshot_bytes: config.recorder.max_snapshot_bytes,
            strict: config.recorder.strict,
            state: Mutex::new(RecorderState {
                next_step_id: 1,
                open_step: None,
                staged: None,
                prev_snapshot: None,
                sealed: false,
            }),
            dropped_io_bytes: AtomicU64::new(0),
        });

        *active_slot().lock().expect("active run lock") = Some(Arc::clone(&shared));
        diag("info", "run.started", json!({"run_id": run_id}));
        Ok(Self { shared })
    }

    /// Handle to the process-wide recording run, if any.
    pub fn current() -> Option<Self> {
        let guard = active_slot().lock().expect("active run lock");
        guard
            .as_ref()
            .filter(|shared| !shared.is_sealed())
            .map(|shared| Self {
                shared: Arc::clone(shared),
            })
    }

    pub fn run_id(&self) -> String {
        self.shared.store.run_id()
    }

    pub fn run_dir(&self) -> std::path::PathBuf {
        self.shared.store.run_dir().to_path_buf()
    }

    pub fn is_recording(&self) -> bool {
        !self.shared.is_sealed()
    }

    /// Bytes of tool I/O discarded because no step scope was open.
    pub fn dropped_io_bytes(&self) -> u64 {
        self.shared.dropped_io_bytes.load(Ordering::Relaxed)
    }

    /// Open a scoped step. The scope permits in-scope mutation of output
    /// and status and records exactly one step when it closes, on every
    /// exit path.
    pub fn step(
        &self,
        phase: Phase,
        input: Map<String, Value>,
    ) -> Result<StepScope, HindsightError> {
        let mut state = self.shared.state.lock().expect("recorder state lock");
        if state.sealed {
            return self.misuse(
                HindsightError::NoActiveRun(format!(
                    "step({}) after run sealed",
                    phase.as_str()
                )),
                StepScope::inert(phase, input),
            );
        }
        if let Some(open) = state.open_step {
            return self.misuse(
                HindsightError::NestedStep(format!(
                    "step {open} is still open; nested steps are forbidden"
                )),
                StepScope::inert(phase, input),
            );
        }
        if state.next_step_id >= self.shared.max_steps {
            // The final slot is reserved for the terminate marker.
            self.truncate_locked(&mut state)?;
            drop(state);
            clear_active_if(&self.shared);
            return self.misuse(
                HindsightError::LimitExceeded(format!(
                    "run truncated at {} steps",
                    self.shared.max_steps
                )),
                StepScope::inert(phase, input),
            );
        }
        let step_id = state.next_step_id;
        state.next_step_id += 1;
        state.open_step = Some(step_id);
        Ok(StepScope {
            shared: Some(Arc::clone(&self.shared)),
            step_id,
            phase,
            input,
            output: Map::new(),
            extra: Map::new(),
            status: StepStatus::Ok,
            started: Instant::now(),
            closed: false,
        })
    }

    /// Stage the snapshot that will be attached to the next step to close.
    pub fn update_memory(&self, memory: MemoryState) -> Result<(), HindsightError> {
        let mut state = self.shared.state.lock().expect("recorder state lock");
        if state.sealed {
            drop(state);
            return self.misuse(
                HindsightError::NoActiveRun("update_memory after run sealed".to_string()),
                (),
            );
        }
        state.staged = Some(memory);
        Ok(())
    }

    /// Route captured bytes to the currently open step. Bytes produced with
    /// no open step are discarded and counted.
    pub fn capture_io(&self, stream: IoStream, bytes: &[u8]) -> Result<(), HindsightError> {
        let open = {
            let state = self.shared.state.lock().expect("recorder state lock");
            if state.sealed {
                None
            } else {
                state.open_step
            }
        };
        match open {
            Some(step_id) => {
                let redacted = self.shared.policy.redact_bytes(bytes);
                self.shared.store.capture_tool_io(step_id, stream, &redacted)
            }
            None => {
                self.shared
                    .dropped_io_bytes
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                diag(
                    "warn",
                    "io.dropped",
                    json!({
                        "run_id": self.run_id(),
                        "stream": stream.extension(),
                        "bytes": bytes.len(),
                    }),
                );
                Ok(())
            }
        }
    }

    /// Seal the store and transition to `sealed`. The reason maps onto the
    /// terminal status: `success`, `error`/`failure`, `limit_exceeded`, and
    /// anything else seals as `aborted` with the reason preserved.
    pub fn stop(&self, reason: &str) -> Result<(), HindsightError> {
        {
            let state = self.shared.state.lock().expect("recorder state lock");
            if state.sealed {
                drop(state);
                return self.misuse(
                    HindsightError::NoActiveRun("stop on inactive run".to_string()),
                    (),
                );
            }
        }
        seal_shared(&self.shared, reason)?;
        clear_active_if(&self.shared);
        Ok(())
    }

    fn misuse<T>(&self, error: HindsightError, lenient_value: T) -> Result<T, HindsightError> {
        if self.shared.strict {
            Err(error)
        } else {
            diag(
                "warn",
                "recorder.misuse_dropped",
                json!({"run_id": self.run_id(), "error": error.to_string()}),
            );
            Ok(lenient_value)
        }
    }

    fn truncate_locked(&self, state: &mut RecorderState) -> Result<(), HindsightError> {
        let step_id = state.next_step_id;
        state.next_step_id += 1;
        let record = StepRecord {
            step_id,
            timestamp: now_ms(),
            phase: Phase::Terminate,
            input: Map::new(),
            output: json_map(json!({"reason": "limit_exceeded"})),
            status: StepStatus::Ok,
            state_ref: None,
            diff_ref: None,
            duration_ms: None,
            extra: Map::new(),
        };
        self.shared.store.append_step(&record)?;
        state.sealed = true;
        self.shared
            .store
            .seal(RunStatus::LimitExceeded, Some("limit_exceeded"), true)?;
        diag(
            "warn",
            "run.truncated",
            json!({"run_id": self.run_id(), "max_steps": self.shared.max_steps}),
        );
        Ok(())
    }
}

fn seal_shared(shared: &Arc<RecorderShared>, reason: &str) -> Result<(), HindsightError> {
    {
        let mut state = shared.state.lock().expect("recorder state lock");
        if state.sealed {
            return Ok(());
        }
        state.sealed = true;
    }
    let (status, reason_opt) = seal_status_for_reason(reason);
    shared.store.seal(status, reason_opt.as_deref(), false)?;
    diag(
        "info",
        "run.stopped",
        json!({"run_id": shared.store.run_id(), "reason": reason}),
    );
    Ok(())
}

fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

// ── StepScope ─────────────────────────────────────────────────────────────────

/// Scoped step acquisition with guaranteed release. Dropping an unfinished
/// scope records the step anyway; during a panic it closes as `error`.
pub struct StepScope {
    shared: Option<Arc<RecorderShared>>,
    step_id: u64,
    phase: Phase,
    input: Map<String, Value>,
    output: Map<String, Value>,
    extra: Map<String, Value>,
    status: StepStatus,
    started: Instant,
    closed: bool,
}

impl StepScope {
    fn inert(phase: Phase, input: Map<String, Value>) -> Self {
        Self {
            shared: None,
            step_id: 0,
            phase,
            input,
            output: Map::new(),
            extra: Map::new(),
            status: StepStatus::Ok,
            started: Instant::now(),
            closed: false,
        }
    }

    /// Identifier assigned at open time; 0 for an inert (dropped) scope.
    pub fn step_id(&self) -> u64 {
        self.step_id
    }

    pub fn set_output(&mut self, key: &str, value: Value) {
        self.output.insert(key.to_string(), value);
    }

    pub fn set_status(&mut self, status: StepStatus) {
        self.status = status;
    }

    /// The tool wrapper reclassifies a failed attempt as a `retry` step
    /// once the outcome is known.
    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn merge_input(&mut self, key: &str, value: Value) {
        self.input.insert(key.to_string(), value);
    }

    /// Attach a free-form field to the step record itself (for example
    /// replay provenance markers).
    pub fn annotate(&mut self, key: &str, value: Value) {
        self.extra.insert(key.to_string(), value);
    }

    pub fn capture_stdout(&self, bytes: &[u8]) -> Result<(), HindsightError> {
        self.capture(IoStream::Stdout, bytes)
    }

    pub fn capture_stderr(&self, bytes: &[u8]) -> Result<(), HindsightError> {
        self.capture(IoStream::Stderr, bytes)
    }

    fn capture(&self, stream: IoStream, bytes: &[u8]) -> Result<(), HindsightError> {
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        let redacted = shared.policy.redact_bytes(bytes);
        shared.store.capture_tool_io(self.step_id, stream, &redacted)
    }

    /// Close the scope on the success path, with whatever status was set.
    pub fn close(mut self) -> Result<u64, HindsightError> {
        self.finalize()
    }

    /// Close the scope on the failure path: `status=error` and the message
    /// (an error or a cancellation cause) lands in the output payload.
    pub fn fail(mut self, message: &str) -> Result<u64, HindsightError> {
        self.status = StepStatus::Error;
        self.output
            .insert("error".to_string(), Value::String(message.to_string()));
        self.finalize()
    }

    fn finalize(&mut self) -> Result<u64, HindsightError> {
        if self.closed {
            return Ok(self.step_id);
        }
        self.closed = true;
        let Some(shared) = self.shared.take() else {
            return Ok(0);
        };

        let mut state = shared.state.lock().expect("recorder state lock");
        if state.sealed {
            return Err(HindsightError::Sealed(format!(
                "step {} closed after run sealed",
                self.step_id
            )));
        }

        let staged = state.staged.take().unwrap_or_else(|| {
            state
                .prev_snapshot
                .as_ref()
                .map(Snapshot::state)
                .unwrap_or_default()
        });
        let staged = oversize_guard(&shared, self.step_id, staged);
        // Redact entry contents, not the snapshot envelope: the key-name
        // rule must not catch `context_tokens` itself.
        let staged = MemoryState {
            memory: staged
                .memory
                .into_iter()
                .map(|entry| shared.policy.redact_value(entry))
                .collect(),
            context_tokens: staged.context_tokens,
            tools_state: shared.policy.redact_map(staged.tools_state),
        };
        let snapshot = Snapshot::from_state(self.step_id, staged);
        let state_ref = shared.store.write_snapshot(self.step_id, &snapshot)?;

        let diff_ref = match &state.prev_snapshot {
            Some(prev) => {
                let diff = diff_snapshots(prev, &snapshot);
                if diff.is_empty() {
                    None
                } else {
                    Some(shared.store.write_diff(self.step_id, &diff)?)
                }
            }
            None => None,
        };

        let record = StepRecord {
            step_id: self.step_id,
            timestamp: now_ms(),
            phase: self.phase,
            input: shared.policy.redact_map(std::mem::take(&mut self.input)),
            output: shared.policy.redact_map(std::mem::take(&mut self.output)),
            status: self.status,
            state_ref: Some(state_ref),
            diff_ref,
            duration_ms: Some(self.started.elapsed().as_millis() as u64),
            extra: std::mem::take(&mut self.extra),
        };
        shared.store.append_step(&record)?;
        state.prev_snapshot = Some(snapshot);
        state.open_step = None;
        Ok(self.step_id)
    }
}

impl Drop for StepScope {
    fn drop(&mut self) {
        if self.closed || self.shared.is_none() {
            return;
        }
        if std::thread::panicking() {
            self.status = StepStatus::Error;
            self.output.insert(
                "error".to_string(),
                Value::String("step scope dropped during panic".to_string()),
            );
        }
        let step_id = self.step_id;
        if let Err(error) = self.finalize() {
            diag(
                "error",
                "step.finalize_failed",
                json!({"step_id": step_id, "error": error.to_string()}),
            );
        }
    }
}

/// Refuse oversized snapshots: keep tool state and token counts but drop the
/// memory body, leaving a marker entry.
fn oversize_guard(shared: &RecorderShared, step_id: u64, staged: MemoryState) -> MemoryState {
    let size = serde_json::to_vec(&staged).map(|b| b.len() as u64).unwrap_or(0);
    if size <= shared.max_snapshot_bytes {
        return staged;
    }
    diag(
        "warn",
        "snapshot.oversize",
        json!({
            "run_id": shared.store.run_id(),
            "step_id": step_id,
            "bytes": size,
            "limit": shared.max_snapshot_bytes,
        }),
    );
    MemoryState {
        memory: vec![json!({"dropped": "snapshot exceeded size limit", "bytes": size})],
        context_tokens: staged.context_tokens,
        tools_state: staged.tools_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LoadedRun;
    use std::sync::PoisonError;

    // Recorder tests share the process-wide active-run slot.
    static TEST_GUARD: Mutex<()> = Mutex::new(());

    fn guard() -> std::sync::MutexGuard<'static, ()> {
        TEST_GUARD.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config_in(dir: &std::path::Path, strict: bool) -> TraceConfig {
        let mut config = TraceConfig::default();
        config.recorder.base_dir = dir.to_path_buf();
        config.recorder.strict = strict;
        config
    }

    fn input(value: Value) -> Map<String, Value> {
        json_map(value)
    }

    #[test]
    fn happy_path_records_and_seals() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), true)).expect("init");
        let run_dir = recorder.run_dir();

        let mut scope = recorder
            .step(Phase::Reason, input(json!({"p": "hi"})))
            .expect("open step");
        scope.set_output("r", json!("ok"));
        assert_eq!(scope.close().expect("close"), 1);

        recorder.stop("success").expect("stop");

        let run = LoadedRun::load(&run_dir).expect("load");
        assert_eq!(run.meta.status, RunStatus::Success);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].output.get("r"), Some(&json!("ok")));
        assert_eq!(run.steps[0].state_ref.as_deref(), Some("snapshots/step_1.json"));
        assert!(run.steps[0].duration_ms.is_some());
        run.verify_snapshots().expect("snapshots exist");
    }

    #[test]
    fn second_init_without_stop_is_already_active_in_strict() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path(), true);
        let recorder = TraceRecorder::init(RunSpec::default(), &config).expect("init");
        assert!(matches!(
            TraceRecorder::init(RunSpec::default(), &config),
            Err(HindsightError::AlreadyActive(_))
        ));
        recorder.stop("success").expect("stop");
    }

    #[test]
    fn second_init_implicitly_stops_previous_in_lenient() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path(), false);
        let first = TraceRecorder::init(RunSpec::default(), &config).expect("init");
        let first_dir = first.run_dir();
        let second = TraceRecorder::init(RunSpec::default(), &config).expect("init again");

        let previous = LoadedRun::load(&first_dir).expect("load");
        assert_eq!(previous.meta.status, RunStatus::Aborted);
        assert_eq!(previous.meta.termination_reason.as_deref(), Some("restarted"));
        second.stop("success").expect("stop");
    }

    #[test]
    fn instrumentation_after_stop_is_no_active_run_in_strict() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), true)).expect("init");
        recorder.stop("success").expect("stop");
        assert!(matches!(
            recorder.step(Phase::Reason, Map::new()),
            Err(HindsightError::NoActiveRun(_))
        ));
        assert!(matches!(
            recorder.update_memory(MemoryState::default()),
            Err(HindsightError::NoActiveRun(_))
        ));
        assert!(matches!(
            recorder.stop("success"),
            Err(HindsightError::NoActiveRun(_))
        ));
    }

    #[test]
    fn lenient_mode_drops_instrumentation_after_stop() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), false)).expect("init");
        let run_dir = recorder.run_dir();
        recorder.stop("success").expect("stop");

        let scope = recorder
            .step(Phase::Reason, input(json!({"p": 1})))
            .expect("inert scope");
        assert_eq!(scope.step_id(), 0);
        assert_eq!(scope.close().expect("close"), 0);

        let run = LoadedRun::load(&run_dir).expect("load");
        assert!(run.steps.is_empty());
    }

    #[test]
    fn nested_step_is_rejected() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), true)).expect("init");
        let first = recorder.step(Phase::Reason, Map::new()).expect("open");
        assert!(matches!(
            recorder.step(Phase::Tool, Map::new()),
            Err(HindsightError::NestedStep(_))
        ));
        first.close().expect("close");
        recorder.stop("success").expect("stop");
    }

    #[test]
    fn failed_scope_records_error_step() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), true)).expect("init");
        let run_dir = recorder.run_dir();

        let scope = recorder
            .step(Phase::Tool, input(json!({"tool": "search"})))
            .expect("open");
        scope.fail("connection reset").expect("fail");
        recorder.stop("error").expect("stop");

        let run = LoadedRun::load(&run_dir).expect("load");
        assert_eq!(run.steps[0].status, StepStatus::Error);
        assert_eq!(run.steps[0].output.get("error"), Some(&json!("connection reset")));
        assert_eq!(run.meta.status, RunStatus::Failure);
    }

    #[test]
    fn secrets_are_redacted_before_persistence() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), true)).expect("init");
        let run_dir = recorder.run_dir();

        let scope = recorder
            .step(
                Phase::Reason,
                input(json!({"api_key": "sk-ABCDEFGHIJKLMNOPQRSTUV"})),
            )
            .expect("open");
        scope.close().expect("close");
        recorder.stop("success").expect("stop");

        let run = LoadedRun::load(&run_dir).expect("load");
        assert_eq!(run.steps[0].input.get("api_key"), Some(&json!("********")));
        let raw = std::fs::read_to_string(run_dir.join("steps.jsonl")).expect("read");
        assert!(!raw.contains("sk-ABCDEFGHIJKLMNOPQRSTUV"));
    }

    #[test]
    fn limit_truncates_with_terminate_marker() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_in(dir.path(), false);
        config.recorder.max_steps = 3;
        let recorder = TraceRecorder::init(RunSpec::default(), &config).expect("init");
        let run_dir = recorder.run_dir();

        for index in 0..4u64 {
            let scope = recorder
                .step(Phase::Reason, input(json!({"n": index})))
                .expect("open");
            scope.close().expect("close");
        }

        let run = LoadedRun::load(&run_dir).expect("load");
        assert_eq!(run.steps.len(), 3);
        assert!(run.meta.truncated);
        assert_eq!(run.meta.status, RunStatus::LimitExceeded);
        assert_eq!(
            run.meta.termination_reason.as_deref(),
            Some("limit_exceeded")
        );
        assert_eq!(run.steps[2].phase, Phase::Terminate);
        run.verify_contiguous().expect("contiguous");
    }

    #[test]
    fn strict_limit_overflow_is_limit_exceeded() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_in(dir.path(), true);
        config.recorder.max_steps = 2;
        let recorder = TraceRecorder::init(RunSpec::default(), &config).expect("init");

        recorder
            .step(Phase::Reason, Map::new())
            .expect("open")
            .close()
            .expect("close");
        assert!(matches!(
            recorder.step(Phase::Reason, Map::new()),
            Err(HindsightError::LimitExceeded(_))
        ));
    }

    #[test]
    fn staged_memory_attaches_to_next_step_and_diffs() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), true)).expect("init");
        let run_dir = recorder.run_dir();

        recorder
            .update_memory(MemoryState {
                memory: vec![json!({"goal": "find docs"})],
                context_tokens: 10,
                tools_state: Map::new(),
            })
            .expect("stage");
        recorder
            .step(Phase::Reason, Map::new())
            .expect("open")
            .close()
            .expect("close");

        recorder
            .update_memory(MemoryState {
                memory: vec![json!({"goal": "read docs"})],
                context_tokens: 25,
                tools_state: Map::new(),
            })
            .expect("stage");
        recorder
            .step(Phase::Observe, Map::new())
            .expect("open")
            .close()
            .expect("close");
        recorder.stop("success").expect("stop");

        let run = LoadedRun::load(&run_dir).expect("load");
        let first = run.snapshot(1).expect("read").expect("snapshot 1");
        assert_eq!(first.context_tokens, 10);
        let second = run.snapshot(2).expect("read").expect("snapshot 2");
        assert_eq!(second.context_tokens, 25);

        assert!(run.steps[0].diff_ref.is_none());
        let diff = run.diff(2).expect("read").expect("diff 2");
        assert!(!diff.changes.is_empty());
        let rebuilt = crate::record::apply_diff(&first, &diff);
        assert_eq!(rebuilt, second);
    }

    #[test]
    fn snapshot_carries_forward_when_nothing_staged() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), true)).expect("init");
        let run_dir = recorder.run_dir();

        recorder
            .update_memory(MemoryState {
                memory: vec![json!({"note": "persists"})],
                context_tokens: 5,
                tools_state: Map::new(),
            })
            .expect("stage");
        recorder
            .step(Phase::Reason, Map::new())
            .expect("open")
            .close()
            .expect("close");
        recorder
            .step(Phase::Tool, input(json!({"tool": "search"})))
            .expect("open")
            .close()
            .expect("close");
        recorder.stop("success").expect("stop");

        let run = LoadedRun::load(&run_dir).expect("load");
        let second = run.snapshot(2).expect("read").expect("snapshot 2");
        assert_eq!(second.memory, vec![json!({"note": "persists"})]);
        // Identical content: no diff file for step 2.
        assert!(run.steps[1].diff_ref.is_none());
    }

    #[test]
    fn io_after_close_is_discarded_and_counted() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), false)).expect("init");

        let scope = recorder
            .step(Phase::Tool, input(json!({"tool": "search"})))
            .expect("open");
        recorder
            .capture_io(IoStream::Stdout, b"in scope")
            .expect("capture");
        scope.close().expect("close");
        recorder
            .capture_io(IoStream::Stdout, b"too late")
            .expect("capture late");

        assert_eq!(recorder.dropped_io_bytes(), 8);
        recorder.stop("success").expect("stop");
    }

    #[test]
    fn dropped_scope_still_records_step() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder =
            TraceRecorder::init(RunSpec::default(), &config_in(dir.path(), true)).expect("init");
        let run_dir = recorder.run_dir();

        {
            let mut scope = recorder
                .step(Phase::Reason, input(json!({"p": "x"})))
                .expect("open");
            scope.set_output("partial", json!(true));
            // Dropped without close().
        }
        recorder.stop("success").expect("stop");

        let run = LoadedRun::load(&run_dir).expect("load");
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].output.get("partial"), Some(&json!(true)));
    }

    #[test]
    fn oversized_snapshot_is_replaced_with_marker() {
        let _guard = guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_in(dir.path(), true);
        config.recorder.max_snapshot_bytes = 64;
        let recorder = TraceRecorder::init(RunSpec::default(), &config).expect("init");
        let run_dir = recorder.run_dir();

        recorder
            .update_memory(MemoryState {
                memory: vec![json!({"blob": "y".repeat(500)})],
                context_tokens: 1,
                tools_state: Map::new(),
            })
            .expect("stage");
        recorder
            .step(Phase::Memory, Map::new())
            .expect("open")
            .close()
            .expect("close");
        recorder.stop("success").expect("stop");

        let run = LoadedRun::load(&run_dir).expect("load");
        let snapshot = run.snapshot(1).expect("read").expect("snapshot");
        assert_eq!(snapshot.context_tokens, 1);
        assert!(snapshot.memory[0].get("dropped").is_some());
    }
}
