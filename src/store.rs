//! Artifact store: authoritative persistence for one run directory.
//!
//! Layout:
//!
//! ```text
//! <run_dir>/
//!   meta.json
//!   steps.jsonl
//!   snapshots/step_<id>.json
//!   diffs/step_<id>.diff.json
//!   tools/step_<id>.stdout
//!   tools/step_<id>.stderr
//! ```
//!
//! Writes are append-only while the run is unsealed. Readers tolerate
//! partially-written runs: a malformed trailing step line is dropped and
//! the run reports as partial.

use crate::errors::HindsightError;
use crate::record::{RunMeta, Snapshot, SnapshotDiff, StepRecord};
use crate::types::RunStatus;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const META_FILE: &str = "meta.json";
pub const STEP_LOG_FILE: &str = "steps.jsonl";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const DIFFS_DIR: &str = "diffs";
pub const TOOLS_DIR: &str = "tools";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStream {
    Stdout,
    Stderr,
}

impl IoStream {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

pub fn snapshot_ref(step_id: u64) -> String {
    format!("{SNAPSHOTS_DIR}/step_{step_id}.json")
}

pub fn diff_ref(step_id: u64) -> String {
    format!("{DIFFS_DIR}/step_{step_id}.diff.json")
}

fn tool_io_rel(step_id: u64, stream: IoStream) -> String {
    format!("{TOOLS_DIR}/step_{step_id}.{}", stream.extension())
}

// ── ArtifactStore ─────────────────────────────────────────────────────────────

/// Single-writer handle over an unsealed run directory. The step log file
/// handle is held for the duration of the run and flushed on each append;
/// snapshot and diff writes open, write, and close per step.
pub struct ArtifactStore {
    run_dir: PathBuf,
    meta: Mutex<RunMeta>,
    log: Mutex<BufWriter<File>>,
    sealed: AtomicBool,
}

impl ArtifactStore {
    /// Establish the run directory, write initial metadata, and create the
    /// sidecar subdirectories.
    pub fn create(run_dir: &Path, meta: RunMeta) -> Result<Self, HindsightError> {
        if run_dir.join(META_FILE).exists() {
            return Err(HindsightError::InvalidArtifact(format!(
                "run directory already exists: {}",
                run_dir.display()
            )));
        }
        for sub in [SNAPSHOTS_DIR, DIFFS_DIR, TOOLS_DIR] {
            fs::create_dir_all(run_dir.join(sub))
                .map_err(|e| HindsightError::Io(e.to_string()))?;
        }
        write_meta(run_dir, &meta)?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(STEP_LOG_FILE))
            .map_err(|e| HindsightError::Io(e.to_string()))?;
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            meta: Mutex::new(meta),
            log: Mutex::new(BufWriter::new(log_file)),
            sealed: AtomicBool::new(false),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_id(&self) -> String {
        self.meta.lock().expect("store meta lock").run_id.clone()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn ensure_unsealed(&self, operation: &str) -> Result<(), HindsightError> {
        if self.is_sealed() {
            return Err(HindsightError::Sealed(format!(
                "{operation} on sealed run {}",
                self.run_id()
            )));
        }
        Ok(())
    }

    /// Append one record to the step log: one line, one trailing newline,
    /// one flush.
    pub fn append_step(&self, record: &StepRecord) -> Result<(), HindsightError> {
        self.ensure_unsealed("append_step")?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut log = self.log.lock().expect("step log lock");
        log.write_all(line.as_bytes())
            .map_err(|e| HindsightError::Io(e.to_string()))?;
        log.flush().map_err(|e| HindsightError::Io(e.to_string()))
    }

    pub fn write_snapshot(
        &self,
        step_id: u64,
        snapshot: &Snapshot,
    ) -> Result<String, HindsightError> {
        self.ensure_unsealed("write_snapshot")?;
        let rel = snapshot_ref(step_id);
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        fs::write(self.run_dir.join(&rel), bytes)
            .map_err(|e| HindsightError::Io(e.to_string()))?;
        Ok(rel)
    }

    pub fn write_diff(
        &self,
        step_id: u64,
        diff: &SnapshotDiff,
    ) -> Result<String, HindsightError> {
        self.ensure_unsealed("write_diff")?;
        let rel = diff_ref(step_id);
        let bytes = serde_json::to_vec_pretty(diff)?;
        fs::write(self.run_dir.join(&rel), bytes)
            .map_err(|e| HindsightError::Io(e.to_string()))?;
        Ok(rel)
    }

    /// Append captured bytes to the step's stdout or stderr sidecar.
    pub fn capture_tool_io(
        &self,
        step_id: u64,
        stream: IoStream,
        bytes: &[u8],
    ) -> Result<(), HindsightError> {
        self.ensure_unsealed("capture_tool_io")?;
        if bytes.is_empty() {
            return Ok(());
        }
        let path = self.run_dir.join(tool_io_rel(step_id, stream));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| HindsightError::Io(e.to_string()))?;
        file.write_all(bytes)
            .map_err(|e| HindsightError::Io(e.to_string()))
    }

    /// Rewrite metadata with terminal fields and forbid further writes.
    /// Sealing flushes and syncs the step log for crash safety.
    pub fn seal(
        &self,
        final_status: RunStatus,
        reason: Option<&str>,
        truncated: bool,
    ) -> Result<(), HindsightError> {
        self.ensure_unsealed("seal")?;
        {
            let mut log = self.log.lock().expect("step log lock");
            log.flush().map_err(|e| HindsightError::Io(e.to_string()))?;
            log.get_ref()
                .sync_all()
                .map_err(|e| HindsightError::Io(e.to_string()))?;
        }
        let meta = {
            let mut meta = self.meta.lock().expect("store meta lock");
            meta.status = final_status;
            meta.termination_reason = reason.map(str::to_string);
            meta.truncated = truncated;
            meta.clone()
        };
        write_meta(&self.run_dir, &meta)?;
        self.sealed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn write_meta(run_dir: &Path, meta: &RunMeta) -> Result<(), HindsightError> {
    let bytes = serde_json::to_vec_pretty(meta)?;
    fs::write(run_dir.join(META_FILE), bytes).map_err(|e| HindsightError::Io(e.to_string()))
}

// ── LoadedRun ─────────────────────────────────────────────────────────────────

/// A run read back from disk. Metadata and the step log are parsed eagerly;
/// snapshots, diffs, and tool I/O resolve lazily and tolerate absence.
#[derive(Debug, Clone)]
pub struct LoadedRun {
    pub run_dir: PathBuf,
    pub meta: RunMeta,
    pub steps: Vec<StepRecord>,
    /// True when the run was never sealed or its final log line was
    /// malformed (crash before seal).
    pub partial: bool,
}

impl LoadedRun {
    pub fn load(run_dir: &Path) -> Result<Self, HindsightError> {
        let meta_path = run_dir.join(META_FILE);
        let raw_meta = fs::read_to_string(&meta_path).map_err(|e| {
            HindsightError::InvalidArtifact(format!("{}: {e}", meta_path.display()))
        })?;
        let meta: RunMeta = serde_json::from_str(&raw_meta).map_err(|e| {
            HindsightError::InvalidArtifact(format!("{}: {e}", meta_path.display()))
        })?;

        let log_path = run_dir.join(STEP_LOG_FILE);
        let raw_log = match fs::read_to_string(&log_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(HindsightError::InvalidArtifact(format!(
                    "{}: {e}",
                    log_path.display()
                )))
            }
        };

        let mut partial = !meta.status.is_terminal();
        let lines: Vec<&str> = raw_log
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        let mut steps = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<StepRecord>(line) {
                Ok(step) => steps.push(step),
                Err(e) if index + 1 == lines.len() => {
                    // Trailing line truncated mid-write; drop it.
                    partial = true;
                    crate::logging::diag(
                        "warn",
                        "store.trailing_line_dropped",
                        serde_json::json!({
                            "run_dir": run_dir.display().to_string(),
                            "line": index + 1,
                            "error": e.to_string(),
                        }),
                    );
                }
                Err(e) => {
                    return Err(HindsightError::InvalidArtifact(format!(
                        "{} line {}: {e}",
                        log_path.display(),
                        index + 1
                    )))
                }
            }
        }

        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            meta,
            steps,
            partial,
        })
    }

    /// Step identifiers must form the contiguous sequence `1..=N`; gaps
    /// indicate corruption.
    pub fn verify_contiguous(&self) -> Result<(), HindsightError> {
        for (index, step) in self.steps.iter().enumerate() {
            let expected = index as u64 + 1;
            if step.step_id != expected {
                return Err(HindsightError::InvalidArtifact(format!(
                    "step log gap: expected step {expected}, found {}",
                    step.step_id
                )));
            }
        }
        Ok(())
    }

    /// In a sealed run, every step's snapshot reference must resolve.
    pub fn verify_snapshots(&self) -> Result<(), HindsightError> {
        if self.partial {
            return Ok(());
        }
        for step in &self.steps {
            let Some(state_ref) = &step.state_ref else {
                continue;
            };
            let path = self.run_dir.join(state_ref);
            if !path.exists() {
                return Err(HindsightError::InvalidArtifact(format!(
                    "step {} references missing snapshot {state_ref}",
                    step.step_id
                )));
            }
            let raw = fs::read_to_string(&path)
                .map_err(|e| HindsightError::InvalidArtifact(format!("{state_ref}: {e}")))?;
            serde_json::from_str::<Snapshot>(&raw)
                .map_err(|e| HindsightError::InvalidArtifact(format!("{state_ref}: {e}")))?;
        }
        Ok(())
    }

    pub fn step(&self, step_id: u64) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn snapshot(&self, step_id: u64) -> Result<Option<Snapshot>, HindsightError> {
        self.read_sidecar(&snapshot_ref(step_id))
    }

    pub fn diff(&self, step_id: u64) -> Result<Option<SnapshotDiff>, HindsightError> {
        self.read_sidecar(&diff_ref(step_id))
    }

    pub fn tool_io(
        &self,
        step_id: u64,
        stream: IoStream,
    ) -> Result<Option<Vec<u8>>, HindsightError> {
        let path = self.run_dir.join(tool_io_rel(step_id, stream));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HindsightError::Io(e.to_string())),
        }
    }

    /// Snapshot of the last step that has one, resolved via `state_ref`.
    pub fn final_snapshot(&self) -> Result<Option<Snapshot>, HindsightError> {
        for step in self.steps.iter().rev() {
            if let Some(state_ref) = &step.state_ref {
                if let Some(snapshot) = self.read_sidecar::<Snapshot>(state_ref)? {
                    return Ok(Some(snapshot));
                }
            }
        }
        Ok(None)
    }

    fn read_sidecar<T: serde::de::DeserializeOwned>(
        &self,
        rel: &str,
    ) -> Result<Option<T>, HindsightError> {
        let path = self.run_dir.join(rel);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HindsightError::Io(e.to_string())),
        };
        let value = serde_json::from_str(&raw)
            .map_err(|e| HindsightError::InvalidArtifact(format!("{rel}: {e}")))?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Phase, StepStatus};
    use serde_json::Map;

    fn test_meta(run_id: &str) -> RunMeta {
        RunMeta {
            run_id: run_id.to_string(),
            agent_version: "1.0".to_string(),
            llm: "test-llm".to_string(),
            temperature: 0.0,
            tools: vec!["search".to_string()],
            seed: 42,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            status: RunStatus::Active,
            termination_reason: None,
            truncated: false,
            tags: Vec::new(),
        }
    }

    fn test_step(step_id: u64) -> StepRecord {
        StepRecord {
            step_id,
            timestamp: 1000 + step_id,
            phase: Phase::Reason,
            input: Map::new(),
            output: Map::new(),
            status: StepStatus::Ok,
            state_ref: None,
            diff_ref: None,
            duration_ms: None,
            extra: Map::new(),
        }
    }

    fn test_snapshot(step_id: u64) -> Snapshot {
        Snapshot {
            step_id,
            memory: vec![serde_json::json!({"note": "n"})],
            context_tokens: 1,
            tools_state: Map::new(),
        }
    }

    #[test]
    fn create_establishes_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let _store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        assert!(run_dir.join(META_FILE).exists());
        assert!(run_dir.join(SNAPSHOTS_DIR).is_dir());
        assert!(run_dir.join(DIFFS_DIR).is_dir());
        assert!(run_dir.join(TOOLS_DIR).is_dir());
    }

    #[test]
    fn create_refuses_existing_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let _store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        assert!(matches!(
            ArtifactStore::create(&run_dir, test_meta("run_a")),
            Err(HindsightError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn append_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        store.append_step(&test_step(1)).expect("append");
        store.append_step(&test_step(2)).expect("append");
        store
            .seal(RunStatus::Success, None, false)
            .expect("seal");

        let run = LoadedRun::load(&run_dir).expect("load");
        assert_eq!(run.steps.len(), 2);
        assert!(!run.partial);
        assert_eq!(run.meta.status, RunStatus::Success);
        run.verify_contiguous().expect("contiguous");
    }

    #[test]
    fn writes_after_seal_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        store.seal(RunStatus::Success, None, false).expect("seal");

        assert!(matches!(
            store.append_step(&test_step(1)),
            Err(HindsightError::Sealed(_))
        ));
        assert!(matches!(
            store.write_snapshot(1, &test_snapshot(1)),
            Err(HindsightError::Sealed(_))
        ));
        assert!(matches!(
            store.capture_tool_io(1, IoStream::Stdout, b"late"),
            Err(HindsightError::Sealed(_))
        ));
        assert!(matches!(
            store.seal(RunStatus::Success, None, false),
            Err(HindsightError::Sealed(_))
        ));
    }

    #[test]
    fn malformed_trailing_line_is_dropped_and_partial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        store.append_step(&test_step(1)).expect("append");
        store.seal(RunStatus::Success, None, false).expect("seal");

        // Simulate a crash mid-append on a later revision of the log.
        let mut raw = fs::read_to_string(run_dir.join(STEP_LOG_FILE)).expect("read");
        raw.push_str("{\"step_id\":2,\"timest");
        fs::write(run_dir.join(STEP_LOG_FILE), raw).expect("write");

        let run = LoadedRun::load(&run_dir).expect("load");
        assert_eq!(run.steps.len(), 1);
        assert!(run.partial);
    }

    #[test]
    fn malformed_interior_line_is_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        store.append_step(&test_step(1)).expect("append");
        store.append_step(&test_step(2)).expect("append");

        let raw = fs::read_to_string(run_dir.join(STEP_LOG_FILE)).expect("read");
        let broken = raw.replacen("{\"step_id\":1", "{\"broken\":1", 1);
        fs::write(run_dir.join(STEP_LOG_FILE), broken).expect("write");

        assert!(matches!(
            LoadedRun::load(&run_dir),
            Err(HindsightError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn missing_meta_is_invalid_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            LoadedRun::load(&dir.path().join("absent")),
            Err(HindsightError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn unsealed_run_loads_as_partial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        store.append_step(&test_step(1)).expect("append");
        drop(store);

        let run = LoadedRun::load(&run_dir).expect("load");
        assert!(run.partial);
        assert_eq!(run.meta.status, RunStatus::Active);
    }

    #[test]
    fn tool_io_appends_per_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        store
            .capture_tool_io(3, IoStream::Stdout, b"part one ")
            .expect("capture");
        store
            .capture_tool_io(3, IoStream::Stdout, b"part two")
            .expect("capture");
        store
            .capture_tool_io(3, IoStream::Stderr, b"warning")
            .expect("capture");
        store.seal(RunStatus::Success, None, false).expect("seal");

        let run = LoadedRun::load(&run_dir).expect("load");
        let stdout = run.tool_io(3, IoStream::Stdout).expect("read").expect("some");
        assert_eq!(stdout, b"part one part two");
        let stderr = run.tool_io(3, IoStream::Stderr).expect("read").expect("some");
        assert_eq!(stderr, b"warning");
        assert_eq!(run.tool_io(4, IoStream::Stdout).expect("read"), None);
    }

    #[test]
    fn snapshot_and_diff_sidecars_resolve_lazily() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = dir.path().join("run_a");
        let store = ArtifactStore::create(&run_dir, test_meta("run_a")).expect("create");
        let rel = store.write_snapshot(1, &test_snapshot(1)).expect("write");
        assert_eq!(rel, "snapshots/step_1.json");

        let mut step = test_step(1);
        step.state_ref = Some(rel);
        store.append_step(&step).expect("append");
        store.seal(RunStatus::Success, None, false).expect("seal");

        let run = LoadedRun::load(&run_dir).expect("load");
        let snapshot = run.snapshot(1).expect("read").expect("some");
        assert_eq!(snapshot.step_id, 1);
        assert_eq!(run.diff(1).expect("read"), None);
        run.verify_snapshots().expect("snapshots present");
    }
}
