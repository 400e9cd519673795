//! Process-wide JSONL diagnostics logger.
//!
//! Recorder lifecycle events, truncation notices, and dropped-I/O warnings
//! land here, one JSON object per line. The slot follows the
//! `OnceLock<Mutex<Option<…>>>` pattern used for the active-run handle in
//! `recorder.rs`.

use crate::errors::HindsightError;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct DiagLogger {
    pub path: PathBuf,
}

static DIAG_LOGGER: OnceLock<Mutex<Option<DiagLogger>>> = OnceLock::new();
static DIAG_WRITE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static ID_NONCE: AtomicU64 = AtomicU64::new(1);

fn diag_slot() -> &'static Mutex<Option<DiagLogger>> {
    DIAG_LOGGER.get_or_init(|| Mutex::new(None))
}

fn diag_write_lock() -> &'static Mutex<()> {
    DIAG_WRITE_LOCK.get_or_init(|| Mutex::new(()))
}

/// Point the diagnostics logger at `path`. Parent directories are created.
pub fn init_diag_logger(path: impl AsRef<Path>) -> Result<(), HindsightError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| HindsightError::Io(e.to_string()))?;
    }
    *diag_slot().lock().expect("diag logger lock") = Some(DiagLogger { path });
    Ok(())
}

pub fn clear_diag_logger() {
    *diag_slot().lock().expect("diag logger lock") = None;
}

/// Append a diagnostics line, if a logger is installed. Never fails the
/// caller; logging problems are swallowed.
pub fn diag(level: &str, event: &str, payload: Value) {
    let logger = {
        let slot = diag_slot().lock().expect("diag logger lock");
        slot.clone()
    };
    let Some(logger) = logger else {
        return;
    };

    let line = json!({
        "ts_ms": now_ms(),
        "level": level,
        "event": event,
        "payload": truncate_payload(payload),
    });
    let Ok(mut rendered) = serde_json::to_string(&line) else {
        return;
    };
    rendered.push('\n');

    let _guard = diag_write_lock().lock().expect("diag write lock");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&logger.path);
    if let Ok(mut file) = file {
        let _ = file.write_all(rendered.as_bytes());
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Random hex identifier derived from a process nonce and the wall clock.
pub fn random_hex(bytes: usize) -> String {
    use std::fmt::Write as _;
    let mut hasher = Sha256::new();
    let nonce = ID_NONCE.fetch_add(1, Ordering::Relaxed);
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    hasher.update(nonce.to_le_bytes());
    hasher.update(now_ns.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(bytes * 2);
    for byte in digest.iter().take(bytes) {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn truncate_payload(value: Value) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= MAX_PAYLOAD_BYTES {
        return value;
    }
    Value::String(truncate_utf8(&rendered, MAX_PAYLOAD_BYTES))
}

fn truncate_utf8(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut cutoff = max_bytes.saturating_sub(3);
    while !value.is_char_boundary(cutoff) {
        cutoff = cutoff.saturating_sub(1);
    }
    format!("{}...", &value[..cutoff])
}
