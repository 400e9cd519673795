//! Trace configuration: defaults overlaid with an optional TOML file.

use crate::errors::HindsightError;
use crate::redact::{RedactionPolicy, DEFAULT_KEY_PATTERN, DEFAULT_MASK};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_STEPS: u64 = 1000;
pub const DEFAULT_MAX_SNAPSHOT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceConfig {
    pub recorder: RecorderConfig,
    pub redaction: RedactionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecorderConfig {
    /// Directory under which run directories are created.
    pub base_dir: PathBuf,
    /// Maximum persisted steps per run, terminate marker included.
    pub max_steps: u64,
    pub max_snapshot_bytes: u64,
    /// Strict mode turns instrumentation misuse into errors; lenient mode
    /// drops the offending call.
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedactionConfig {
    pub mask: String,
    /// Case-insensitive regex matched against payload key names.
    pub key_pattern: String,
    /// Value patterns appended to the built-in secret shapes.
    pub extra_patterns: Vec<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            recorder: RecorderConfig {
                base_dir: PathBuf::from("traces"),
                max_steps: DEFAULT_MAX_STEPS,
                max_snapshot_bytes: DEFAULT_MAX_SNAPSHOT_BYTES,
                strict: false,
            },
            redaction: RedactionConfig {
                mask: DEFAULT_MASK.to_string(),
                key_pattern: DEFAULT_KEY_PATTERN.to_string(),
                extra_patterns: Vec::new(),
            },
        }
    }
}

impl TraceConfig {
    pub fn strict() -> Self {
        let mut config = Self::default();
        config.recorder.strict = true;
        config
    }

    /// Build the composed redaction policy this configuration describes.
    pub fn redaction_policy(&self) -> Result<RedactionPolicy, HindsightError> {
        let key_pattern = Regex::new(&self.redaction.key_pattern).map_err(|e| {
            HindsightError::ConfigParse(format!("redaction key pattern: {e}"))
        })?;
        for raw in &self.redaction.extra_patterns {
            Regex::new(raw).map_err(|e| {
                HindsightError::ConfigParse(format!("redaction pattern {raw:?}: {e}"))
            })?;
        }
        let policy = RedactionPolicy::new(
            RedactionPolicy::default_patterns(),
            key_pattern,
            self.redaction.mask.clone(),
        )
        .with_extra_patterns(&self.redaction.extra_patterns);
        Ok(policy)
    }
}

// ── TOML overlay ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialTraceConfig {
    recorder: Option<PartialRecorderConfig>,
    redaction: Option<PartialRedactionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialRecorderConfig {
    base_dir: Option<PathBuf>,
    max_steps: Option<u64>,
    max_snapshot_bytes: Option<u64>,
    strict: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialRedactionConfig {
    mask: Option<String>,
    key_pattern: Option<String>,
    extra_patterns: Option<Vec<String>>,
}

/// Load configuration: defaults, overlaid with `path` when given.
pub fn load_config(path: Option<&Path>) -> Result<TraceConfig, HindsightError> {
    let mut config = TraceConfig::default();
    let Some(path) = path else {
        return Ok(config);
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| HindsightError::Io(format!("{}: {e}", path.display())))?;
    let partial: PartialTraceConfig =
        toml::from_str(&raw).map_err(|e| HindsightError::ConfigParse(e.to_string()))?;

    if let Some(recorder) = partial.recorder {
        if let Some(base_dir) = recorder.base_dir {
            config.recorder.base_dir = base_dir;
        }
        if let Some(max_steps) = recorder.max_steps {
            if max_steps == 0 {
                return Err(HindsightError::ConfigParse(
                    "recorder.max_steps must be at least 1".to_string(),
                ));
            }
            config.recorder.max_steps = max_steps;
        }
        if let Some(max_snapshot_bytes) = recorder.max_snapshot_bytes {
            config.recorder.max_snapshot_bytes = max_snapshot_bytes;
        }
        if let Some(strict) = recorder.strict {
            config.recorder.strict = strict;
        }
    }
    if let Some(redaction) = partial.redaction {
        if let Some(mask) = redaction.mask {
            config.redaction.mask = mask;
        }
        if let Some(key_pattern) = redaction.key_pattern {
            config.redaction.key_pattern = key_pattern;
        }
        if let Some(extra_patterns) = redaction.extra_patterns {
            config.redaction.extra_patterns = extra_patterns;
        }
    }
    config.redaction_policy()?;
    Ok(config)
}
