use serde::{Deserialize, Serialize};

/// The kind of action a recorded step represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Reason,
    Tool,
    Observe,
    Memory,
    Retry,
    Terminate,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reason => "reason",
            Self::Tool => "tool",
            Self::Observe => "observe",
            Self::Memory => "memory",
            Self::Retry => "retry",
            Self::Terminate => "terminate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reason" => Some(Self::Reason),
            "tool" => Some(Self::Tool),
            "observe" => Some(Self::Observe),
            "memory" => Some(Self::Memory),
            "retry" => Some(Self::Retry),
            "terminate" => Some(Self::Terminate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
    Retry,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Retry => "retry",
        }
    }
}

/// Run status as persisted in `meta.json`. `Active` is the pre-seal value;
/// the other four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Success,
    Failure,
    LimitExceeded,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::LimitExceeded => "limit_exceeded",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    StateMismatch,
    OutputMismatch,
    MissingStep,
    ExtraStep,
}

impl DivergenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateMismatch => "state_mismatch",
            Self::OutputMismatch => "output_mismatch",
            Self::MissingStep => "missing_step",
            Self::ExtraStep => "extra_step",
        }
    }
}

/// How two steps at the same position relate during two-run alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentKind {
    Exact,
    Phase,
    Mismatch,
}

impl AlignmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Phase => "phase",
            Self::Mismatch => "mismatch",
        }
    }
}
