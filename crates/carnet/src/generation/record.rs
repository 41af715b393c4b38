//! The persisted aggregate describing one batch run.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a batch exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Bulk,
    Single,
    TemplateChange,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::Bulk => "bulk",
            GenerationKind::Single => "single",
            GenerationKind::TemplateChange => "template_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bulk" => Some(GenerationKind::Bulk),
            "single" => Some(GenerationKind::Single),
            "template_change" => Some(GenerationKind::TemplateChange),
            _ => None,
        }
    }
}

/// Lifecycle state. Transitions only move forward:
/// `pending -> running -> {completed | failed}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl GenerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Pending => "pending",
            GenerationState::Running => "running",
            GenerationState::Completed => "completed",
            GenerationState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GenerationState::Pending),
            "running" => Some(GenerationState::Running),
            "completed" => Some(GenerationState::Completed),
            "failed" => Some(GenerationState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationState::Completed | GenerationState::Failed)
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// One structured entry of a batch log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub text: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl LogEntry {
    pub fn new(severity: Severity, text: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            text: text.into(),
            data,
        }
    }

    pub fn info(text: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(Severity::Info, text, data)
    }

    pub fn warning(text: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(Severity::Warning, text, data)
    }

    pub fn error(text: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(Severity::Error, text, data)
    }
}

/// Snapshot of one batch run as stored in `generations`.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRecord {
    /// Caller-visible session identifier used for polling.
    pub session_id: String,
    pub owner: Option<String>,
    pub kind: GenerationKind,
    pub state: GenerationState,
    pub template_id: Option<i64>,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed_count: u64,
    /// Advisory, last writer wins.
    pub message: String,
    /// Newest entries last; bounded by the configured log capacity.
    pub log: Vec<LogEntry>,
    pub archive_reference: Option<String>,
    pub finalize_claimed: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationRecord {
    /// All units have reported and the batch still awaits finalization.
    pub fn ready_for_finalization(&self) -> bool {
        self.state == GenerationState::Running && self.processed >= self.total
    }
}

/// Fields supplied by the Supervisor when a batch is created.
#[derive(Debug, Clone)]
pub struct NewGeneration {
    pub session_id: String,
    pub owner: Option<String>,
    pub kind: GenerationKind,
    pub template_id: Option<i64>,
}

/// Result of one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Succeeded { artifact: PathBuf },
    Failed { error: String },
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded { .. })
    }
}

/// A successful unit as listed for archiving.
#[derive(Debug, Clone)]
pub struct ProducedCard {
    pub driver_id: i64,
    pub artifact: PathBuf,
}
