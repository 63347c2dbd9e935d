use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall outcome of a pipeline build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Success,
    Failure,
    Unstable,
    Aborted,
    InProgress,
    Unknown,
}

impl BuildStatus {
    /// Maps an orchestrator status string onto the build outcome.
    pub fn from_upstream(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Self::Success,
            "FAILED" | "FAILURE" => Self::Failure,
            "UNSTABLE" => Self::Unstable,
            "ABORTED" => Self::Aborted,
            "IN_PROGRESS" | "QUEUED" | "PAUSED_PENDING_INPUT" => Self::InProgress,
            _ => Self::Unknown,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Unstable => "UNSTABLE",
            Self::Aborted => "ABORTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Outcome of a single pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Success,
    Failure,
    Unstable,
    Skipped,
    NotExecuted,
    InProgress,
}

impl StageStatus {
    /// Maps an orchestrator stage status string.
    ///
    /// Aborted stages and statuses this exporter does not know are folded
    /// into `NotExecuted` so they never inflate the failure counter.
    pub fn from_upstream(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Self::Success,
            "FAILED" | "FAILURE" => Self::Failure,
            "UNSTABLE" => Self::Unstable,
            "SKIPPED" => Self::Skipped,
            "IN_PROGRESS" | "QUEUED" | "PAUSED_PENDING_INPUT" => Self::InProgress,
            _ => Self::NotExecuted,
        }
    }

    /// Every status except `InProgress` is final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Unstable => "UNSTABLE",
            Self::Skipped => "SKIPPED",
            Self::NotExecuted => "NOT_EXECUTED",
            Self::InProgress => "IN_PROGRESS",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A single stage of a build, after nesting has been flattened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    /// Stage name as declared in the pipeline; not unique within a build
    pub name: String,
    pub status: StageStatus,
    /// Stage-local elapsed time, zero while the stage is running
    pub duration_ms: u64,
    /// Position among sibling stages at the same nesting level
    pub sequence_index: usize,
}

/// One fetched build with its flattened stages.
///
/// Handed to the recorder exactly once; see `Poller` for how that is enforced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildRecord {
    pub job_name: String,
    pub build_number: u64,
    pub overall_status: BuildStatus,
    /// Wall-clock build duration, zero while the build is running
    pub overall_duration_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// Stages in declaration order
    pub stages: Vec<StageRecord>,
}

/// Converts a millisecond count into the seconds unit the exposed series use.
#[allow(clippy::cast_precision_loss)]
pub fn millis_to_seconds(ms: u64) -> f64 {
    ms as f64 / 1000.0
}
