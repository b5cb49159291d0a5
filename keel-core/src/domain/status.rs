//! Execution status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a job or step execution
///
/// Variants are declared in escalation order. The derived ordering is what
/// [`BatchStatus::upgrade_to`] relies on, so do not reorder them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Abandoned,
    Unknown,
}

impl BatchStatus {
    /// No further progress happens from this status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Stopped
                | BatchStatus::Abandoned
        )
    }

    /// Merges this status with one observed elsewhere (usually in storage)
    ///
    /// Past STARTED the more severe status wins. While both are still
    /// starting up, COMPLETED wins over the in-progress one.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        if self > BatchStatus::Started || other > BatchStatus::Started {
            return self.max(other);
        }
        if self == BatchStatus::Completed || other == BatchStatus::Completed {
            return BatchStatus::Completed;
        }
        self.max(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Unrecognised strings map to [`BatchStatus::Unknown`]
impl From<&str> for BatchStatus {
    fn from(s: &str) -> Self {
        match s {
            "COMPLETED" => BatchStatus::Completed,
            "STARTING" => BatchStatus::Starting,
            "STARTED" => BatchStatus::Started,
            "STOPPING" => BatchStatus::Stopping,
            "STOPPED" => BatchStatus::Stopped,
            "FAILED" => BatchStatus::Failed,
            "ABANDONED" => BatchStatus::Abandoned,
            _ => BatchStatus::Unknown,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
