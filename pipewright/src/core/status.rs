//! Stage, job and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome state of a stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not been dispatched yet.
    #[default]
    Pending,
    /// Stage jobs are in flight.
    Running,
    /// Stage completed successfully.
    Completed,
    /// Stage result was served from the cache.
    Cached,
    /// Stage condition evaluated to false.
    Skipped,
    /// Stage failed after exhausting its attempts.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cached => write!(f, "cached"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cached | Self::Skipped | Self::Failed
        )
    }

    /// Returns true if the stage produced a usable result.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Cached)
    }
}

/// The overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is in progress.
    #[default]
    Running,
    /// Every required stage succeeded and success criteria hold.
    Succeeded,
    /// A required stage or gate failed.
    Failed,
    /// A fatal error (budget, quota, manifest, cancellation) stopped the run.
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_terminal() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Cached.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_stage_status_success() {
        assert!(StageStatus::Cached.is_success());
        assert!(!StageStatus::Skipped.is_success());
        assert!(!StageStatus::Failed.is_success());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&RunStatus::Aborted).unwrap();
        assert_eq!(json, r#""aborted""#);

        let status: StageStatus = serde_json::from_str(r#""cached""#).unwrap();
        assert_eq!(status, StageStatus::Cached);
    }
}
