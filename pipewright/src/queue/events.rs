//! Per-job lifecycle events.

use crate::events::names;
use serde::Serialize;
use serde_json::{json, Value};

/// A job lifecycle transition, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// The job entered its queue.
    Queued {
        /// Job id.
        job_id: String,
        /// Queue name.
        queue: String,
        /// Processor name.
        agent: String,
        /// Priority.
        priority: i32,
    },
    /// A worker started an attempt.
    Started {
        /// Job id.
        job_id: String,
        /// Queue name.
        queue: String,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The processor reported progress.
    Progress {
        /// Job id.
        job_id: String,
        /// Queue name.
        queue: String,
        /// Completion percentage, 0 to 100.
        percent: u8,
        /// Optional message.
        message: Option<String>,
    },
    /// The job produced a result.
    Completed {
        /// Job id.
        job_id: String,
        /// Queue name.
        queue: String,
        /// Executions performed.
        attempts: u32,
        /// The agent output.
        result: Value,
    },
    /// The job failed terminally.
    Failed {
        /// Job id.
        job_id: String,
        /// Queue name.
        queue: String,
        /// Executions performed.
        attempts: u32,
        /// The final error.
        error: String,
    },
    /// A failed attempt will be retried after a delay.
    Retrying {
        /// Job id.
        job_id: String,
        /// Queue name.
        queue: String,
        /// The attempt that failed.
        attempt: u32,
        /// Delay before the next attempt.
        delay_ms: u64,
        /// The attempt's error.
        error: String,
    },
}

impl QueueEvent {
    /// The dotted event type forwarded to event sinks.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Queued { .. } => names::JOB_QUEUED,
            Self::Started { .. } => names::JOB_STARTED,
            Self::Progress { .. } => names::JOB_PROGRESS,
            Self::Completed { .. } => names::JOB_COMPLETED,
            Self::Failed { .. } => names::JOB_FAILED,
            Self::Retrying { .. } => names::JOB_RETRYING,
        }
    }

    /// The job this event is about.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::Queued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Retrying { job_id, .. } => job_id,
        }
    }

    /// Event payload as JSON.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"job_id": self.job_id()}))
    }
}
