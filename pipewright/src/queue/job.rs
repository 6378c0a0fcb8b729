//! Job, options and outcome types.

use super::backoff::BackoffPolicy;
use crate::core::AgentOutput;
use crate::errors::{AgentError, EngineError, TimeoutError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default total attempts for a job.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default job timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-job options supplied at enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Time allowed for each attempt.
    pub timeout: Duration,
    /// Delay policy between attempts.
    pub backoff: BackoffPolicy,
    /// Higher runs first.
    pub priority: i32,
    /// Stage the job belongs to, if any.
    pub stage: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_TIMEOUT,
            backoff: BackoffPolicy::default(),
            priority: 0,
            stage: None,
        }
    }
}

impl JobOptions {
    /// Sets the total attempt count.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the owning stage.
    #[must_use]
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

/// A unit of work owned by the queue while in flight.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job id.
    pub id: String,
    /// Queue name.
    pub queue: String,
    /// Processor name.
    pub agent: String,
    /// Stage the job belongs to.
    pub stage: Option<String>,
    /// Input passed to the processor.
    pub payload: Value,
    /// Executions started so far.
    pub attempts: u32,
    /// Total attempts allowed.
    pub max_attempts: u32,
    /// Time allowed per attempt.
    pub timeout: Duration,
    /// Delay policy between attempts.
    pub backoff: BackoffPolicy,
    /// Higher runs first.
    pub priority: i32,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    pub(crate) history: Vec<AttemptRecord>,
}

impl Job {
    /// Creates a job with a fresh id.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        agent: impl Into<String>,
        payload: Value,
        options: JobOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            agent: agent.into(),
            stage: options.stage,
            payload,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            timeout: options.timeout,
            backoff: options.backoff,
            priority: options.priority,
            enqueued_at: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Returns true if another attempt is allowed after the current one.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Failed attempts recorded so far.
    #[must_use]
    pub fn history(&self) -> &[AttemptRecord] {
        &self.history
    }
}

/// A job-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The attempt exceeded its time window.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// The processor reported an error.
    #[error("{0}")]
    Agent(#[from] AgentError),

    /// The queue closed before the job finished.
    #[error("Queue '{0}' shut down before the job finished")]
    Shutdown(String),
}

impl JobError {
    /// Short label stored in attempt records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Agent(_) => "agent",
            Self::Shutdown(_) => "shutdown",
        }
    }

    /// Returns true if the queue may schedule another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Agent(e) => e.retryable,
            Self::Shutdown(_) => false,
        }
    }
}

impl From<JobError> for EngineError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Timeout(e) => Self::Timeout(e),
            JobError::Agent(e) => Self::Agent(e),
            JobError::Shutdown(queue) => {
                Self::Queue(crate::errors::QueueError::Closed(queue))
            }
        }
    }
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Error message.
    pub error: String,
    /// Error kind: `timeout`, `agent` or `shutdown`.
    pub kind: String,
    /// When the attempt failed.
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub(crate) fn new(attempt: u32, error: &JobError) -> Self {
        Self {
            attempt,
            error: error.to_string(),
            kind: error.kind().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Terminal state of a job, delivered to whoever awaits it.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Job id.
    pub job_id: String,
    /// Queue name.
    pub queue: String,
    /// Processor name.
    pub agent: String,
    /// Owning stage.
    pub stage: Option<String>,
    /// Executions performed.
    pub attempts: u32,
    /// Every failed attempt in order.
    pub history: Vec<AttemptRecord>,
    /// The processor output, or the terminal error.
    pub result: Result<AgentOutput, JobError>,
}

impl JobOutcome {
    /// Returns true if the processor returned an output with `success == true`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.result, Ok(ref output) if output.success)
    }

    /// Returns the output, if the job produced one.
    #[must_use]
    pub fn output(&self) -> Option<&AgentOutput> {
        self.result.as_ref().ok()
    }

    /// Human-readable failure reason, if the job did not succeed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        match self.result {
            Ok(ref output) if output.success => None,
            Ok(ref output) => Some(
                output
                    .error()
                    .map_or_else(|| "agent reported success=false".to_string(), str::to_string),
            ),
            Err(ref e) => Some(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_defaults() {
        let job = Job::new("default", "echo", json!({}), JobOptions::default());

        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.timeout, Duration::from_secs(300));
        assert!(Uuid::parse_str(&job.id).is_ok());
        assert!(job.can_retry());
    }

    #[test]
    fn test_options_clamp_attempts() {
        let options = JobOptions::default().with_max_attempts(0);
        assert_eq!(options.max_attempts, 1);
    }

    #[test]
    fn test_job_error_classification() {
        let timeout = JobError::from(TimeoutError {
            job_id: "j".into(),
            after_ms: 5,
        });
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), "timeout");

        assert!(!JobError::from(AgentError::permanent("bad")).is_retryable());
        assert!(!JobError::Shutdown("q".into()).is_retryable());
    }

    #[test]
    fn test_outcome_failure_reason() {
        let mut outcome = JobOutcome {
            job_id: "j".into(),
            queue: "q".into(),
            agent: "a".into(),
            stage: None,
            attempts: 1,
            history: Vec::new(),
            result: Ok(AgentOutput::ok()),
        };
        assert!(outcome.is_success());
        assert_eq!(outcome.failure_reason(), None);

        outcome.result = Ok(AgentOutput::failed("no sources"));
        assert!(!outcome.is_success());
        assert_eq!(outcome.failure_reason().as_deref(), Some("no sources"));

        outcome.result = Err(AgentError::new("boom").into());
        assert_eq!(outcome.failure_reason().as_deref(), Some("Agent error: boom"));
    }
}
