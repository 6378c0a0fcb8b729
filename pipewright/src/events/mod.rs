//! Engine events and the sinks that receive them.
//!
//! Queues, workers and the orchestrator report lifecycle transitions as
//! `(event_type, data)` pairs. Event types are dotted names; the constants in
//! [`names`] list every type the engine emits.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// A shareable event sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Returns a sink that discards everything.
#[must_use]
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoOpEventSink)
}

/// Event type names.
pub mod names {
    /// A job entered a queue.
    pub const JOB_QUEUED: &str = "job.queued";
    /// A worker picked up a job.
    pub const JOB_STARTED: &str = "job.started";
    /// A processor reported progress.
    pub const JOB_PROGRESS: &str = "job.progress";
    /// A job produced a result.
    pub const JOB_COMPLETED: &str = "job.completed";
    /// A job failed terminally.
    pub const JOB_FAILED: &str = "job.failed";
    /// A failed attempt was scheduled for retry.
    pub const JOB_RETRYING: &str = "job.retrying";

    /// A run began.
    pub const RUN_STARTED: &str = "run.started";
    /// A run finished successfully.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A run failed or was aborted.
    pub const RUN_FAILED: &str = "run.failed";

    /// A stage was dispatched.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage succeeded.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage's condition was false.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage was served from the cache.
    pub const STAGE_CACHED: &str = "stage.cached";

    /// A quality gate passed.
    pub const GATE_PASSED: &str = "gate.passed";
    /// A quality gate failed.
    pub const GATE_FAILED: &str = "gate.failed";

    /// A rate-limited service crossed a usage threshold.
    pub const QUOTA_THROTTLED: &str = "quota.throttled";
}
