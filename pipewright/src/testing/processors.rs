//! Stage processors for tests.
//!
//! Every processor is cheap to clone; clones share their call records so a
//! test can register one copy and inspect another.

use crate::core::AgentOutput;
use crate::errors::AgentError;
use crate::worker::{ProcessorContext, StageProcessor};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Job id from the context.
    pub job_id: String,
    /// Queue name; empty for direct calls.
    pub queue: String,
    /// Stage id.
    pub stage: Option<String>,
    /// Attempt number.
    pub attempt: u32,
    /// Payload received.
    pub payload: Value,
    /// When the call started.
    pub started_at: Instant,
    /// When the call returned.
    pub finished_at: Instant,
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Mutex<Vec<RecordedCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Records every call and returns a fixed output.
///
/// The default output is a success with the payload under `echo` and the
/// stage id under `stage`.
#[derive(Debug, Clone, Default)]
pub struct RecordingProcessor {
    state: Arc<RecordingState>,
    output: Option<AgentOutput>,
    delay: Option<Duration>,
}

impl RecordingProcessor {
    /// Creates a recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `output` from every call instead of the echo.
    #[must_use]
    pub fn with_output(mut self, output: AgentOutput) -> Self {
        self.output = Some(output);
        self
    }

    /// Sleeps before returning.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// All calls so far, in completion order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.calls.lock().len()
    }

    /// Calls made for one stage.
    #[must_use]
    pub fn calls_for(&self, stage: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.stage.as_deref() == Some(stage))
            .collect()
    }

    /// Highest number of calls observed running at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProcessor for RecordingProcessor {
    async fn execute(&self, payload: Value, ctx: ProcessorContext) -> Result<AgentOutput, AgentError> {
        let started_at = Instant::now();
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let output = self.output.clone().unwrap_or_else(|| {
            AgentOutput::ok_value("echo", payload.clone())
                .with_field("stage", json!(ctx.stage.clone()))
        });

        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.calls.lock().push(RecordedCall {
            job_id: ctx.job_id,
            queue: ctx.queue,
            stage: ctx.stage,
            attempt: ctx.attempt,
            payload,
            started_at,
            finished_at: Instant::now(),
        });
        Ok(output)
    }
}

/// Always fails.
#[derive(Debug, Clone)]
pub struct FailingProcessor {
    message: String,
    retryable: bool,
    soft: bool,
    calls: Arc<AtomicUsize>,
}

impl FailingProcessor {
    /// Fails with a retryable error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            soft: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails with a non-retryable error.
    #[must_use]
    pub fn permanent(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Returns `success: false` instead of an error.
    #[must_use]
    pub fn soft(mut self) -> Self {
        self.soft = true;
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProcessor for FailingProcessor {
    async fn execute(&self, _payload: Value, _ctx: ProcessorContext) -> Result<AgentOutput, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.soft {
            return Ok(AgentOutput::failed(self.message.clone()));
        }
        Err(AgentError {
            message: self.message.clone(),
            retryable: self.retryable,
        })
    }
}

/// Fails a fixed number of times, then succeeds.
#[derive(Debug, Clone)]
pub struct FlakyProcessor {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyProcessor {
    /// Fails the first `failures` calls with a retryable error.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProcessor for FlakyProcessor {
    async fn execute(&self, _payload: Value, ctx: ProcessorContext) -> Result<AgentOutput, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(AgentError::new(format!("transient failure {call}")));
        }
        Ok(AgentOutput::ok_value("attempt", json!(ctx.attempt)))
    }
}

/// Sleeps, then succeeds.
#[derive(Debug, Clone)]
pub struct SlowProcessor {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl SlowProcessor {
    /// Sleeps for `delay` on every call.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of calls started.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProcessor for SlowProcessor {
    async fn execute(&self, _payload: Value, _ctx: ProcessorContext) -> Result<AgentOutput, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(AgentOutput::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Services;

    fn ctx(stage: &str) -> ProcessorContext {
        ProcessorContext::direct(Some(stage.to_string()), 1, Services::default())
    }

    #[tokio::test]
    async fn test_recording_processor_shares_state() {
        let recorder = RecordingProcessor::new();
        let clone = recorder.clone();

        let output = clone.execute(json!({"a": 1}), ctx("s1")).await.unwrap();
        assert_eq!(output.get("stage"), Some(&json!("s1")));
        assert_eq!(recorder.call_count(), 1);
        assert_eq!(recorder.calls_for("s1")[0].payload, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_failing_processor_variants() {
        let hard = FailingProcessor::new("boom").permanent();
        let err = hard.execute(json!({}), ctx("s")).await.unwrap_err();
        assert!(!err.retryable);

        let soft = FailingProcessor::new("meh").soft();
        assert!(!soft.execute(json!({}), ctx("s")).await.unwrap().success);
        assert_eq!(soft.calls(), 1);
    }

    #[tokio::test]
    async fn test_flaky_processor() {
        let flaky = FlakyProcessor::new(1);
        assert!(flaky.execute(json!({}), ctx("s")).await.is_err());
        assert!(flaky.execute(json!({}), ctx("s")).await.is_ok());
        assert_eq!(flaky.calls(), 2);
    }
}
