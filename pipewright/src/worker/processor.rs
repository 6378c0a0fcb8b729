//! The stage processor contract.

use crate::cache::{MemoryCache, SharedCache};
use crate::core::AgentOutput;
use crate::errors::AgentError;
use crate::limits::{CostTracker, RateLimiter};
use crate::queue::ProgressReporter;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

/// A unit of work invoked by the engine for every job of its agent name.
///
/// The engine only inspects [`AgentOutput::success`]. Returning `Err`
/// lets the queue retry the job when the error is retryable; returning
/// an output with `success == false` fails the stage without a retry.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Runs the processor on one job payload.
    async fn execute(&self, payload: Value, ctx: ProcessorContext) -> Result<AgentOutput, AgentError>;
}

/// Process-wide services handed to every processor.
///
/// Processors are expected to consult the rate limiter before calling an
/// external service and to record spend with the cost tracker. The engine
/// does not enforce either.
#[derive(Clone)]
pub struct Services {
    /// Stage result cache.
    pub cache: SharedCache,
    /// External call quotas.
    pub rate_limiter: Arc<RateLimiter>,
    /// Spend accounting.
    pub cost_tracker: Arc<CostTracker>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            cache: Arc::new(MemoryCache::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
            cost_tracker: Arc::new(CostTracker::new()),
        }
    }
}

impl Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    /// Replaces the cache.
    #[must_use]
    pub fn with_cache(mut self, cache: SharedCache) -> Self {
        self.cache = cache;
        self
    }

    /// Replaces the rate limiter.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Replaces the cost tracker.
    #[must_use]
    pub fn with_cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.cost_tracker = tracker;
        self
    }
}

/// Per-invocation context.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    /// Job id, or a fresh id for direct invocations.
    pub job_id: String,
    /// Queue the job came from; empty for direct invocations.
    pub queue: String,
    /// Stage the job belongs to.
    pub stage: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Shared services.
    pub services: Services,
    progress: Option<ProgressReporter>,
}

impl ProcessorContext {
    /// Context for a queued job.
    #[must_use]
    pub fn for_job(
        job_id: impl Into<String>,
        queue: impl Into<String>,
        stage: Option<String>,
        attempt: u32,
        services: Services,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            queue: queue.into(),
            stage,
            attempt,
            services,
            progress: Some(progress),
        }
    }

    /// Context for a call made outside any queue, such as a gate check.
    #[must_use]
    pub fn direct(stage: Option<String>, attempt: u32, services: Services) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            queue: String::new(),
            stage,
            attempt,
            services,
            progress: None,
        }
    }

    /// Reports progress; a no-op for direct invocations.
    pub fn report_progress(&self, percent: u8, message: Option<&str>) {
        if let Some(progress) = &self.progress {
            progress.report(percent, message);
        }
    }
}

/// A processor backed by an async closure.
pub struct FnProcessor<F> {
    func: F,
}

impl<F> FnProcessor<F> {
    /// Wraps a closure.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProcessor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> StageProcessor for FnProcessor<F>
where
    F: Fn(Value, ProcessorContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AgentOutput, AgentError>> + Send,
{
    async fn execute(&self, payload: Value, ctx: ProcessorContext) -> Result<AgentOutput, AgentError> {
        (self.func)(payload, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_processor() {
        let processor = FnProcessor::new(|payload: Value, ctx: ProcessorContext| async move {
            Ok(AgentOutput::ok_value("echo", payload).with_field("attempt", json!(ctx.attempt)))
        });

        let ctx = ProcessorContext::direct(Some("s".into()), 2, Services::default());
        let output = processor.execute(json!({"a": 1}), ctx).await.unwrap();

        assert_eq!(output.get("echo"), Some(&json!({"a": 1})));
        assert_eq!(output.get("attempt"), Some(&json!(2)));
    }

    #[test]
    fn test_direct_context_ignores_progress() {
        let ctx = ProcessorContext::direct(None, 1, Services::default());
        ctx.report_progress(50, Some("halfway"));
        assert!(ctx.queue.is_empty());
    }
}
