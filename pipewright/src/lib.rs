//! # Pipewright
//!
//! A pipeline orchestration engine for multi-stage content generation.
//!
//! A pipeline is a YAML or JSON document naming stages, the agent that
//! performs each one and the stages it depends on. Pipewright provides:
//!
//! - **Level-based scheduling**: stages are grouped into dependency levels;
//!   each level runs in parallel and finishes before the next starts
//! - **Durable queues**: per-agent job queues with priorities, retries,
//!   exponential backoff and per-job timeouts
//! - **Run manifests**: a JSON record written after every transition, used
//!   for status checks and resumption
//! - **Limits**: per-service rate limits and per-run, daily and monthly
//!   spending budgets
//! - **Caching**: stage outputs keyed by their canonical input
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipewright::prelude::*;
//!
//! let pipeline = load(&PipelineSource::file("pipelines/article.yaml"), &Variables::new())?;
//! let registry = ProcessorRegistry::new().with("writer", WriterAgent::new());
//!
//! let result = Orchestrator::new(registry)
//!     .run(&pipeline, RunRequest::new("rust ownership"))
//!     .await?;
//! std::process::exit(result.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod definition;
pub mod errors;
pub mod events;
pub mod limits;
pub mod manifest;
pub mod orchestrator;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{FileCache, MemoryCache, SharedCache, StageCache};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::EngineConfig;
    pub use crate::core::{AgentOutput, RunStatus, StageStatus};
    pub use crate::definition::{
        load, LoadedPipeline, PipelineDefinition, PipelineLoader, PipelineSource, StageDefinition,
        Variables,
    };
    pub use crate::errors::{AgentError, ConfigError, EngineError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, SharedEventSink};
    pub use crate::limits::{Budgets, CostTracker, RateLimiter, ServiceLimits};
    pub use crate::manifest::{check_status, RunManifest, StatusSummary};
    pub use crate::orchestrator::{
        ArticleState, Orchestrator, RunRequest, RunResult, StageApprover, StateMachine,
    };
    pub use crate::queue::{BackoffPolicy, JobOptions, JobQueues};
    pub use crate::worker::{
        FnProcessor, ProcessorContext, ProcessorRegistry, Services, StageProcessor,
    };
}
