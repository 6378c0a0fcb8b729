//! Error types for the pipewright engine.
//!
//! The taxonomy separates fatal run-level errors (configuration, budget,
//! quota, manifest persistence) from job-level errors that the queue's
//! backoff loop absorbs (timeouts and agent failures).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The pipeline definition or engine configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A job exceeded its time window.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// A stage processor failed.
    #[error("{0}")]
    Agent(#[from] AgentError),

    /// Spend reached a configured budget ceiling.
    #[error("{0}")]
    BudgetExceeded(#[from] BudgetExceeded),

    /// An external-service quota is exhausted.
    #[error("{0}")]
    QuotaExceeded(#[from] QuotaExceeded),

    /// The run manifest could not be persisted or read.
    #[error("{0}")]
    ManifestIo(#[from] ManifestIoError),

    /// A queue operation failed.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// The run was cancelled before completion.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns true if the error aborts the whole run immediately.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::BudgetExceeded(_)
                | Self::QuotaExceeded(_)
                | Self::ManifestIo(_)
                | Self::Cancelled(_)
                | Self::Internal(_)
        )
    }

    /// Returns true if a job failing with this error may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Agent(e) => e.retryable,
            _ => false,
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::BudgetExceeded(_) | Self::QuotaExceeded(_) => 2,
            _ => 1,
        }
    }
}

/// Diagnostic metadata attached to configuration errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "CONFIG-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while loading a pipeline definition or engine config.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A pipeline or config document could not be parsed.
    #[error("Failed to parse document: {0}")]
    Parse(String),

    /// The definition file could not be read.
    #[error("Failed to read '{path}': {reason}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// The pipeline has no stages.
    #[error("Pipeline '{0}' has no stages")]
    EmptyPipeline(String),

    /// Two stages share an id.
    #[error("Duplicate stage id '{0}'")]
    DuplicateStage(String),

    /// A stage depends on a stage that does not exist.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The dependent stage.
        stage: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A stage depends on itself.
    #[error("Stage '{0}' cannot depend on itself")]
    SelfDependency(String),

    /// The dependency graph contains a cycle.
    #[error("Cycle detected in pipeline: {}", path.join(" -> "))]
    Cycle {
        /// The stages forming the cycle, first stage repeated at the end.
        path: Vec<String>,
    },

    /// A quality gate, success criterion or notification names an unknown stage.
    #[error("{context} references unknown stage '{stage}'")]
    UnknownStageReference {
        /// Where the reference appears.
        context: String,
        /// The unknown stage id.
        stage: String,
    },

    /// A `{{name}}` placeholder has no value and no default.
    #[error("Unresolved variable '{name}' in {location}")]
    UnresolvedVariable {
        /// The variable name.
        name: String,
        /// Where the placeholder appears.
        location: String,
    },

    /// A condition expression failed to parse.
    #[error("Invalid condition for '{owner}': {message}")]
    InvalidCondition {
        /// The stage or gate owning the condition.
        owner: String,
        /// Parser message.
        message: String,
    },

    /// A stage or gate names an agent with no registered processor.
    #[error("{owner} uses agent '{agent}', which has no registered processor")]
    UnknownAgent {
        /// The stage or gate naming the agent.
        owner: String,
        /// The agent name.
        agent: String,
    },

    /// Any other invalid setting.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Returns diagnostic info for this error.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::Parse(_) | Self::Read { .. } => ErrorInfo::new("CONFIG-PARSE", self.to_string())
                .with_fix_hint("Check that the file is valid YAML or JSON."),
            Self::EmptyPipeline(_) => ErrorInfo::new("CONFIG-EMPTY", self.to_string())
                .with_fix_hint("Add at least one stage to the pipeline."),
            Self::DuplicateStage(id) => ErrorInfo::new("CONFIG-DUPLICATE", self.to_string())
                .with_context_entry("stage", id.clone())
                .with_fix_hint("Give every stage a unique id."),
            Self::UnknownDependency { stage, dependency } => {
                ErrorInfo::new("CONFIG-MISSING-DEP", self.to_string())
                    .with_context_entry("stage", stage.clone())
                    .with_context_entry("dependency", dependency.clone())
                    .with_fix_hint("Check for typos in dependsOn entries.")
            }
            Self::SelfDependency(id) => ErrorInfo::new("CONFIG-SELF-DEP", self.to_string())
                .with_context_entry("stage", id.clone()),
            Self::Cycle { .. } => ErrorInfo::new("CONFIG-CYCLE", self.to_string())
                .with_fix_hint("Remove one of the dependencies in the cycle to break it."),
            Self::UnknownStageReference { stage, .. } => {
                ErrorInfo::new("CONFIG-UNKNOWN-STAGE", self.to_string())
                    .with_context_entry("stage", stage.clone())
            }
            Self::UnresolvedVariable { name, .. } => {
                ErrorInfo::new("CONFIG-UNRESOLVED-VAR", self.to_string())
                    .with_context_entry("variable", name.clone())
                    .with_fix_hint("Pass the variable with --var or give the placeholder a default.")
            }
            Self::InvalidCondition { .. } => ErrorInfo::new("CONFIG-CONDITION", self.to_string()),
            Self::UnknownAgent { agent, .. } => {
                ErrorInfo::new("CONFIG-UNKNOWN-AGENT", self.to_string())
                    .with_context_entry("agent", agent.clone())
                    .with_fix_hint("Register a processor for the agent before running the pipeline.")
            }
            Self::Invalid(_) => ErrorInfo::new("CONFIG-INVALID", self.to_string()),
        }
    }
}

/// A job did not finish within its time window.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Job '{job_id}' timed out after {after_ms}ms")]
pub struct TimeoutError {
    /// The job id.
    pub job_id: String,
    /// The timeout that elapsed, in milliseconds.
    pub after_ms: u64,
}

/// A stage processor reported an error.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Agent error: {message}")]
pub struct AgentError {
    /// The error message.
    pub message: String,
    /// Whether the queue may retry the job.
    pub retryable: bool,
}

impl AgentError {
    /// Creates a retryable agent error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates an agent error that must not be retried.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<QuotaExceeded> for AgentError {
    fn from(err: QuotaExceeded) -> Self {
        Self::new(err.to_string())
    }
}

/// The budget period a spend ceiling applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// The current run.
    Run,
    /// The current UTC day.
    Daily,
    /// The current UTC month.
    Monthly,
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "per-run"),
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// Spend reached a budget ceiling.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("Budget exceeded: {period} spend ${spent:.2} reached limit ${limit:.2}")]
pub struct BudgetExceeded {
    /// The period whose budget was reached.
    pub period: BudgetPeriod,
    /// Spend so far in the period.
    pub spent: f64,
    /// The configured ceiling.
    pub limit: f64,
}

/// An external-service quota is exhausted.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Quota exceeded for service '{service}', retry after {retry_after_ms}ms")]
pub struct QuotaExceeded {
    /// The service name.
    pub service: String,
    /// Milliseconds until the next window opens.
    pub retry_after_ms: u64,
}

/// The manifest could not be written or read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Manifest I/O error at '{}': {reason}", path.display())]
pub struct ManifestIoError {
    /// The manifest path.
    pub path: PathBuf,
    /// The underlying reason.
    pub reason: String,
}

impl ManifestIoError {
    /// Creates a new manifest I/O error.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by the job queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue no longer accepts jobs.
    #[error("Queue '{0}' is closed")]
    Closed(String),

    /// No queue with this name was declared.
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    /// The job's result channel was dropped before a terminal state.
    #[error("Result for job '{0}' was lost")]
    ResultLost(String),
}
