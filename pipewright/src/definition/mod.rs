//! Declarative pipeline definitions.
//!
//! A definition is parsed from YAML or JSON, has its `{{variables}}`
//! substituted, is validated, and is compiled into an [`ExecutionPlan`] of
//! dependency-ordered batches.

pub mod condition;
mod loader;
mod model;
mod plan;
pub mod variables;

pub use condition::Condition;
pub use loader::{load, LoadedPipeline, PipelineLoader, PipelineSource, NOTIFICATION_EVENTS};
pub use model::{
    BackoffSettings, NotificationAction, NotifyLevel, PipelineDefinition, PipelineSettings,
    QualityGate, StageDefinition, SuccessCriteria, TimeoutSettings,
};
pub use plan::ExecutionPlan;
pub use variables::Variables;
