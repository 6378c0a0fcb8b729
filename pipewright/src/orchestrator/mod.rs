//! Run execution.
//!
//! Two modes share the manifest, the registry and the services:
//!
//! - [`Orchestrator`] runs a loaded pipeline level by level. Every stage of
//!   a level becomes one or more queued jobs, and the next level starts only
//!   once all of them settle.
//! - [`StateMachine`] walks a fixed state sequence one agent at a time,
//!   retrying a failed state in place.

mod approval;
mod engine;
mod gates;
mod integration_tests;
mod notifications;
mod result;
mod scope;
mod state_machine;

pub use approval::{
    ApprovalDecision, ApprovalRequest, AutoApprover, ChannelApprover, StageApprover,
};
pub use engine::{Orchestrator, RunRequest};
pub use gates::{check_success_criteria, evaluate_gate, GateResult};
pub use notifications::{Notification, Notifier};
pub use result::{RunResult, StageOutcome};
pub use scope::{cache_input, RunScope};
pub use state_machine::{ArticleState, StateMachine, STATE_MACHINE_PIPELINE};
