//! Core domain model types for pipewright.
//!
//! This module contains the fundamental types shared by every component:
//! - Stage and run status enums
//! - The agent output envelope returned by stage processors

mod output;
mod status;

pub use output::AgentOutput;
pub use status::{RunStatus, StageStatus};
