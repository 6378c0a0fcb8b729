//! What a finished run hands back.

use super::gates::GateResult;
use crate::core::{AgentOutput, RunStatus, StageStatus};
use crate::limits::SessionSummary;
use crate::manifest::RunManifest;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Final state of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    /// Stage id.
    pub stage: String,
    /// Terminal status.
    pub status: StageStatus,
    /// Executions across all of the stage's jobs.
    pub attempts: u32,
    /// Jobs dispatched; more than one for `foreach` stages.
    pub jobs: usize,
    /// The stage's output, if it produced one.
    pub output: Option<AgentOutput>,
    /// Failure reason.
    pub error: Option<String>,
}

impl StageOutcome {
    /// An outcome that never reached a queue.
    #[must_use]
    pub fn without_jobs(stage: impl Into<String>, status: StageStatus) -> Self {
        Self {
            stage: stage.into(),
            status,
            attempts: 0,
            jobs: 0,
            output: None,
            error: None,
        }
    }

    /// Sets the failure reason.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the output.
    #[must_use]
    pub fn with_output(mut self, output: AgentOutput) -> Self {
        self.output = Some(output);
        self
    }
}

/// Result of [`Orchestrator::run`](super::Orchestrator::run) or
/// [`StateMachine::run`](super::StateMachine::run).
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Run id.
    pub run_id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Where the manifest was written.
    pub manifest_path: PathBuf,
    /// The manifest as last persisted.
    pub manifest: RunManifest,
    /// Outcome per stage, keyed by stage id.
    pub stages: BTreeMap<String, StageOutcome>,
    /// Quality gates that ran.
    pub gates: Vec<GateResult>,
    /// Unmet success criteria.
    pub unmet_criteria: Vec<String>,
    /// Spend recorded during the run.
    pub spending: Option<SessionSummary>,
}

impl RunResult {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Process exit code: 0 on success, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.succeeded())
    }

    /// Outcome of one stage.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageOutcome> {
        self.stages.get(id)
    }

    /// Status of one stage; `Pending` if it never ran.
    #[must_use]
    pub fn stage_status(&self, id: &str) -> StageStatus {
        self.stages.get(id).map(|s| s.status).unwrap_or_default()
    }

    /// Final status per stage.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, StageStatus> {
        self.stages
            .iter()
            .map(|(id, outcome)| (id.clone(), outcome.status))
            .collect()
    }
}
