//! The run manifest document.

use crate::core::{RunStatus, StageStatus};
use crate::queue::AttemptRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One failed attempt, as stored in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stage (or state-machine agent) that failed.
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Error message.
    pub message: String,
    /// When the attempt failed.
    pub timestamp: DateTime<Utc>,
    /// Error kind: `timeout`, `agent`, `shutdown`, `output`, `gate`, `approval`.
    pub kind: String,
}

impl ErrorRecord {
    /// Creates a record stamped now.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        attempt: u32,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            attempt,
            message: message.into(),
            timestamp: Utc::now(),
            kind: kind.into(),
        }
    }

    /// Converts a queue attempt record.
    #[must_use]
    pub fn from_attempt(stage: &str, record: &AttemptRecord) -> Self {
        Self {
            stage: stage.to_string(),
            attempt: record.attempt,
            message: record.error.clone(),
            timestamp: record.timestamp,
            kind: record.kind.clone(),
        }
    }
}

/// Where and why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltInfo {
    /// Stage that caused the halt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Reason.
    pub reason: String,
}

/// Per-stage state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Current status.
    pub status: StageStatus,
    /// Total executions across all of the stage's jobs.
    #[serde(default)]
    pub attempts: u32,
    /// When the stage was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Durable record of one pipeline run.
///
/// Only the orchestrator mutates it, through a
/// [`ManifestStore`](super::ManifestStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Run topic.
    pub topic: String,
    /// Run id.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Completed steps in order: stage ids, or agent names in state-machine mode.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Quality metrics keyed by gate name.
    #[serde(default)]
    pub qa: Map<String, Value>,
    /// Every failed attempt.
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// Stages whose condition was false.
    #[serde(default)]
    pub skipped: Vec<String>,
    /// True once the run reached a successful end.
    #[serde(rename = "final", default)]
    pub is_final: bool,
    /// Run status.
    #[serde(default)]
    pub status: RunStatus,
    /// Set when the run stopped early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_by: Option<HaltInfo>,
    /// State per stage.
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
}

impl RunManifest {
    /// Creates a manifest for a new run.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        run_id: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            topic: topic.into(),
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            timestamp: now,
            updated_at: now,
            steps: Vec::new(),
            qa: Map::new(),
            errors: Vec::new(),
            skipped: Vec::new(),
            is_final: false,
            status: RunStatus::Running,
            halted_by: None,
            stages: BTreeMap::new(),
        }
    }

    /// Bumps `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Appends a completed step.
    pub fn record_step(&mut self, step: impl Into<String>) {
        self.steps.push(step.into());
    }

    /// Returns true if `step` already completed.
    #[must_use]
    pub fn has_step(&self, step: &str) -> bool {
        self.steps.iter().any(|s| s == step)
    }

    /// Appends an error.
    pub fn record_error(&mut self, error: ErrorRecord) {
        self.errors.push(error);
    }

    /// Marks a stage as skipped.
    pub fn record_skip(&mut self, stage: impl Into<String>) {
        let stage = stage.into();
        self.set_stage_status(&stage, StageStatus::Skipped);
        if !self.skipped.contains(&stage) {
            self.skipped.push(stage);
        }
    }

    /// Updates a stage's status and timestamps.
    pub fn set_stage_status(&mut self, stage: &str, status: StageStatus) {
        let now = Utc::now();
        let record = self.stages.entry(stage.to_string()).or_default();
        if status == StageStatus::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if status.is_terminal() {
            record.finished_at = Some(now);
        }
        record.status = status;
    }

    /// Adds executions to a stage's attempt count.
    pub fn add_attempts(&mut self, stage: &str, attempts: u32) {
        let record = self.stages.entry(stage.to_string()).or_default();
        record.attempts = record.attempts.saturating_add(attempts);
    }

    /// Status of a stage, `Pending` if unknown.
    #[must_use]
    pub fn stage_status(&self, stage: &str) -> StageStatus {
        self.stages.get(stage).map(|r| r.status).unwrap_or_default()
    }

    /// Stores a quality metric.
    pub fn set_qa(&mut self, name: impl Into<String>, value: Value) {
        self.qa.insert(name.into(), value);
    }

    /// Records why the run stopped.
    pub fn halt(&mut self, stage: Option<String>, reason: impl Into<String>) {
        if self.halted_by.is_none() {
            self.halted_by = Some(HaltInfo {
                stage,
                reason: reason.into(),
            });
        }
    }

    /// Sets the terminal status; `final` is true only for success.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.is_final = status == RunStatus::Succeeded;
    }

    /// Errors of one stage.
    pub fn errors_for<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a ErrorRecord> + 'a {
        self.errors.iter().filter(move |e| e.stage == stage)
    }
}
