//! Read-only status summaries for `check-status`.

use super::record::{HaltInfo, RunManifest};
use super::store::load;
use crate::core::RunStatus;
use crate::errors::ManifestIoError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Errors of one stage, collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageErrorSummary {
    /// Failed attempts recorded.
    pub failures: usize,
    /// Highest attempt number seen.
    pub max_attempt: u32,
    /// Kind of the latest error.
    pub last_kind: String,
    /// Message of the latest error.
    pub last_message: String,
}

/// What a manifest says about its run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    /// Run id.
    pub run_id: String,
    /// Topic.
    pub topic: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Run status.
    pub status: RunStatus,
    /// Whether the run ended successfully.
    pub is_final: bool,
    /// Completed steps.
    pub steps: Vec<String>,
    /// Skipped stages.
    pub skipped: Vec<String>,
    /// Errors grouped by stage.
    pub errors: BTreeMap<String, StageErrorSummary>,
    /// Where the run stopped, if it stopped early.
    pub halted_by: Option<HaltInfo>,
}

impl StatusSummary {
    /// Summarizes a manifest.
    #[must_use]
    pub fn from_manifest(manifest: &RunManifest) -> Self {
        let mut errors: BTreeMap<String, StageErrorSummary> = BTreeMap::new();
        for error in &manifest.errors {
            let entry = errors
                .entry(error.stage.clone())
                .or_insert_with(|| StageErrorSummary {
                    failures: 0,
                    max_attempt: 0,
                    last_kind: String::new(),
                    last_message: String::new(),
                });
            entry.failures += 1;
            entry.max_attempt = entry.max_attempt.max(error.attempt);
            entry.last_kind.clone_from(&error.kind);
            entry.last_message.clone_from(&error.message);
        }

        Self {
            run_id: manifest.run_id.clone(),
            topic: manifest.topic.clone(),
            pipeline: manifest.pipeline.clone(),
            status: manifest.status,
            is_final: manifest.is_final,
            steps: manifest.steps.clone(),
            skipped: manifest.skipped.clone(),
            errors,
            halted_by: manifest.halted_by.clone(),
        }
    }

    /// The stage the run halted on, if any.
    #[must_use]
    pub fn halting_stage(&self) -> Option<&str> {
        self.halted_by.as_ref().and_then(|h| h.stage.as_deref())
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({})", self.run_id, self.pipeline)?;
        writeln!(f, "Topic: {}", self.topic)?;
        writeln!(f, "Status: {} (final: {})", self.status, self.is_final)?;

        if self.steps.is_empty() {
            writeln!(f, "Steps: none")?;
        } else {
            writeln!(f, "Steps: {}", self.steps.join(" -> "))?;
        }
        if !self.skipped.is_empty() {
            writeln!(f, "Skipped: {}", self.skipped.join(", "))?;
        }

        if self.errors.is_empty() {
            writeln!(f, "Errors: none")?;
        } else {
            writeln!(f, "Errors:")?;
            for (stage, summary) in &self.errors {
                writeln!(
                    f,
                    "  {stage}: {} failed attempt(s), last attempt {} [{}] {}",
                    summary.failures, summary.max_attempt, summary.last_kind, summary.last_message
                )?;
            }
        }

        if let Some(halt) = &self.halted_by {
            match &halt.stage {
                Some(stage) => writeln!(f, "Halted at: {stage} ({})", halt.reason)?,
                None => writeln!(f, "Halted: {}", halt.reason)?,
            }
        }
        Ok(())
    }
}

/// Loads a manifest file and summarizes it.
///
/// # Errors
///
/// Returns [`ManifestIoError`] if the file cannot be read or parsed.
pub async fn check_status(path: &Path) -> Result<StatusSummary, ManifestIoError> {
    let manifest = load(path).await?;
    Ok(StatusSummary::from_manifest(&manifest))
}
