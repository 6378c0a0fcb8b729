//! Durable run records.
//!
//! A [`RunManifest`] is written after every transition of a run so that a
//! crashed or aborted run can be inspected with [`check_status`] and, in
//! state-machine mode, resumed.

mod record;
mod status;
mod store;

pub use record::{ErrorRecord, HaltInfo, RunManifest, StageRecord};
pub use status::{check_status, StageErrorSummary, StatusSummary};
pub use store::{load, ManifestStore};

use std::path::{Path, PathBuf};

/// Default manifest location for a run: `<dir>/<run_id>.json`.
#[must_use]
pub fn manifest_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.json"))
}
