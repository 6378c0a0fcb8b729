//! Assertions over run results and recorded calls.

use super::processors::RecordedCall;
use crate::core::StageStatus;
use crate::orchestrator::RunResult;

/// Asserts that the run succeeded.
pub fn assert_run_succeeded(result: &RunResult) {
    assert!(
        result.succeeded(),
        "Expected run to succeed, got {:?} (halted by {:?}, unmet: {:?})",
        result.status,
        result.manifest.halted_by,
        result.unmet_criteria
    );
}

/// Asserts that the run did not succeed.
pub fn assert_run_failed(result: &RunResult) {
    assert!(
        !result.succeeded(),
        "Expected run to fail, but it succeeded with steps {:?}",
        result.manifest.steps
    );
}

/// Asserts a stage's final status.
pub fn assert_stage_status(result: &RunResult, stage: &str, expected: StageStatus) {
    let actual = result.stage_status(stage);
    assert_eq!(
        actual, expected,
        "Expected stage '{stage}' to be {expected}, got {actual}"
    );
}

/// Asserts that every call in `before` finished before any call in `after`
/// started.
pub fn assert_ran_before(before: &[RecordedCall], after: &[RecordedCall]) {
    assert!(!before.is_empty(), "No calls recorded for the earlier stage");
    assert!(!after.is_empty(), "No calls recorded for the later stage");
    let last_finish = before.iter().map(|c| c.finished_at).max();
    let first_start = after.iter().map(|c| c.started_at).min();
    assert!(
        last_finish <= first_start,
        "Expected {:?} to finish before {:?} started",
        before.iter().map(|c| c.stage.clone()).collect::<Vec<_>>(),
        after.iter().map(|c| c.stage.clone()).collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunStatus;
    use crate::manifest::RunManifest;
    use crate::orchestrator::StageOutcome;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn result(status: RunStatus) -> RunResult {
        let mut stages = BTreeMap::new();
        stages.insert(
            "write".to_string(),
            StageOutcome::without_jobs("write", StageStatus::Completed),
        );
        RunResult {
            run_id: "r1".into(),
            status,
            manifest_path: PathBuf::from("r1.json"),
            manifest: RunManifest::new("rust", "r1", "book"),
            stages,
            gates: Vec::new(),
            unmet_criteria: Vec::new(),
            spending: None,
        }
    }

    fn call(stage: &str, start: Instant, millis: u64) -> RecordedCall {
        RecordedCall {
            job_id: "j".into(),
            queue: "q".into(),
            stage: Some(stage.into()),
            attempt: 1,
            payload: Value::Null,
            started_at: start,
            finished_at: start + Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_run_assertions() {
        assert_run_succeeded(&result(RunStatus::Succeeded));
        assert_run_failed(&result(RunStatus::Failed));
        assert_stage_status(&result(RunStatus::Succeeded), "write", StageStatus::Completed);
    }

    #[test]
    #[should_panic(expected = "Expected run to succeed")]
    fn test_assert_run_succeeded_fails() {
        assert_run_succeeded(&result(RunStatus::Aborted));
    }

    #[test]
    fn test_ran_before() {
        let t0 = Instant::now();
        let plan = vec![call("plan", t0, 10)];
        let write = vec![call("write", t0 + Duration::from_millis(10), 5)];
        assert_ran_before(&plan, &write);
    }

    #[test]
    #[should_panic(expected = "to finish before")]
    fn test_ran_before_detects_overlap() {
        let t0 = Instant::now();
        let plan = vec![call("plan", t0, 10)];
        let write = vec![call("write", t0 + Duration::from_millis(5), 5)];
        assert_ran_before(&plan, &write);
    }
}
