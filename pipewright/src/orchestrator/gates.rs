//! Quality gates run after a stage's batch, and the run's success criteria.

use super::scope::RunScope;
use crate::core::StageStatus;
use crate::definition::{LoadedPipeline, QualityGate, SuccessCriteria};
use crate::worker::{ProcessorContext, ProcessorRegistry, Services};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Result of one gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateResult {
    /// Gate name.
    pub name: String,
    /// Stage the gate follows.
    pub after: String,
    /// Whether the gate passed.
    pub passed: bool,
    /// Whether a failure fails the run.
    pub required: bool,
    /// Evaluated value or check output.
    pub detail: Value,
}

impl GateResult {
    /// The value stored under the gate's name in `manifest.qa`.
    #[must_use]
    pub fn to_qa(&self) -> Value {
        json!({
            "after": self.after,
            "passed": self.passed,
            "required": self.required,
            "detail": self.detail,
        })
    }
}

/// Evaluates a gate against the current scope.
///
/// A condition gate passes when its expression is truthy. A check gate
/// calls its processor directly with the gate `config` plus the guarded
/// stage's id and output, and passes when the output reports success. A
/// missing processor, an error or a timeout fails the gate.
pub async fn evaluate_gate(
    gate: &QualityGate,
    pipeline: &LoadedPipeline,
    scope: &RunScope,
    registry: &ProcessorRegistry,
    services: &Services,
) -> GateResult {
    let (passed, detail) = if let Some(condition) = pipeline.gate_condition(&gate.name) {
        let scope_value = scope.to_value();
        (
            condition.evaluate(&scope_value),
            json!({
                "condition": condition.source(),
                "value": condition.value(&scope_value),
            }),
        )
    } else if let Some(ref agent) = gate.check {
        run_check(gate, agent, pipeline, scope, registry, services).await
    } else {
        (false, json!({"error": "gate has neither condition nor check"}))
    };

    if passed {
        debug!(gate = %gate.name, after = %gate.after, "Quality gate passed");
    } else {
        warn!(gate = %gate.name, after = %gate.after, required = gate.required, "Quality gate failed");
    }

    GateResult {
        name: gate.name.clone(),
        after: gate.after.clone(),
        passed,
        required: gate.required,
        detail,
    }
}

async fn run_check(
    gate: &QualityGate,
    agent: &str,
    pipeline: &LoadedPipeline,
    scope: &RunScope,
    registry: &ProcessorRegistry,
    services: &Services,
) -> (bool, Value) {
    let Some(processor) = registry.get(agent) else {
        return (false, json!({"error": format!("no processor registered for '{agent}'")}));
    };

    let mut payload = gate.config.clone();
    payload.insert("topic".into(), json!(scope.topic()));
    payload.insert("run_id".into(), json!(scope.run_id()));
    payload.insert("stage".into(), json!(gate.after));
    payload.insert(
        "output".into(),
        scope
            .output(&gate.after)
            .map_or(Value::Null, crate::core::AgentOutput::to_value),
    );

    let ctx = ProcessorContext::direct(Some(gate.after.clone()), 1, services.clone());
    let timeout = std::time::Duration::from_millis(pipeline.definition.settings.timeouts.default);
    match tokio::time::timeout(timeout, processor.execute(Value::Object(payload), ctx)).await {
        Ok(Ok(output)) => (output.success, output.to_value()),
        Ok(Err(e)) => (false, json!({"error": e.message})),
        Err(_) => (
            false,
            json!({"error": format!("check timed out after {}ms", timeout.as_millis())}),
        ),
    }
}

/// Checks the end-of-run criteria against final stage statuses.
///
/// Returns one message per unmet criterion; empty means the criteria hold.
#[must_use]
pub fn check_success_criteria(
    criteria: &SuccessCriteria,
    statuses: &BTreeMap<String, StageStatus>,
) -> Vec<String> {
    let mut unmet = Vec::new();

    for stage in &criteria.required_stages {
        let status = statuses.get(stage).copied().unwrap_or_default();
        if !status.is_success() {
            unmet.push(format!("required stage '{stage}' is {status}"));
        }
    }

    let completed = statuses.values().filter(|s| s.is_success()).count();
    if let Some(min) = criteria.min_completed {
        if completed < min {
            unmet.push(format!("{completed} stage(s) completed, at least {min} required"));
        }
    }

    let failed = statuses
        .values()
        .filter(|s| **s == StageStatus::Failed)
        .count();
    if let Some(max) = criteria.max_failures {
        if failed > max {
            unmet.push(format!("{failed} stage(s) failed, at most {max} allowed"));
        }
    }

    unmet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AgentOutput;
    use crate::definition::{PipelineDefinition, StageDefinition, Variables};
    use crate::testing::{FailingProcessor, RecordingProcessor};

    fn pipeline(gate: QualityGate) -> LoadedPipeline {
        LoadedPipeline::from_definition(
            PipelineDefinition::new("book")
                .with_stage(StageDefinition::new("write", "writer"))
                .with_gate(gate),
        )
        .unwrap()
    }

    fn scope(words: u64) -> RunScope {
        let mut scope = RunScope::new("rust", "r1", Variables::new());
        scope.record(
            "write",
            StageStatus::Completed,
            Some(AgentOutput::ok_value("words", json!(words))),
        );
        scope
    }

    #[tokio::test]
    async fn test_condition_gate() {
        let gate = QualityGate::condition("length", "write", "stages.write.output.words >= 1000");
        let pipeline = pipeline(gate.clone());
        let registry = ProcessorRegistry::new();
        let services = Services::default();

        let pass = evaluate_gate(&gate, &pipeline, &scope(1500), &registry, &services).await;
        assert!(pass.passed);
        assert_eq!(pass.to_qa()["passed"], json!(true));

        let fail = evaluate_gate(&gate, &pipeline, &scope(10), &registry, &services).await;
        assert!(!fail.passed);
        assert!(fail.required);
    }

    #[tokio::test]
    async fn test_check_gate_gets_stage_output() {
        let gate = QualityGate::check("facts", "write", "fact-checker");
        let pipeline = pipeline(gate.clone());
        let checker = RecordingProcessor::new();
        let registry = ProcessorRegistry::new().with("fact-checker", checker.clone());

        let result =
            evaluate_gate(&gate, &pipeline, &scope(900), &registry, &Services::default()).await;

        assert!(result.passed);
        let calls = checker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["stage"], json!("write"));
        assert_eq!(calls[0].payload["output"]["words"], json!(900));
    }

    #[tokio::test]
    async fn test_check_gate_failures() {
        let gate = QualityGate::check("facts", "write", "fact-checker").optional();
        let pipeline = pipeline(gate.clone());

        let missing = evaluate_gate(
            &gate,
            &pipeline,
            &scope(1),
            &ProcessorRegistry::new(),
            &Services::default(),
        )
        .await;
        assert!(!missing.passed);
        assert!(!missing.required);

        let registry =
            ProcessorRegistry::new().with("fact-checker", FailingProcessor::new("unsupported claim"));
        let failed =
            evaluate_gate(&gate, &pipeline, &scope(1), &registry, &Services::default()).await;
        assert!(!failed.passed);
        assert_eq!(failed.detail["error"], json!("unsupported claim"));
    }

    #[test]
    fn test_success_criteria() {
        let mut statuses = BTreeMap::new();
        statuses.insert("plan".to_string(), StageStatus::Completed);
        statuses.insert("write".to_string(), StageStatus::Cached);
        statuses.insert("illustrate".to_string(), StageStatus::Failed);
        statuses.insert("translate".to_string(), StageStatus::Skipped);

        let lenient = SuccessCriteria {
            required_stages: vec!["plan".into(), "write".into()],
            min_completed: Some(2),
            max_failures: Some(1),
        };
        assert!(check_success_criteria(&lenient, &statuses).is_empty());

        let strict = SuccessCriteria {
            required_stages: vec!["translate".into()],
            min_completed: Some(3),
            max_failures: Some(0),
        };
        let unmet = check_success_criteria(&strict, &statuses);
        assert_eq!(unmet.len(), 3);
        assert!(unmet[0].contains("'translate' is skipped"));
    }
}
