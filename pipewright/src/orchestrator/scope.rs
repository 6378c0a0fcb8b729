//! Run scope: what conditions see and what payloads are built from.

use crate::core::{AgentOutput, StageStatus};
use crate::definition::condition::lookup;
use crate::definition::{StageDefinition, Variables};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct StageState {
    status: StageStatus,
    output: Option<AgentOutput>,
}

/// Accumulated state of one run.
#[derive(Debug, Clone)]
pub struct RunScope {
    topic: String,
    run_id: String,
    vars: Variables,
    stages: BTreeMap<String, StageState>,
    output_dir: Option<Value>,
}

impl RunScope {
    /// Creates an empty scope.
    #[must_use]
    pub fn new(topic: impl Into<String>, run_id: impl Into<String>, vars: Variables) -> Self {
        Self {
            topic: topic.into(),
            run_id: run_id.into(),
            vars,
            stages: BTreeMap::new(),
            output_dir: None,
        }
    }

    /// Run topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Records a stage's terminal state.
    ///
    /// The latest `output_dir` field seen in any output is carried into
    /// later payloads.
    pub fn record(&mut self, stage: &str, status: StageStatus, output: Option<AgentOutput>) {
        if let Some(dir) = output.as_ref().and_then(|o| o.get("output_dir")) {
            self.output_dir = Some(dir.clone());
        }
        self.stages
            .insert(stage.to_string(), StageState { status, output });
    }

    /// Status of a stage; `Pending` if it has not finished.
    #[must_use]
    pub fn status(&self, stage: &str) -> StageStatus {
        self.stages.get(stage).map(|s| s.status).unwrap_or_default()
    }

    /// Output of a finished stage.
    #[must_use]
    pub fn output(&self, stage: &str) -> Option<&AgentOutput> {
        self.stages.get(stage).and_then(|s| s.output.as_ref())
    }

    /// Scope document for condition evaluation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let stages: Map<String, Value> = self
            .stages
            .iter()
            .map(|(id, state)| {
                let output = state.output.as_ref().map_or(Value::Null, AgentOutput::to_value);
                (
                    id.clone(),
                    json!({
                        "status": state.status.to_string(),
                        "success": state.status.is_success(),
                        "output": output,
                    }),
                )
            })
            .collect();

        json!({
            "topic": self.topic,
            "run_id": self.run_id,
            "vars": self.vars,
            "stages": stages,
        })
    }

    /// Builds the job payload for a stage.
    ///
    /// Run context goes in first; keys from the stage's `config` override it.
    #[must_use]
    pub fn payload_for(&self, stage: &StageDefinition) -> Value {
        let outputs: Map<String, Value> = self
            .stages
            .iter()
            .filter(|(_, state)| state.status.is_success())
            .filter_map(|(id, state)| state.output.as_ref().map(|o| (id.clone(), o.to_value())))
            .collect();

        let mut payload = Map::new();
        payload.insert("topic".into(), Value::String(self.topic.clone()));
        payload.insert("run_id".into(), Value::String(self.run_id.clone()));
        payload.insert("vars".into(), json!(self.vars));
        payload.insert("outputs".into(), Value::Object(outputs));
        if let Some(ref dir) = self.output_dir {
            payload.insert("output_dir".into(), dir.clone());
        }
        payload.extend(stage.config.clone());
        Value::Object(payload)
    }

    /// Builds one payload per element of the array `selector` names.
    ///
    /// # Errors
    ///
    /// Returns a message if the selector resolves to nothing or to a
    /// non-array value.
    pub fn fan_out(&self, stage: &StageDefinition, selector: &str) -> Result<Vec<Value>, String> {
        let scope = self.to_value();
        let items = match lookup(&scope, selector) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(format!("foreach selector '{selector}' is not an array")),
            None => return Err(format!("foreach selector '{selector}' matched nothing")),
        };

        Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let mut payload = self.payload_for(stage);
                if let Value::Object(ref mut map) = payload {
                    map.insert("item".into(), item);
                    map.insert("index".into(), json!(index));
                }
                payload
            })
            .collect())
    }
}

/// The part of a payload that identifies a cached result.
///
/// The run id changes on every run, so every `run_id` key is left out,
/// including those nested inside upstream outputs.
#[must_use]
pub fn cache_input(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| key.as_str() != "run_id")
                .map(|(key, value)| (key.clone(), cache_input(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(cache_input).collect()),
        other => other.clone(),
    }
}
