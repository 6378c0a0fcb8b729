//! Loading, validating and compiling pipeline definitions.

use super::condition::Condition;
use super::model::PipelineDefinition;
use super::plan::ExecutionPlan;
use super::variables::{substitute, Variables};
use crate::errors::ConfigError;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Events a notification may be bound to.
pub const NOTIFICATION_EVENTS: &[&str] = &[
    "run.started",
    "run.completed",
    "run.failed",
    "stage.failed",
    "stage.completed",
];

/// Where a pipeline definition comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineSource {
    /// YAML text.
    Yaml(String),
    /// JSON text.
    Json(String),
    /// A file; `.json` files are parsed as JSON, anything else as YAML.
    File(PathBuf),
}

impl PipelineSource {
    /// Creates a file source.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    fn parse(&self) -> Result<Value, ConfigError> {
        match self {
            Self::Yaml(text) => parse_yaml(text),
            Self::Json(text) => parse_json(text),
            Self::File(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                if is_json(path) {
                    parse_json(&text)
                } else {
                    parse_yaml(&text)
                }
            }
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

fn parse_yaml(text: &str) -> Result<Value, ConfigError> {
    serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn parse_json(text: &str) -> Result<Value, ConfigError> {
    serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// A validated definition with its compiled plan.
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    /// The definition after variable substitution.
    pub definition: PipelineDefinition,
    /// The compiled execution plan.
    pub plan: ExecutionPlan,
    conditions: BTreeMap<String, Condition>,
    gate_conditions: BTreeMap<String, Condition>,
}

impl LoadedPipeline {
    /// Validates and compiles a definition built in code.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for any structural problem.
    pub fn from_definition(definition: PipelineDefinition) -> Result<Self, ConfigError> {
        validate(&definition)?;
        let plan = ExecutionPlan::compile(&definition)?;

        let mut conditions = BTreeMap::new();
        for stage in &definition.stages {
            if let Some(ref source) = stage.condition {
                let parsed = Condition::parse(source).map_err(|message| {
                    ConfigError::InvalidCondition {
                        owner: stage.id.clone(),
                        message,
                    }
                })?;
                conditions.insert(stage.id.clone(), parsed);
            }
        }

        let mut gate_conditions = BTreeMap::new();
        for gate in &definition.quality_gates {
            if let Some(ref source) = gate.condition {
                let parsed = Condition::parse(source).map_err(|message| {
                    ConfigError::InvalidCondition {
                        owner: gate.name.clone(),
                        message,
                    }
                })?;
                gate_conditions.insert(gate.name.clone(), parsed);
            }
        }

        Ok(Self {
            definition,
            plan,
            conditions,
            gate_conditions,
        })
    }

    /// The parsed condition of a stage.
    #[must_use]
    pub fn condition_for(&self, stage_id: &str) -> Option<&Condition> {
        self.conditions.get(stage_id)
    }

    /// The parsed condition of a quality gate.
    #[must_use]
    pub fn gate_condition(&self, gate: &str) -> Option<&Condition> {
        self.gate_conditions.get(gate)
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Builder-style loader carrying the substitution variables.
#[derive(Debug, Clone, Default)]
pub struct PipelineLoader {
    variables: Variables,
}

impl PipelineLoader {
    /// Creates a loader with no variables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run topic, exposed as `{{topic}}`.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.variables
            .insert("topic".to_string(), Value::String(topic.into()));
        self
    }

    /// Adds one variable.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Adds many variables.
    #[must_use]
    pub fn with_variables(mut self, vars: Variables) -> Self {
        self.variables.extend(vars);
        self
    }

    /// Loads a pipeline.
    ///
    /// # Errors
    ///
    /// See [`load`].
    pub fn load(&self, source: &PipelineSource) -> Result<LoadedPipeline, ConfigError> {
        load(source, &self.variables)
    }
}

/// Parses, substitutes, validates and compiles a pipeline.
///
/// Calling it repeatedly with the same inputs yields equal results.
///
/// # Errors
///
/// Returns a [`ConfigError`] on parse failure, unresolved variables, or any
/// structural problem in the definition.
pub fn load(source: &PipelineSource, variables: &Variables) -> Result<LoadedPipeline, ConfigError> {
    let mut document = source.parse()?;
    // Notification templates are rendered per event at run time.
    let notifications = document
        .as_object_mut()
        .and_then(|map| map.remove("notifications"));
    substitute(&mut document, variables)?;
    if let (Some(map), Some(notifications)) = (document.as_object_mut(), notifications) {
        map.insert("notifications".to_string(), notifications);
    }
    let definition: PipelineDefinition =
        serde_json::from_value(document).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let loaded = LoadedPipeline::from_definition(definition)?;
    tracing::debug!(
        pipeline = %loaded.name(),
        stages = loaded.plan.stage_count(),
        batches = loaded.plan.batch_count(),
        "Pipeline loaded"
    );
    Ok(loaded)
}

fn validate(def: &PipelineDefinition) -> Result<(), ConfigError> {
    if def.stages.is_empty() {
        return Err(ConfigError::EmptyPipeline(def.name.clone()));
    }

    let mut seen = HashSet::new();
    for stage in &def.stages {
        if stage.id.trim().is_empty() {
            return Err(ConfigError::Invalid("stage id cannot be empty".to_string()));
        }
        if !seen.insert(stage.id.as_str()) {
            return Err(ConfigError::DuplicateStage(stage.id.clone()));
        }
    }

    for stage in &def.stages {
        for dep in &stage.depends_on {
            if *dep == stage.id {
                return Err(ConfigError::SelfDependency(stage.id.clone()));
            }
            if !seen.contains(dep.as_str()) {
                return Err(ConfigError::UnknownDependency {
                    stage: stage.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        if stage.agent.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "stage '{}' has no agent",
                stage.id
            )));
        }
    }

    let mut gate_names = HashSet::new();
    for gate in &def.quality_gates {
        if !gate_names.insert(gate.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate quality gate '{}'",
                gate.name
            )));
        }
        if !seen.contains(gate.after.as_str()) {
            return Err(ConfigError::UnknownStageReference {
                context: format!("Quality gate '{}'", gate.name),
                stage: gate.after.clone(),
            });
        }
        if gate.condition.is_none() && gate.check.is_none() {
            return Err(ConfigError::Invalid(format!(
                "quality gate '{}' needs a condition or a check",
                gate.name
            )));
        }
    }

    for stage in &def.success_criteria.required_stages {
        if !seen.contains(stage.as_str()) {
            return Err(ConfigError::UnknownStageReference {
                context: "Success criteria".to_string(),
                stage: stage.clone(),
            });
        }
    }

    for event in def.notifications.keys() {
        if !NOTIFICATION_EVENTS.contains(&event.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown notification event '{event}'"
            )));
        }
    }

    Ok(())
}
