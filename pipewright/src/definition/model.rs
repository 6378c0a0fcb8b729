//! Declarative pipeline definition types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_quota_max_wait_ms() -> u64 {
    60_000
}

fn default_queue() -> String {
    "default".to_string()
}

/// A complete pipeline definition, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// The pipeline name.
    pub name: String,
    /// Optional human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Stages in declaration order.
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
    /// Global settings.
    #[serde(default)]
    pub settings: PipelineSettings,
    /// Checks run after named stages.
    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,
    /// Conditions a finished run must satisfy.
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    /// Event name to notification actions.
    #[serde(default)]
    pub notifications: BTreeMap<String, Vec<NotificationAction>>,
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            stages: Vec::new(),
            settings: PipelineSettings::default(),
            quality_gates: Vec::new(),
            success_criteria: SuccessCriteria::default(),
            notifications: BTreeMap::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends a quality gate.
    #[must_use]
    pub fn with_gate(mut self, gate: QualityGate) -> Self {
        self.quality_gates.push(gate);
        self
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns a stage by id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }
}

/// One node of the stage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage id.
    pub id: String,
    /// Name of the processor that performs the work.
    pub agent: String,
    /// Free-form parameters passed to the agent.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Stages that must reach a terminal state first.
    #[serde(default, rename = "dependsOn", alias = "depends_on")]
    pub depends_on: Vec<String>,
    /// Boolean expression evaluated against the run scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Whether results are cached by canonical input.
    #[serde(default)]
    pub cache: bool,
    /// Whether a failure aborts the run.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Abort the run on failure even when not required.
    #[serde(default)]
    pub fail_fast: bool,
    /// Requires external approval before dispatch.
    #[serde(default)]
    pub manual: bool,
    /// Fan-out selector naming an array in the run scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,
    /// Per-job timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Extra attempts after the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Total attempts; takes precedence over `retries`.
    #[serde(
        default,
        rename = "maxAttempts",
        alias = "max_attempts",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_attempts: Option<u32>,
    /// Queue the stage's jobs are sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Job priority, higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// External service whose quota the stage consumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl StageDefinition {
    /// Creates a required stage with no dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            config: Map::new(),
            depends_on: Vec::new(),
            condition: None,
            cache: false,
            required: true,
            fail_fast: false,
            manual: false,
            foreach: None,
            timeout: None,
            retries: None,
            max_attempts: None,
            queue: None,
            priority: 0,
            service: None,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Adds a config entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Sets the condition expression.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Marks the stage optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Enables result caching.
    #[must_use]
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    /// Marks the stage as requiring approval.
    #[must_use]
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    /// Sets the fan-out selector.
    #[must_use]
    pub fn with_foreach(mut self, selector: impl Into<String>) -> Self {
        self.foreach = Some(selector.into());
        self
    }

    /// Sets the total attempt count.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the timeout in milliseconds.
    #[must_use]
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }

    /// Sets the queue name.
    #[must_use]
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Sets the external service name.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Timeout for this stage's jobs.
    #[must_use]
    pub fn effective_timeout(&self, settings: &PipelineSettings) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(settings.timeouts.default))
    }

    /// Total attempts allowed, at least one.
    #[must_use]
    pub fn effective_max_attempts(&self, settings: &PipelineSettings) -> u32 {
        self.max_attempts
            .unwrap_or_else(|| self.retries.unwrap_or(settings.retries).saturating_add(1))
            .max(1)
    }

    /// Queue the stage maps to.
    ///
    /// An explicit `queue` wins; otherwise an agent with its own entry in
    /// `settings.parallel` gets a queue of that name; everything else shares
    /// the default queue.
    #[must_use]
    pub fn queue_name<'a>(&'a self, settings: &'a PipelineSettings) -> &'a str {
        if let Some(ref queue) = self.queue {
            return queue;
        }
        if settings.parallel.contains_key(&self.agent) {
            return &self.agent;
        }
        &settings.default_queue
    }

    /// Returns true if a failure of this stage aborts the run.
    #[must_use]
    pub fn aborts_on_failure(&self) -> bool {
        self.required || self.fail_fast
    }
}

/// Global pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Concurrency per queue name.
    #[serde(default)]
    pub parallel: BTreeMap<String, usize>,
    /// Timeout defaults.
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Default extra attempts after the first.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Default retry backoff.
    #[serde(default)]
    pub backoff: BackoffSettings,
    /// Longest the orchestrator waits on an exhausted quota before aborting.
    #[serde(default = "default_quota_max_wait_ms")]
    pub quota_max_wait_ms: u64,
    /// Queue used by stages without a mapping.
    #[serde(default = "default_queue")]
    pub default_queue: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            parallel: BTreeMap::new(),
            timeouts: TimeoutSettings::default(),
            retries: default_retries(),
            backoff: BackoffSettings::default(),
            quota_max_wait_ms: default_quota_max_wait_ms(),
            default_queue: default_queue(),
        }
    }
}

impl PipelineSettings {
    /// Concurrency for a queue, defaulting to one.
    #[must_use]
    pub fn concurrency(&self, queue: &str) -> usize {
        self.parallel.get(queue).copied().unwrap_or(1).max(1)
    }
}

/// Timeout defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Default per-job timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub default: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default: default_timeout_ms(),
        }
    }
}

/// Retry backoff defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// A check run synchronously after a stage's batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    /// Gate name, used as the key in the manifest's `qa` map.
    pub name: String,
    /// Stage id the gate runs after.
    pub after: String,
    /// Expression that must hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Processor invoked with the stage output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// Parameters for the check processor.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Whether a failing gate aborts the run.
    #[serde(default = "default_true")]
    pub required: bool,
}

impl QualityGate {
    /// Creates a condition gate.
    #[must_use]
    pub fn condition(
        name: impl Into<String>,
        after: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            after: after.into(),
            condition: Some(condition.into()),
            check: None,
            config: Map::new(),
            required: true,
        }
    }

    /// Creates a gate backed by a check processor.
    #[must_use]
    pub fn check(name: impl Into<String>, after: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            after: after.into(),
            condition: None,
            check: Some(agent.into()),
            config: Map::new(),
            required: true,
        }
    }

    /// Marks the gate optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Conditions evaluated when a run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// Stages that must have succeeded.
    #[serde(default)]
    pub required_stages: Vec<String>,
    /// Minimum number of successful stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_completed: Option<usize>,
    /// Maximum tolerated optional-stage failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<usize>,
}

/// Severity used by log notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyLevel {
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level.
    Error,
}

/// An action triggered by a run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationAction {
    /// Write a log record.
    Log {
        /// Message text; `{{event}}`, `{{stage}}` and `{{run_id}}` are filled in.
        message: String,
        /// Log level.
        #[serde(default)]
        level: NotifyLevel,
    },
    /// Forward to the configured event sink.
    Emit {
        /// Event type to emit; defaults to `notification.<event>`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_defaults() {
        let stage: StageDefinition =
            serde_json::from_value(json!({"id": "plan", "agent": "planner"})).unwrap();

        assert!(stage.required);
        assert!(!stage.cache);
        assert!(!stage.manual);
        assert!(stage.depends_on.is_empty());
        assert_eq!(stage.priority, 0);
    }

    #[test]
    fn test_depends_on_aliases() {
        let camel: StageDefinition =
            serde_json::from_value(json!({"id": "b", "agent": "x", "dependsOn": ["a"]})).unwrap();
        let snake: StageDefinition =
            serde_json::from_value(json!({"id": "b", "agent": "x", "depends_on": ["a"]})).unwrap();

        assert_eq!(camel.depends_on, vec!["a".to_string()]);
        assert_eq!(snake.depends_on, camel.depends_on);
    }

    #[test]
    fn test_effective_attempts() {
        let settings = PipelineSettings::default();

        assert_eq!(StageDefinition::new("a", "x").effective_max_attempts(&settings), 3);

        let mut stage = StageDefinition::new("a", "x");
        stage.retries = Some(0);
        assert_eq!(stage.effective_max_attempts(&settings), 1);

        let stage = stage.with_max_attempts(5);
        assert_eq!(stage.effective_max_attempts(&settings), 5);

        let stage = StageDefinition::new("a", "x").with_max_attempts(0);
        assert_eq!(stage.effective_max_attempts(&settings), 1);
    }

    #[test]
    fn test_queue_mapping() {
        let mut settings = PipelineSettings::default();
        settings.parallel.insert("writer".into(), 3);

        assert_eq!(StageDefinition::new("a", "writer").queue_name(&settings), "writer");
        assert_eq!(StageDefinition::new("b", "planner").queue_name(&settings), "default");
        assert_eq!(
            StageDefinition::new("c", "writer").on_queue("ai").queue_name(&settings),
            "ai"
        );
        assert_eq!(settings.concurrency("writer"), 3);
        assert_eq!(settings.concurrency("default"), 1);
    }

    #[test]
    fn test_notification_actions_parse() {
        let actions: Vec<NotificationAction> = serde_json::from_value(json!([
            {"type": "log", "message": "run {{run_id}} failed", "level": "error"},
            {"type": "emit"}
        ]))
        .unwrap();

        assert_eq!(
            actions[0],
            NotificationAction::Log {
                message: "run {{run_id}} failed".into(),
                level: NotifyLevel::Error,
            }
        );
        assert_eq!(actions[1], NotificationAction::Emit { event: None });
    }
}
