//! Strictly sequential execution over a fixed list of states.
//!
//! Each state maps to one agent. The machine calls the agent, advances on
//! success and retries the same state with exponential backoff on failure,
//! up to a fixed number of attempts. Spend is checked against the budgets
//! before every state. A run can be resumed from its manifest: the states
//! already recorded in `steps`, matched by position, are not run again.

use super::result::{RunResult, StageOutcome};
use super::scope::RunScope;
use super::RunRequest;
use crate::config::EngineConfig;
use crate::core::{AgentOutput, RunStatus, StageStatus};
use crate::definition::StageDefinition;
use crate::errors::{AgentError, ConfigError, EngineError};
use crate::events::{names, noop_sink, SharedEventSink};
use crate::limits::Budgets;
use crate::manifest::{manifest_path, ErrorRecord, ManifestStore, RunManifest};
use crate::queue::BackoffPolicy;
use crate::worker::{ProcessorContext, ProcessorRegistry, Services};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pipeline name recorded in state-machine manifests.
pub const STATE_MACHINE_PIPELINE: &str = "state-machine";

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// States of the sequential article pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArticleState {
    /// Outline the article.
    Plan,
    /// Gather sources.
    Research,
    /// Draft the text.
    Write,
    /// Edit the draft.
    Polish,
    /// Produce images.
    Illustrate,
    /// Render the output documents.
    Format,
    /// Check facts.
    QaFact,
    /// Insert affiliate links.
    Affiliate,
    /// Validate the rendered HTML.
    QaHtml,
    /// Terminal state.
    Done,
}

impl ArticleState {
    /// Every state in execution order.
    pub const ALL: [Self; 10] = [
        Self::Plan,
        Self::Research,
        Self::Write,
        Self::Polish,
        Self::Illustrate,
        Self::Format,
        Self::QaFact,
        Self::Affiliate,
        Self::QaHtml,
        Self::Done,
    ];

    /// The state after this one; `None` for `Done`.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Returns true for `Done`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }

    /// Position in [`ArticleState::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(Self::ALL.len())
    }

    /// Upper-case state name, e.g. `QA_FACT`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Plan => "PLAN",
            Self::Research => "RESEARCH",
            Self::Write => "WRITE",
            Self::Polish => "POLISH",
            Self::Illustrate => "ILLUSTRATE",
            Self::Format => "FORMAT",
            Self::QaFact => "QA_FACT",
            Self::Affiliate => "AFFILIATE",
            Self::QaHtml => "QA_HTML",
            Self::Done => "DONE",
        }
    }

    /// Agent used when no override is configured.
    #[must_use]
    pub fn default_agent(self) -> Option<&'static str> {
        match self {
            Self::Plan => Some("planner"),
            Self::Research => Some("researcher"),
            Self::Write => Some("writer"),
            Self::Polish => Some("polisher"),
            Self::Illustrate => Some("illustrator"),
            Self::Format => Some("formatter"),
            Self::QaFact => Some("fact_checker"),
            Self::Affiliate => Some("affiliate"),
            Self::QaHtml => Some("html_validator"),
            Self::Done => None,
        }
    }
}

impl fmt::Display for ArticleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArticleState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|state| state.name() == wanted)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown state '{s}'")))
    }
}

/// Drives the fixed state sequence.
pub struct StateMachine {
    registry: Arc<ProcessorRegistry>,
    services: Services,
    sink: SharedEventSink,
    agents: BTreeMap<ArticleState, String>,
    budgets: Budgets,
    max_attempts: u32,
    backoff: BackoffPolicy,
    call_timeout: Duration,
    manifest_dir: PathBuf,
}

impl StateMachine {
    /// Creates a machine with the default agent mapping, three attempts
    /// per state and 1 s to 30 s exponential backoff.
    #[must_use]
    pub fn new(registry: ProcessorRegistry) -> Self {
        let defaults = EngineConfig::default();
        let agents = ArticleState::ALL
            .into_iter()
            .filter_map(|state| state.default_agent().map(|agent| (state, agent.to_string())))
            .collect();
        Self {
            registry: Arc::new(registry),
            services: Services::default(),
            sink: noop_sink(),
            agents,
            budgets: defaults.budgets,
            max_attempts: defaults.state_machine.max_attempts,
            backoff: BackoffPolicy::from(&defaults.backoff),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            manifest_dir: defaults.manifest_dir,
        }
    }

    /// Creates a machine from engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unknown state name in
    /// `state_machine.agents`, or if the services cannot be built.
    pub fn from_config(registry: ProcessorRegistry, config: &EngineConfig) -> Result<Self, ConfigError> {
        let mut machine = Self::new(registry)
            .with_services(config.services()?)
            .with_budgets(config.budgets)
            .with_max_attempts(config.state_machine.max_attempts)
            .with_backoff(BackoffPolicy::from(&config.backoff))
            .with_manifest_dir(config.manifest_dir.clone());
        for (state, agent) in &config.state_machine.agents {
            let state: ArticleState = state.parse()?;
            if state.is_terminal() {
                return Err(ConfigError::Invalid("DONE cannot have an agent".to_string()));
            }
            machine.agents.insert(state, agent.clone());
        }
        Ok(machine)
    }

    /// Replaces the shared services.
    #[must_use]
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the spend ceilings checked before every state.
    #[must_use]
    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Maps a state to an agent.
    #[must_use]
    pub fn with_agent(mut self, state: ArticleState, agent: impl Into<String>) -> Self {
        if !state.is_terminal() {
            self.agents.insert(state, agent.into());
        }
        self
    }

    /// Sets attempts per state, at least one.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the delay policy between attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the time allowed per agent call.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the manifest directory.
    #[must_use]
    pub fn with_manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = dir.into();
        self
    }

    /// Agent mapped to a state.
    #[must_use]
    pub fn agent_for(&self, state: ArticleState) -> Option<&str> {
        self.agents.get(&state).map(String::as_str)
    }

    /// Starts a new run from `PLAN`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Config`] if a mapped agent is not registered
    /// - [`EngineError::BudgetExceeded`] if spend reached a ceiling
    /// - [`EngineError::ManifestIo`] if the manifest cannot be written
    /// - [`EngineError::Cancelled`] if the request's token fires
    pub async fn run(&self, request: &RunRequest) -> Result<RunResult, EngineError> {
        self.check_agents()?;
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let path = request
            .manifest_path
            .clone()
            .unwrap_or_else(|| manifest_path(&self.manifest_dir, &run_id));
        let store = ManifestStore::create(
            &path,
            RunManifest::new(&request.topic, &run_id, STATE_MACHINE_PIPELINE),
        )
        .await?;
        self.drive(store, request).await
    }

    /// Continues a run recorded in an existing manifest.
    ///
    /// # Errors
    ///
    /// Same as [`StateMachine::run`]; additionally fails if the manifest
    /// cannot be read.
    pub async fn resume(&self, path: &Path, request: &RunRequest) -> Result<RunResult, EngineError> {
        self.check_agents()?;
        let store = ManifestStore::open(path).await?;
        let completed = store.snapshot().await.steps;
        info!(
            path = %path.display(),
            completed = completed.len(),
            "Resuming state-machine run"
        );
        store
            .update(|m| {
                m.halted_by = None;
                m.status = RunStatus::Running;
            })
            .await?;
        self.drive(store, request).await
    }

    fn check_agents(&self) -> Result<(), ConfigError> {
        for (state, agent) in &self.agents {
            if !self.registry.contains(agent) {
                return Err(ConfigError::UnknownAgent {
                    owner: format!("State {state}"),
                    agent: agent.clone(),
                });
            }
        }
        Ok(())
    }

    async fn drive(&self, store: ManifestStore, request: &RunRequest) -> Result<RunResult, EngineError> {
        let manifest = store.snapshot().await;
        let mut scope = RunScope::new(&manifest.topic, &manifest.run_id, request.variables.clone());
        let mut outcomes = BTreeMap::new();

        let mut meta = Map::new();
        meta.insert("pipeline".into(), json!(STATE_MACHINE_PIPELINE));
        meta.insert("topic".into(), json!(manifest.topic));
        self.services.cost_tracker.start_session(&manifest.run_id, meta);

        self.sink
            .emit(names::RUN_STARTED, Some(json!({"run_id": manifest.run_id, "mode": "state-machine"})))
            .await;

        let walked = self
            .walk(&store, &manifest, request, &mut scope, &mut outcomes)
            .await;
        let spending = self.services.cost_tracker.end_session();

        let status = match walked {
            Ok(status) => status,
            Err(e) => {
                let reason = e.to_string();
                if let Err(write_err) = store
                    .update(|m| {
                        m.halt(None, reason.clone());
                        m.finish(RunStatus::Aborted);
                    })
                    .await
                {
                    warn!(error = %write_err, "Failed to record aborted run");
                }
                self.sink
                    .emit(names::RUN_FAILED, Some(json!({"run_id": manifest.run_id, "error": reason})))
                    .await;
                return Err(e);
            }
        };

        let manifest = store
            .update(|m| {
                m.finish(status);
                m.clone()
            })
            .await?;
        let event = if status == RunStatus::Succeeded {
            names::RUN_COMPLETED
        } else {
            names::RUN_FAILED
        };
        self.sink
            .emit(event, Some(json!({"run_id": manifest.run_id})))
            .await;
        info!(run_id = %manifest.run_id, status = %status, steps = manifest.steps.len(), "State-machine run finished");

        Ok(RunResult {
            run_id: manifest.run_id.clone(),
            status,
            manifest_path: store.path().to_path_buf(),
            manifest,
            stages: outcomes,
            gates: Vec::new(),
            unmet_criteria: Vec::new(),
            spending,
        })
    }

    /// The bounded transition loop. At most `states * max_attempts` agent
    /// calls are made.
    async fn walk(
        &self,
        store: &ManifestStore,
        manifest: &RunManifest,
        request: &RunRequest,
        scope: &mut RunScope,
        outcomes: &mut BTreeMap<String, StageOutcome>,
    ) -> Result<RunStatus, EngineError> {
        let mut state = ArticleState::Plan;
        let mut attempts: u32 = 0;

        while !state.is_terminal() {
            if let Some(ref token) = request.cancellation {
                token.check()?;
            }
            self.services.cost_tracker.check_budget(&self.budgets)?;

            let Some(agent) = self.agent_for(state).map(str::to_string) else {
                return Err(EngineError::Internal(format!("no agent mapped to {state}")));
            };
            if attempts == 0 && manifest.steps.get(state.index()) == Some(&agent) {
                info!(state = %state, agent = %agent, "State already completed; skipping");
                state = state.next().unwrap_or(ArticleState::Done);
                continue;
            }

            let attempt = attempts + 1;
            if attempt == 1 {
                store
                    .update(|m| m.set_stage_status(&agent, StageStatus::Running))
                    .await?;
            }
            let payload = scope.payload_for(
                &StageDefinition::new(&agent, &agent).with_config("state", json!(state.name())),
            );

            match self.call(&agent, payload, attempt).await {
                Ok(output) => {
                    info!(state = %state, agent = %agent, attempt, "State completed");
                    store
                        .update(|m| {
                            m.record_step(agent.clone());
                            m.add_attempts(&agent, attempt);
                            m.set_stage_status(&agent, StageStatus::Completed);
                        })
                        .await?;
                    scope.record(&agent, StageStatus::Completed, Some(output.clone()));
                    outcomes.insert(
                        agent.clone(),
                        StageOutcome {
                            stage: agent.clone(),
                            status: StageStatus::Completed,
                            attempts: attempt,
                            jobs: 1,
                            output: Some(output),
                            error: None,
                        },
                    );
                    self.sink
                        .emit(names::STAGE_COMPLETED, Some(json!({"stage": agent, "state": state})))
                        .await;
                    attempts = 0;
                    state = state.next().unwrap_or(ArticleState::Done);
                }
                Err((kind, err)) => {
                    attempts = attempt;
                    store
                        .update(|m| m.record_error(ErrorRecord::new(&agent, attempt, kind, err.message.clone())))
                        .await?;

                    if attempts >= self.max_attempts || !err.retryable {
                        error!(state = %state, agent = %agent, attempt, error = %err.message, "State failed; stopping run");
                        store
                            .update(|m| {
                                m.add_attempts(&agent, attempt);
                                m.set_stage_status(&agent, StageStatus::Failed);
                                m.halt(Some(agent.clone()), err.message.clone());
                            })
                            .await?;
                        outcomes.insert(
                            agent.clone(),
                            StageOutcome {
                                stage: agent.clone(),
                                status: StageStatus::Failed,
                                attempts: attempt,
                                jobs: 1,
                                output: None,
                                error: Some(err.message.clone()),
                            },
                        );
                        self.sink
                            .emit(
                                names::STAGE_FAILED,
                                Some(json!({"stage": agent, "state": state, "error": err.message})),
                            )
                            .await;
                        return Ok(RunStatus::Failed);
                    }

                    let delay = self.backoff.delay_for(attempts);
                    warn!(
                        state = %state,
                        agent = %agent,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err.message,
                        "State failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Ok(RunStatus::Succeeded)
    }

    /// Calls an agent once. Failures come back with their manifest kind.
    async fn call(&self, agent: &str, payload: Value, attempt: u32) -> Result<AgentOutput, (&'static str, AgentError)> {
        let processor = self
            .registry
            .get(agent)
            .ok_or_else(|| ("agent", AgentError::permanent(format!("no processor registered for '{agent}'"))))?;
        let ctx = ProcessorContext::direct(Some(agent.to_string()), attempt, self.services.clone());

        let task = tokio::spawn(async move { processor.execute(payload, ctx).await });
        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(Ok(output))) if output.success => Ok(output),
            Ok(Ok(Ok(output))) => Err((
                "output",
                AgentError::new(output.error().unwrap_or("agent reported success=false")),
            )),
            Ok(Ok(Err(e))) => Err(("agent", e)),
            Ok(Err(join_err)) => Err(("agent", AgentError::permanent(format!("processor panicked: {join_err}")))),
            Err(_) => Err((
                "timeout",
                AgentError::new(format!("timed out after {}ms", self.call_timeout.as_millis())),
            )),
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("agents", &self.agents)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
