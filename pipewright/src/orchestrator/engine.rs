//! Queue-based pipeline execution.

use super::approval::{ApprovalDecision, ApprovalRequest, AutoApprover, StageApprover};
use super::gates::{check_success_criteria, evaluate_gate, GateResult};
use super::notifications::{Notification, Notifier};
use super::result::{RunResult, StageOutcome};
use super::scope::{cache_input, RunScope};
use crate::cache::{cache_key, CachedEntry};
use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::core::{AgentOutput, RunStatus, StageStatus};
use crate::definition::{LoadedPipeline, StageDefinition, Variables};
use crate::errors::{ConfigError, EngineError, QueueError, QuotaExceeded};
use crate::events::{names, noop_sink, SharedEventSink};
use crate::limits::{Budgets, QuotaLevel};
use crate::manifest::{manifest_path, ErrorRecord, ManifestStore, RunManifest};
use crate::queue::{BackoffPolicy, JobHandle, JobOptions, JobOutcome, JobQueues};
use crate::worker::{ProcessorRegistry, Services, WorkerPool, WorkerPoolConfig};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Run topic, exposed to stages and conditions.
    pub topic: String,
    /// Run id; a UUID is generated when unset.
    pub run_id: Option<String>,
    /// Variables exposed as `vars.*`.
    pub variables: Variables,
    /// Whether `cache: true` stages may be served from the cache.
    pub use_cache: bool,
    /// Concurrency for every queue, overriding `settings.parallel`.
    pub parallel: Option<usize>,
    /// Manifest location; defaults to `<manifest_dir>/<run_id>.json`.
    pub manifest_path: Option<PathBuf>,
    /// Stops dispatch of further batches when cancelled.
    pub cancellation: Option<Arc<CancellationToken>>,
}

impl RunRequest {
    /// Creates a request for a topic.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            run_id: None,
            variables: Variables::new(),
            use_cache: true,
            parallel: None,
            manifest_path: None,
            cancellation: None,
        }
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
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

    /// Disables cache lookups and stores.
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Sets one concurrency for every queue.
    #[must_use]
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = Some(parallel.max(1));
        self
    }

    /// Sets the manifest path.
    #[must_use]
    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Runs pipelines batch by batch through job queues.
///
/// Every stage of a batch is enqueued at once and the orchestrator waits
/// for all of their jobs before looking at the next batch. Retries happen
/// inside the queues; the orchestrator only sees terminal outcomes.
///
/// # Example
///
/// ```rust,ignore
/// let registry = ProcessorRegistry::new().with("echo", EchoProcessor);
/// let orchestrator = Orchestrator::new(registry).with_manifest_dir("runs");
/// let result = orchestrator.run(&pipeline, RunRequest::new("rust")).await?;
/// ```
pub struct Orchestrator {
    registry: Arc<ProcessorRegistry>,
    services: Services,
    sink: SharedEventSink,
    approver: Arc<dyn StageApprover>,
    manifest_dir: PathBuf,
    budgets: Budgets,
    pool_config: WorkerPoolConfig,
    cache_ttl: Option<Duration>,
}

impl Orchestrator {
    /// Creates an orchestrator with default services and settings.
    #[must_use]
    pub fn new(registry: ProcessorRegistry) -> Self {
        let defaults = EngineConfig::default();
        let pool_config = WorkerPoolConfig::new(defaults.workers_per_queue)
            .with_shutdown_timeout(defaults.shutdown_timeout());
        let cache_ttl = defaults.cache.ttl();
        Self {
            registry: Arc::new(registry),
            services: Services::default(),
            sink: noop_sink(),
            approver: Arc::new(AutoApprover),
            manifest_dir: defaults.manifest_dir,
            budgets: defaults.budgets,
            pool_config,
            cache_ttl,
        }
    }

    /// Creates an orchestrator from engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configured services cannot be built.
    pub fn from_config(registry: ProcessorRegistry, config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            registry: Arc::new(registry),
            services: config.services()?,
            sink: noop_sink(),
            approver: Arc::new(AutoApprover),
            manifest_dir: config.manifest_dir.clone(),
            budgets: config.budgets,
            pool_config: WorkerPoolConfig::new(config.workers_per_queue)
                .with_shutdown_timeout(config.shutdown_timeout()),
            cache_ttl: config.cache.ttl(),
        })
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

    /// Sets the approver for manual stages.
    #[must_use]
    pub fn with_approver(mut self, approver: Arc<dyn StageApprover>) -> Self {
        self.approver = approver;
        self
    }

    /// Sets the manifest directory.
    #[must_use]
    pub fn with_manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = dir.into();
        self
    }

    /// Sets the spend ceilings checked between batches.
    #[must_use]
    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Sets worker pool sizing.
    #[must_use]
    pub fn with_pool_config(mut self, config: WorkerPoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Sets the lifetime of cache entries written by runs.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Shared services.
    #[must_use]
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Registered processors.
    #[must_use]
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Runs a pipeline to completion.
    ///
    /// A failed required stage, failed required gate or unmet success
    /// criterion ends the run with [`RunStatus::Failed`] and is returned as
    /// `Ok`. Fatal conditions are returned as `Err` after the manifest has
    /// been marked aborted.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Config`] if a stage names an unregistered agent
    /// - [`EngineError::BudgetExceeded`] if spend reached a ceiling
    /// - [`EngineError::QuotaExceeded`] if a service quota would block too long
    /// - [`EngineError::Cancelled`] if the request's token was cancelled
    /// - [`EngineError::ManifestIo`] if the manifest cannot be written
    pub async fn run(&self, pipeline: &LoadedPipeline, request: RunRequest) -> Result<RunResult, EngineError> {
        self.check_agents(pipeline)?;

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
            RunManifest::new(&request.topic, &run_id, pipeline.name()),
        )
        .await?;

        let mut meta = Map::new();
        meta.insert("pipeline".into(), json!(pipeline.name()));
        meta.insert("topic".into(), json!(request.topic));
        self.services.cost_tracker.start_session(&run_id, meta);

        let queues = Arc::new(JobQueues::new(Arc::clone(&self.sink)));
        for (name, concurrency) in pipeline.plan.queues() {
            queues.declare(name, request.parallel.unwrap_or(*concurrency).max(1));
        }
        let mut pool = WorkerPool::new(
            self.pool_config.clone(),
            Arc::clone(&queues),
            Arc::clone(&self.registry),
            self.services.clone(),
        );
        pool.start()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        info!(
            run_id = %run_id,
            pipeline = %pipeline.name(),
            topic = %request.topic,
            stages = pipeline.plan.stage_count(),
            batches = pipeline.plan.batch_count(),
            "Run started"
        );

        let mut run = Run {
            orchestrator: self,
            pipeline,
            request: &request,
            notifier: Notifier::new(
                pipeline.definition.notifications.clone(),
                Arc::clone(&self.sink),
            ),
            scope: RunScope::new(&request.topic, &run_id, request.variables.clone()),
            run_id,
            store,
            queues,
            outcomes: BTreeMap::new(),
            gates: Vec::new(),
        };

        run.announce(names::RUN_STARTED, None, None).await;
        let started = Instant::now();
        let executed = run.execute().await;

        if let Err(e) = pool.shutdown().await {
            warn!(error = %e, "Worker pool did not shut down cleanly");
        }
        let spending = self.services.cost_tracker.end_session();
        let result = run.finish(executed, spending).await;

        match result {
            Ok(ref result) => info!(
                run_id = %result.run_id,
                status = %result.status,
                duration_ms = started.elapsed().as_millis() as u64,
                "Run finished"
            ),
            Err(ref e) => error!(error = %e, duration_ms = started.elapsed().as_millis() as u64, "Run aborted"),
        }
        result
    }

    fn check_agents(&self, pipeline: &LoadedPipeline) -> Result<(), ConfigError> {
        for stage in &pipeline.definition.stages {
            if !self.registry.contains(&stage.agent) {
                return Err(ConfigError::UnknownAgent {
                    owner: format!("Stage '{}'", stage.id),
                    agent: stage.agent.clone(),
                });
            }
        }
        for gate in &pipeline.definition.quality_gates {
            if let Some(ref agent) = gate.check {
                if !self.registry.contains(agent) {
                    return Err(ConfigError::UnknownAgent {
                        owner: format!("Quality gate '{}'", gate.name),
                        agent: agent.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.registry.names())
            .field("manifest_dir", &self.manifest_dir)
            .field("budgets", &self.budgets)
            .finish_non_exhaustive()
    }
}

/// Why a run stopped dispatching.
struct Halt {
    stage: String,
    reason: String,
}

/// A stage whose jobs are in flight.
struct Dispatch {
    stage: StageDefinition,
    cache_key: Option<String>,
    handles: Vec<JobHandle>,
}

enum Prepared {
    Dispatched(Dispatch),
    /// Resolved without jobs; `true` if the run must stop.
    Settled(bool),
}

/// State of one run in progress.
struct Run<'a> {
    orchestrator: &'a Orchestrator,
    pipeline: &'a LoadedPipeline,
    request: &'a RunRequest,
    run_id: String,
    store: ManifestStore,
    queues: Arc<JobQueues>,
    notifier: Notifier,
    scope: RunScope,
    outcomes: BTreeMap<String, StageOutcome>,
    gates: Vec<GateResult>,
}

impl Run<'_> {
    fn check_continue(&self) -> Result<(), EngineError> {
        if let Some(ref token) = self.request.cancellation {
            token.check()?;
        }
        self.orchestrator
            .services
            .cost_tracker
            .check_budget(&self.orchestrator.budgets)?;
        Ok(())
    }

    async fn execute(&mut self) -> Result<Option<Halt>, EngineError> {
        let pipeline = self.pipeline;
        for (index, batch) in pipeline.plan.batches().iter().enumerate() {
            self.check_continue()?;
            debug!(
                run_id = %self.run_id,
                batch = index,
                stages = batch.len(),
                "Dispatching batch"
            );

            let mut halt: Option<Halt> = None;
            let mut fatal: Option<EngineError> = None;
            let mut dispatches = Vec::new();
            for stage in batch {
                match self.prepare(stage).await {
                    Ok(Prepared::Dispatched(dispatch)) => dispatches.push(dispatch),
                    Ok(Prepared::Settled(true)) => {
                        halt.get_or_insert_with(|| Halt {
                            stage: stage.id.clone(),
                            reason: self.failure_reason(&stage.id),
                        });
                    }
                    Ok(Prepared::Settled(false)) => {}
                    Err(e) => {
                        // Jobs already enqueued for this batch still run to completion.
                        warn!(
                            stage = %stage.id,
                            error = %e,
                            in_flight = dispatches.len(),
                            "Run aborting; settling dispatched stages first"
                        );
                        fatal = Some(e);
                        break;
                    }
                }
            }

            let handle_sets: Vec<Vec<JobHandle>> = dispatches
                .iter_mut()
                .map(|d| std::mem::take(&mut d.handles))
                .collect();
            let settled = join_all(
                handle_sets
                    .into_iter()
                    .map(|handles| join_all(handles.into_iter().map(JobHandle::await_result))),
            )
            .await;

            for (dispatch, results) in dispatches.into_iter().zip(settled) {
                let id = dispatch.stage.id.clone();
                match self.settle(dispatch, results).await {
                    Ok(true) => {
                        halt.get_or_insert_with(|| Halt {
                            reason: self.failure_reason(&id),
                            stage: id,
                        });
                    }
                    Ok(false) => {}
                    Err(e) => {
                        fatal.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = fatal {
                return Err(e);
            }

            if let Some(gate_halt) = self.run_gates(batch).await? {
                halt.get_or_insert(gate_halt);
            }

            if halt.is_some() {
                return Ok(halt);
            }
        }
        Ok(None)
    }

    fn failure_reason(&self, stage: &str) -> String {
        self.outcomes
            .get(stage)
            .and_then(|o| o.error.clone())
            .unwrap_or_else(|| "stage failed".to_string())
    }

    async fn prepare(&mut self, stage: &StageDefinition) -> Result<Prepared, EngineError> {
        let id = stage.id.clone();

        if let Some(condition) = self.pipeline.condition_for(&id) {
            if !condition.evaluate(&self.scope.to_value()) {
                info!(stage = %id, condition = %condition, "Stage skipped");
                self.store.update(|m| m.record_skip(id.clone())).await?;
                self.scope.record(&id, StageStatus::Skipped, None);
                self.outcomes
                    .insert(id.clone(), StageOutcome::without_jobs(&id, StageStatus::Skipped));
                self.emit(names::STAGE_SKIPPED, json!({"stage": id})).await;
                return Ok(Prepared::Settled(false));
            }
        }

        if stage.manual {
            let request = ApprovalRequest {
                run_id: self.run_id.clone(),
                stage: id.clone(),
                agent: stage.agent.clone(),
            };
            if let ApprovalDecision::Denied(reason) = self.orchestrator.approver.approve(request).await {
                return self.fail_unrun(stage, "approval", reason).await;
            }
        }

        let pipeline = self.pipeline;
        let settings = &pipeline.definition.settings;
        let queue_name = stage.queue_name(settings).to_string();
        if let Some(ref service) = stage.service {
            self.apply_quota(service, &queue_name).await?;
        }

        let payloads = match stage.foreach {
            Some(ref selector) => match self.scope.fan_out(stage, selector) {
                Ok(payloads) => payloads,
                Err(reason) => return self.fail_unrun(stage, "foreach", reason).await,
            },
            None => vec![self.scope.payload_for(stage)],
        };

        let key = if stage.cache && self.request.use_cache {
            let input = if stage.foreach.is_some() {
                Value::Array(payloads.clone())
            } else {
                payloads.first().cloned().unwrap_or(Value::Null)
            };
            Some(cache_key(&id, &cache_input(&input)))
        } else {
            None
        };

        if let Some(ref key) = key {
            if let Some(entry) = self.orchestrator.services.cache.get(key).await {
                info!(stage = %id, cache_key = %key, "Stage served from cache");
                self.store
                    .update(|m| {
                        m.set_stage_status(&id, StageStatus::Cached);
                        m.record_step(id.clone());
                    })
                    .await?;
                self.scope
                    .record(&id, StageStatus::Cached, Some(entry.output.clone()));
                self.outcomes.insert(
                    id.clone(),
                    StageOutcome::without_jobs(&id, StageStatus::Cached).with_output(entry.output),
                );
                self.emit(names::STAGE_CACHED, json!({"stage": id, "cache_key": key}))
                    .await;
                return Ok(Prepared::Settled(false));
            }
        }

        let options = JobOptions::default()
            .with_max_attempts(stage.effective_max_attempts(settings))
            .with_timeout(stage.effective_timeout(settings))
            .with_backoff(BackoffPolicy::from(&settings.backoff))
            .with_priority(stage.priority)
            .for_stage(&id);

        self.store
            .update(|m| m.set_stage_status(&id, StageStatus::Running))
            .await?;
        let mut handles = Vec::with_capacity(payloads.len());
        for payload in payloads {
            handles.push(
                self.queues
                    .enqueue(&queue_name, &stage.agent, payload, options.clone())?,
            );
        }
        info!(
            stage = %id,
            agent = %stage.agent,
            queue = %queue_name,
            jobs = handles.len(),
            "Stage dispatched"
        );
        self.emit(
            names::STAGE_STARTED,
            json!({"stage": id, "agent": stage.agent, "jobs": handles.len()}),
        )
        .await;

        Ok(Prepared::Dispatched(Dispatch {
            stage: stage.clone(),
            cache_key: key,
            handles,
        }))
    }

    async fn apply_quota(&self, service: &str, queue_name: &str) -> Result<(), EngineError> {
        let decision = self.orchestrator.services.rate_limiter.check(service);
        let max_wait = self.pipeline.definition.settings.quota_max_wait_ms;

        match decision.level {
            QuotaLevel::Exhausted if decision.retry_after_ms > max_wait => {
                Err(QuotaExceeded {
                    service: service.to_string(),
                    retry_after_ms: decision.retry_after_ms,
                }
                .into())
            }
            QuotaLevel::Critical | QuotaLevel::Exhausted if decision.retry_after_ms > 0 => {
                warn!(
                    service = %service,
                    queue = %queue_name,
                    level = %decision.level,
                    delay_ms = decision.retry_after_ms,
                    "Service quota nearly used up; pausing queue"
                );
                if let Some(queue) = self.queues.get(queue_name) {
                    queue.pause_for(Duration::from_millis(decision.retry_after_ms));
                }
                self.emit(
                    names::QUOTA_THROTTLED,
                    json!({
                        "service": service,
                        "queue": queue_name,
                        "level": decision.level,
                        "retry_after_ms": decision.retry_after_ms,
                    }),
                )
                .await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Fails a stage that never reached a queue.
    async fn fail_unrun(
        &mut self,
        stage: &StageDefinition,
        kind: &str,
        reason: String,
    ) -> Result<Prepared, EngineError> {
        let id = stage.id.clone();
        self.store
            .update(|m| {
                m.record_error(ErrorRecord::new(&id, 0, kind, reason.clone()));
                m.set_stage_status(&id, StageStatus::Failed);
            })
            .await?;
        self.scope.record(&id, StageStatus::Failed, None);
        self.outcomes.insert(
            id.clone(),
            StageOutcome::without_jobs(&id, StageStatus::Failed).with_error(reason.clone()),
        );
        self.stage_failed(stage, &reason).await;
        Ok(Prepared::Settled(stage.aborts_on_failure()))
    }

    /// Records a dispatched stage's job outcomes. Returns true if the run must stop.
    async fn settle(
        &mut self,
        dispatch: Dispatch,
        results: Vec<Result<JobOutcome, QueueError>>,
    ) -> Result<bool, EngineError> {
        let stage = dispatch.stage;
        let id = stage.id.clone();
        let jobs = results.len();

        let mut attempts = 0u32;
        let mut errors = Vec::new();
        let mut outputs = Vec::with_capacity(jobs);
        let mut failure: Option<String> = None;

        for result in results {
            match result {
                Ok(outcome) => {
                    attempts = attempts.saturating_add(outcome.attempts);
                    errors.extend(
                        outcome
                            .history
                            .iter()
                            .map(|record| ErrorRecord::from_attempt(&id, record)),
                    );
                    if let Some(reason) = outcome.failure_reason() {
                        if outcome.result.is_ok() {
                            errors.push(ErrorRecord::new(&id, outcome.attempts, "output", reason.clone()));
                        }
                        failure.get_or_insert(reason);
                    }
                    if let Ok(output) = outcome.result {
                        outputs.push(output);
                    }
                }
                Err(e) => {
                    errors.push(ErrorRecord::new(&id, 0, "queue", e.to_string()));
                    failure.get_or_insert(e.to_string());
                }
            }
        }

        let status = if failure.is_none() {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        let output = combine_outputs(outputs, stage.foreach.is_some());

        self.store
            .update(|m| {
                for error in errors {
                    m.record_error(error);
                }
                m.add_attempts(&id, attempts);
                m.set_stage_status(&id, status);
                if status == StageStatus::Completed {
                    m.record_step(id.clone());
                }
            })
            .await?;
        self.scope.record(&id, status, output.clone());
        self.outcomes.insert(
            id.clone(),
            StageOutcome {
                stage: id.clone(),
                status,
                attempts,
                jobs,
                output: output.clone(),
                error: failure.clone(),
            },
        );

        match failure {
            None => {
                info!(stage = %id, attempts, jobs, "Stage completed");
                if let (Some(key), Some(output)) = (dispatch.cache_key, output) {
                    self.store_in_cache(&id, &key, output).await;
                }
                self.emit(names::STAGE_COMPLETED, json!({"stage": id, "attempts": attempts}))
                    .await;
                self.notify(names::STAGE_COMPLETED, Some(&id), None).await;
                Ok(false)
            }
            Some(reason) => {
                self.stage_failed(&stage, &reason).await;
                Ok(stage.aborts_on_failure())
            }
        }
    }

    async fn store_in_cache(&self, stage: &str, key: &str, output: AgentOutput) {
        let mut entry = CachedEntry::new(stage, output);
        if let Some(ttl) = self.orchestrator.cache_ttl {
            entry = entry.with_ttl(ttl);
        }
        if let Err(e) = self.orchestrator.services.cache.set(key, entry).await {
            warn!(stage = %stage, cache_key = %key, error = %e, "Failed to cache stage result");
        }
    }

    async fn stage_failed(&self, stage: &StageDefinition, reason: &str) {
        if stage.aborts_on_failure() {
            error!(stage = %stage.id, error = %reason, "Required stage failed");
        } else {
            warn!(stage = %stage.id, error = %reason, "Optional stage failed; continuing");
        }
        self.emit(
            names::STAGE_FAILED,
            json!({"stage": stage.id, "error": reason, "required": stage.aborts_on_failure()}),
        )
        .await;
        self.notify(names::STAGE_FAILED, Some(&stage.id), Some(reason))
            .await;
    }

    /// Runs the gates bound to successful stages of this batch.
    async fn run_gates(&mut self, batch: &[StageDefinition]) -> Result<Option<Halt>, EngineError> {
        let pipeline = self.pipeline;
        let mut halt = None;
        for gate in &pipeline.definition.quality_gates {
            if !batch.iter().any(|s| s.id == gate.after) || !self.scope.status(&gate.after).is_success() {
                continue;
            }

            let result = evaluate_gate(
                gate,
                pipeline,
                &self.scope,
                &self.orchestrator.registry,
                &self.orchestrator.services,
            )
            .await;
            let qa = result.to_qa();
            let failed_required = !result.passed && result.required;
            let reason = format!("quality gate '{}' failed", gate.name);

            self.store
                .update(|m| {
                    m.set_qa(&gate.name, qa);
                    if !result.passed {
                        m.record_error(ErrorRecord::new(&gate.after, 1, "gate", reason.clone()));
                    }
                    if failed_required {
                        m.set_stage_status(&gate.after, StageStatus::Failed);
                    }
                })
                .await?;

            let event = if result.passed {
                names::GATE_PASSED
            } else {
                names::GATE_FAILED
            };
            self.emit(event, json!({"gate": gate.name, "after": gate.after}))
                .await;

            if failed_required {
                let output = self.scope.output(&gate.after).cloned();
                self.scope.record(&gate.after, StageStatus::Failed, output);
                if let Some(outcome) = self.outcomes.get_mut(&gate.after) {
                    outcome.status = StageStatus::Failed;
                    outcome.error = Some(reason.clone());
                }
                self.notify(names::STAGE_FAILED, Some(&gate.after), Some(&reason))
                    .await;
                halt.get_or_insert(Halt {
                    stage: gate.after.clone(),
                    reason,
                });
            }
            self.gates.push(result);
        }
        Ok(halt)
    }

    async fn finish(
        self,
        executed: Result<Option<Halt>, EngineError>,
        spending: Option<crate::limits::SessionSummary>,
    ) -> Result<RunResult, EngineError> {
        let halt = match executed {
            Ok(halt) => halt,
            Err(e) => {
                let reason = e.to_string();
                let update = self
                    .store
                    .update(|m| {
                        m.halt(None, reason.clone());
                        m.finish(RunStatus::Aborted);
                    })
                    .await;
                if let Err(write_err) = update {
                    warn!(error = %write_err, "Failed to record aborted run");
                }
                self.emit(names::RUN_FAILED, json!({"run_id": self.run_id, "error": reason}))
                    .await;
                self.notify(names::RUN_FAILED, None, Some(&reason)).await;
                return Err(e);
            }
        };

        let statuses: BTreeMap<String, StageStatus> = self
            .outcomes
            .iter()
            .map(|(id, o)| (id.clone(), o.status))
            .collect();
        let unmet = check_success_criteria(&self.pipeline.definition.success_criteria, &statuses);
        let status = if halt.is_none() && unmet.is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        let halt_reason = halt.as_ref().map(|h| h.reason.clone());
        let manifest = self
            .store
            .update(|m| {
                match halt {
                    Some(halt) => m.halt(Some(halt.stage), halt.reason),
                    None if !unmet.is_empty() => {
                        m.halt(None, format!("success criteria not met: {}", unmet.join("; ")));
                    }
                    None => {}
                }
                m.finish(status);
                m.clone()
            })
            .await?;

        if status == RunStatus::Succeeded {
            self.emit(names::RUN_COMPLETED, json!({"run_id": self.run_id}))
                .await;
            self.notify(names::RUN_COMPLETED, None, None).await;
        } else {
            let reason = halt_reason.unwrap_or_else(|| unmet.join("; "));
            self.emit(names::RUN_FAILED, json!({"run_id": self.run_id, "error": reason}))
                .await;
            self.notify(names::RUN_FAILED, None, Some(&reason)).await;
        }

        Ok(RunResult {
            run_id: self.run_id,
            status,
            manifest_path: self.store.path().to_path_buf(),
            manifest,
            stages: self.outcomes,
            gates: self.gates,
            unmet_criteria: unmet,
            spending,
        })
    }

    async fn emit(&self, event: &str, data: Value) {
        self.orchestrator.sink.emit(event, Some(data)).await;
    }

    async fn announce(&self, event: &str, stage: Option<&str>, error: Option<&str>) {
        self.emit(event, json!({"run_id": self.run_id, "pipeline": self.pipeline.name()}))
            .await;
        self.notify(event, stage, error).await;
    }

    async fn notify(&self, event: &str, stage: Option<&str>, error: Option<&str>) {
        self.notifier
            .notify(&Notification {
                event: event.to_string(),
                run_id: self.run_id.clone(),
                topic: self.request.topic.clone(),
                pipeline: self.pipeline.name().to_string(),
                stage: stage.map(str::to_string),
                error: error.map(str::to_string),
            })
            .await;
    }
}

/// A single job's output is the stage output. A fan-out stage gets
/// `{success, items: [...]}` with one entry per job in element order.
fn combine_outputs(mut outputs: Vec<AgentOutput>, fan_out: bool) -> Option<AgentOutput> {
    if !fan_out {
        return outputs.pop();
    }
    let success = outputs.iter().all(|o| o.success);
    let items: Vec<Value> = outputs.iter().map(AgentOutput::to_value).collect();
    let mut combined = AgentOutput::ok_value("items", Value::Array(items));
    combined.success = success;
    Some(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{PipelineDefinition, QualityGate};
    use crate::events::CollectingEventSink;
    use crate::orchestrator::approval::MockStageApprover;
    use crate::testing::{FailingProcessor, RecordingProcessor};

    fn loaded(definition: PipelineDefinition) -> LoadedPipeline {
        LoadedPipeline::from_definition(definition).unwrap()
    }

    #[test]
    fn test_combine_outputs() {
        let single = combine_outputs(vec![AgentOutput::ok_value("a", json!(1))], false).unwrap();
        assert_eq!(single.get("a"), Some(&json!(1)));

        let fanned = combine_outputs(
            vec![AgentOutput::ok(), AgentOutput::failed("bad")],
            true,
        )
        .unwrap();
        assert!(!fanned.success);
        assert_eq!(fanned.get("items").and_then(Value::as_array).map(Vec::len), Some(2));

        assert!(combine_outputs(Vec::new(), true).unwrap().success);
        assert!(combine_outputs(Vec::new(), false).is_none());
    }

    #[tokio::test]
    async fn test_unknown_agent_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = loaded(
            PipelineDefinition::new("p").with_stage(StageDefinition::new("a", "missing")),
        );
        let orchestrator = Orchestrator::new(ProcessorRegistry::new()).with_manifest_dir(dir.path());

        let err = orchestrator
            .run(&pipeline, RunRequest::new("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::UnknownAgent { .. })));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_denied_manual_stage_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = loaded(
            PipelineDefinition::new("p")
                .with_stage(StageDefinition::new("draft", "echo"))
                .with_stage(StageDefinition::new("publish", "echo").depends_on("draft").manual()),
        );
        let mut approver = MockStageApprover::new();
        approver
            .expect_approve()
            .withf(|req| req.stage == "publish")
            .times(1)
            .returning(|_| ApprovalDecision::Denied("not today".into()));
        let echo = RecordingProcessor::new();
        let orchestrator = Orchestrator::new(ProcessorRegistry::new().with("echo", echo.clone()))
            .with_manifest_dir(dir.path())
            .with_approver(Arc::new(approver));

        let result = orchestrator
            .run(&pipeline, RunRequest::new("t").with_run_id("r1"))
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.stage_status("publish"), StageStatus::Failed);
        assert_eq!(echo.calls_for("publish").len(), 0);
        let halt = result.manifest.halted_by.unwrap();
        assert_eq!(halt.stage.as_deref(), Some("publish"));
        assert_eq!(halt.reason, "not today");
        assert_eq!(result.manifest.errors[0].kind, "approval");
    }

    #[tokio::test]
    async fn test_required_gate_failure_halts() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = loaded(
            PipelineDefinition::new("p")
                .with_stage(StageDefinition::new("write", "echo"))
                .with_stage(StageDefinition::new("format", "echo").depends_on("write"))
                .with_gate(QualityGate::condition(
                    "length",
                    "write",
                    "stages.write.output.words > 100",
                )),
        );
        let echo = RecordingProcessor::new();
        let sink = Arc::new(CollectingEventSink::new());
        let orchestrator = Orchestrator::new(ProcessorRegistry::new().with("echo", echo.clone()))
            .with_manifest_dir(dir.path())
            .with_event_sink(sink.clone());

        let result = orchestrator.run(&pipeline, RunRequest::new("t")).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.stage_status("write"), StageStatus::Failed);
        assert!(result.stage("format").is_none());
        assert_eq!(result.manifest.qa["length"]["passed"], json!(false));
        assert_eq!(sink.count(names::GATE_FAILED), 1);
        assert_eq!(sink.count(names::RUN_FAILED), 1);
    }

    #[tokio::test]
    async fn test_optional_gate_failure_is_recorded_only() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = loaded(
            PipelineDefinition::new("p")
                .with_stage(StageDefinition::new("write", "echo"))
                .with_gate(QualityGate::check("style", "write", "linter").optional()),
        );
        let registry = ProcessorRegistry::new()
            .with("echo", RecordingProcessor::new())
            .with("linter", FailingProcessor::new("passive voice").soft());
        let orchestrator = Orchestrator::new(registry).with_manifest_dir(dir.path());

        let result = orchestrator.run(&pipeline, RunRequest::new("t")).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.gates.len(), 1);
        assert!(!result.gates[0].passed);
        assert_eq!(result.manifest.errors_for("write").count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = loaded(PipelineDefinition::new("p").with_stage(StageDefinition::new("a", "echo")));
        let echo = RecordingProcessor::new();
        let orchestrator = Orchestrator::new(ProcessorRegistry::new().with("echo", echo.clone()))
            .with_manifest_dir(dir.path());
        let token = Arc::new(CancellationToken::new());
        token.cancel("user abort");

        let err = orchestrator
            .run(
                &pipeline,
                RunRequest::new("t").with_run_id("r1").with_cancellation(token),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled(ref r) if r == "user abort"));
        assert_eq!(echo.call_count(), 0);
        let manifest = crate::manifest::load(&dir.path().join("r1.json")).await.unwrap();
        assert_eq!(manifest.status, RunStatus::Aborted);
        assert!(!manifest.is_final);
    }

    #[tokio::test]
    async fn test_quota_beyond_max_wait_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut definition = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("search", "echo").with_service("search"));
        definition.settings.quota_max_wait_ms = 0;
        let pipeline = loaded(definition);

        let services = Services::default();
        services
            .rate_limiter
            .set_limits("search", crate::limits::ServiceLimits::default().per_day(1));
        services.rate_limiter.record_call("search");

        let orchestrator = Orchestrator::new(ProcessorRegistry::new().with("echo", RecordingProcessor::new()))
            .with_manifest_dir(dir.path())
            .with_services(services);

        let err = orchestrator.run(&pipeline, RunRequest::new("t")).await.unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded(ref q) if q.service == "search"));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_success_criteria_fail_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut definition = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("a", "echo"))
            .with_stage(StageDefinition::new("b", "echo").with_condition("vars.enabled"));
        definition.success_criteria.min_completed = Some(2);
        let pipeline = loaded(definition);
        let orchestrator = Orchestrator::new(ProcessorRegistry::new().with("echo", RecordingProcessor::new()))
            .with_manifest_dir(dir.path());

        let result = orchestrator.run(&pipeline, RunRequest::new("t")).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.stage_status("b"), StageStatus::Skipped);
        assert_eq!(result.unmet_criteria.len(), 1);
        assert!(result.manifest.halted_by.unwrap().reason.contains("success criteria"));
    }
}
