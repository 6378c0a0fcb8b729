//! Worker pool executing jobs from a [`JobQueues`] set.
//!
//! Each declared queue gets `workers_per_queue` workers, each running as
//! many slots as the queue's concurrency (or `slots_per_worker`, if larger).
//! A slot is one task: it leases a job, runs the registered processor under the
//! job's timeout and reports the result back through the lease, then
//! immediately asks for the next job. The queue's own semaphore still caps
//! how many of those tasks run a job at once.

use super::processor::{ProcessorContext, Services};
use super::registry::ProcessorRegistry;
use crate::errors::{AgentError, TimeoutError};
use crate::queue::{JobError, JobQueue, JobQueues, Lease};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Worker pool failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// [`WorkerPool::start`] was called twice.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// [`WorkerPool::shutdown`] was called on a stopped pool.
    #[error("Pool is not running")]
    NotRunning,

    /// Workers did not finish in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Worker pool sizing.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker tasks per queue.
    pub workers_per_queue: usize,
    /// Minimum concurrent job slots per worker; a queue declared with a
    /// higher concurrency gets that many slots instead.
    pub slots_per_worker: usize,
    /// Time allowed for in-flight jobs to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers_per_queue: 1,
            slots_per_worker: 1,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a config with `workers` workers per queue.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers_per_queue: workers.max(1),
            ..Default::default()
        }
    }

    /// Sets the slots per worker.
    #[must_use]
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots_per_worker = slots.max(1);
        self
    }

    /// Sets the shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker tasks spawned.
    pub workers: usize,
    /// Workers currently running a job.
    pub active: u64,
    /// Attempts that produced an output.
    pub completed: u64,
    /// Attempts that failed or timed out.
    pub failed: u64,
    /// Mean attempt duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Completed plus failed attempts.
    #[must_use]
    pub fn total_processed(&self) -> u64 {
        self.completed + self.failed
    }
}

#[derive(Default)]
struct SharedPoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, succeeded: bool, duration: Duration) {
        if succeeded {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms.fetch_add(
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
    }

    fn snapshot(&self, workers: usize) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total = completed + failed;
        let average_duration = if total == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total)
        };
        PoolStats {
            workers,
            active: self.active.load(Ordering::SeqCst),
            completed,
            failed,
            average_duration,
        }
    }
}

/// Runs processors for every queue of a [`JobQueues`] set.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queues: Arc<JobQueues>,
    registry: Arc<ProcessorRegistry>,
    services: Services,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    worker_count: usize,
    stats: Arc<SharedPoolStats>,
    running: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("workers", &self.worker_count)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a stopped pool.
    #[must_use]
    pub fn new(
        config: WorkerPoolConfig,
        queues: Arc<JobQueues>,
        registry: Arc<ProcessorRegistry>,
        services: Services,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            queues,
            registry,
            services,
            shutdown_tx,
            handles: Vec::new(),
            worker_count: 0,
            stats: Arc::new(SharedPoolStats::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawns workers for every queue declared so far.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadyRunning`] if already started.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let workers = self.config.workers_per_queue.max(1);
        for queue in self.queues.all() {
            let slots = queue.concurrency().max(self.config.slots_per_worker).max(1);
            for i in 0..workers * slots {
                let worker = Worker {
                    id: format!("{}-{i}", queue.name()),
                    queue: Arc::clone(&queue),
                    registry: Arc::clone(&self.registry),
                    services: self.services.clone(),
                    stats: Arc::clone(&self.stats),
                    shutdown: self.shutdown_tx.subscribe(),
                };
                self.handles.push(tokio::spawn(worker.run()));
            }
        }

        self.worker_count = self.handles.len();
        info!(
            queues = self.queues.all().len(),
            workers = self.worker_count,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stops intake, lets in-flight jobs finish and joins the workers.
    ///
    /// Waiting jobs are failed with [`JobError::Shutdown`].
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotRunning`] if the pool was not started and
    /// [`PoolError::ShutdownTimeout`] if workers outlive the timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        info!("Initiating worker pool shutdown");

        self.queues.close_all();
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.handles.drain(..).collect();
        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        if tokio::time::timeout(self.config.shutdown_timeout, join_all)
            .await
            .is_err()
        {
            warn!(
                timeout_ms = u64::try_from(self.config.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
                "Worker pool shutdown timed out"
            );
            return Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout));
        }
        info!("Worker pool shutdown complete");
        Ok(())
    }

    /// Returns true between [`WorkerPool::start`] and [`WorkerPool::shutdown`].
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.worker_count)
    }
}

struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    registry: Arc<ProcessorRegistry>,
    services: Services,
    stats: Arc<SharedPoolStats>,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");
        loop {
            let lease = tokio::select! {
                _ = self.shutdown.recv() => break,
                lease = self.queue.next_job() => lease,
            };
            let Some(lease) = lease else { break };
            self.process(lease).await;
        }
        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, lease: Lease) {
        let job = lease.job().clone();
        let job_id = job.id;
        let agent = job.agent;
        let timeout = job.timeout;
        let attempt = job.attempts;

        let Some(processor) = self.registry.get(&agent) else {
            warn!(worker_id = %self.id, job_id = %job_id, agent = %agent, "No processor registered");
            self.stats.record(false, Duration::ZERO);
            lease.fail(JobError::Agent(AgentError::permanent(format!(
                "No processor registered for agent '{agent}'"
            ))));
            return;
        };

        let ctx = ProcessorContext::for_job(
            job_id.clone(),
            self.queue.name(),
            job.stage,
            attempt,
            self.services.clone(),
            lease.progress_reporter(),
        );
        let payload = job.payload;

        debug!(
            worker_id = %self.id,
            job_id = %job_id,
            agent = %agent,
            attempt,
            "Processing job"
        );
        self.stats.active.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        // The task is detached on timeout and left to finish on its own.
        let task = tokio::spawn(async move { processor.execute(payload, ctx).await });
        let result = tokio::time::timeout(timeout, task).await;

        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(Ok(output))) => {
                self.stats.record(output.success, elapsed);
                lease.complete(output);
            }
            Ok(Ok(Err(e))) => {
                self.stats.record(false, elapsed);
                lease.fail(JobError::Agent(e));
            }
            Ok(Err(join_error)) => {
                error!(worker_id = %self.id, job_id = %job_id, error = %join_error, "Processor panicked");
                self.stats.record(false, elapsed);
                lease.fail(JobError::Agent(AgentError::permanent(format!(
                    "Processor for '{agent}' panicked: {join_error}"
                ))));
            }
            Err(_) => {
                let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(worker_id = %self.id, job_id = %job_id, after_ms, "Job timed out");
                self.stats.record(false, elapsed);
                lease.fail(JobError::Timeout(TimeoutError { job_id, after_ms }));
            }
        }
    }
}
