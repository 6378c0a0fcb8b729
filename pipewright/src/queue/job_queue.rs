//! A single named queue with bounded concurrency.

use super::events::QueueEvent;
use super::job::{AttemptRecord, Job, JobError, JobOutcome};
use crate::core::AgentOutput;
use crate::errors::QueueError;
use crate::events::SharedEventSink;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Responder = oneshot::Sender<JobOutcome>;

struct QueuedJob {
    job: Job,
    responder: Responder,
    seq: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job.priority == other.job.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap: higher priority first, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    waiting: BinaryHeap<QueuedJob>,
    paused: bool,
    resume_at: Option<Instant>,
    closed: bool,
}

impl QueueState {
    fn is_paused(&self) -> bool {
        self.paused || self.resume_at.is_some_and(|t| Instant::now() < t)
    }
}

/// Counts of jobs by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs waiting to be picked up.
    pub waiting: usize,
    /// Jobs being executed.
    pub active: usize,
    /// Jobs sleeping out a backoff delay.
    pub delayed: usize,
    /// Jobs that produced a result.
    pub completed: u64,
    /// Jobs that failed terminally.
    pub failed: u64,
    /// Attempts that were scheduled for retry.
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    delayed: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// A named job queue.
///
/// At most `concurrency` jobs are active at once. Waiting jobs are handed
/// out by priority, FIFO within equal priority.
pub struct JobQueue {
    name: String,
    concurrency: usize,
    state: Mutex<QueueState>,
    semaphore: Arc<Semaphore>,
    notify: Notify,
    seq: AtomicU64,
    counters: Counters,
    events: broadcast::Sender<QueueEvent>,
    sink: SharedEventSink,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub(crate) fn new(
        name: impl Into<String>,
        concurrency: usize,
        events: broadcast::Sender<QueueEvent>,
        sink: SharedEventSink,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            name: name.into(),
            concurrency,
            state: Mutex::new(QueueState::default()),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            counters: Counters::default(),
            events,
            sink,
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum simultaneously active jobs.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Adds a job and returns the receiver for its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`JobQueue::close`].
    pub(crate) fn push(&self, job: Job) -> Result<oneshot::Receiver<JobOutcome>, QueueError> {
        let (tx, rx) = oneshot::channel();
        let event = QueueEvent::Queued {
            job_id: job.id.clone(),
            queue: self.name.clone(),
            agent: job.agent.clone(),
            priority: job.priority,
        };
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed(self.name.clone()));
            }
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            state.waiting.push(QueuedJob {
                job,
                responder: tx,
                seq,
            });
        }
        self.publish(event);
        self.notify.notify_waiters();
        Ok(rx)
    }

    /// Waits for the next job and a free slot.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next_job(self: &Arc<Self>) -> Option<Lease> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;

        loop {
            let notified = self.notify.notified();
            let resume_at = {
                let mut state = self.state.lock();
                if state.closed && state.waiting.is_empty() {
                    return None;
                }
                if state.is_paused() {
                    if state.paused {
                        None
                    } else {
                        state.resume_at
                    }
                } else if let Some(mut queued) = state.waiting.pop() {
                    drop(state);
                    queued.job.attempts += 1;
                    self.counters.active.fetch_add(1, Ordering::SeqCst);
                    self.publish(QueueEvent::Started {
                        job_id: queued.job.id.clone(),
                        queue: self.name.clone(),
                        attempt: queued.job.attempts,
                    });
                    return Some(Lease {
                        queue: Arc::clone(self),
                        job: queued.job,
                        responder: Some(queued.responder),
                        permit: Some(permit),
                    });
                } else {
                    None
                }
            };

            match resume_at {
                Some(at) => {
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stops handing out jobs until [`JobQueue::resume`].
    pub fn pause(&self) {
        self.state.lock().paused = true;
        info!(queue = %self.name, "Queue paused");
    }

    /// Resumes a paused queue.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            state.paused = false;
            state.resume_at = None;
        }
        info!(queue = %self.name, "Queue resumed");
        self.notify.notify_waiters();
    }

    /// Stops handing out jobs for a fixed duration.
    pub fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        {
            let mut state = self.state.lock();
            state.resume_at = Some(state.resume_at.map_or(until, |t| t.max(until)));
        }
        info!(
            queue = %self.name,
            pause_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Queue paused temporarily"
        );
        self.notify.notify_waiters();
    }

    /// Returns true if the queue currently hands out no jobs.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().is_paused()
    }

    /// Closes the queue.
    ///
    /// Further enqueues fail and waiting jobs are failed with
    /// [`JobError::Shutdown`]. Active jobs run to completion.
    pub fn close(&self) {
        let drained: Vec<QueuedJob> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.waiting.drain().collect()
        };
        if !drained.is_empty() {
            warn!(queue = %self.name, jobs = drained.len(), "Failing waiting jobs on close");
        }
        for queued in drained {
            self.finish(
                queued.job,
                queued.responder,
                Err(JobError::Shutdown(self.name.clone())),
            );
        }
        self.notify.notify_waiters();
    }

    /// Returns true after [`JobQueue::close`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Snapshot of job counts.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.state.lock().waiting.len(),
            active: self.counters.active.load(Ordering::SeqCst),
            delayed: self.counters.delayed.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            retried: self.counters.retried.load(Ordering::SeqCst),
        }
    }

    fn publish(&self, event: QueueEvent) {
        self.sink.try_emit(event.event_type(), Some(event.to_value()));
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn requeue(&self, job: Job, responder: Responder) {
        let closed = {
            let mut state = self.state.lock();
            if state.closed {
                Some((job, responder))
            } else {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                state.waiting.push(QueuedJob {
                    job,
                    responder,
                    seq,
                });
                None
            }
        };
        match closed {
            Some((job, responder)) => {
                self.finish(job, responder, Err(JobError::Shutdown(self.name.clone())));
            }
            None => self.notify.notify_waiters(),
        }
    }

    fn finish(&self, job: Job, responder: Responder, result: Result<AgentOutput, JobError>) {
        match result {
            Ok(ref output) => {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                self.publish(QueueEvent::Completed {
                    job_id: job.id.clone(),
                    queue: self.name.clone(),
                    attempts: job.attempts,
                    result: output.to_value(),
                });
            }
            Err(ref error) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                self.publish(QueueEvent::Failed {
                    job_id: job.id.clone(),
                    queue: self.name.clone(),
                    attempts: job.attempts,
                    error: error.to_string(),
                });
            }
        }

        let outcome = JobOutcome {
            job_id: job.id,
            queue: job.queue,
            agent: job.agent,
            stage: job.stage,
            attempts: job.attempts,
            history: job.history,
            result,
        };
        if responder.send(outcome).is_err() {
            debug!(queue = %self.name, "Job outcome receiver dropped");
        }
    }
}

/// An active job held by a worker slot.
///
/// The slot is released when the lease is completed, failed or dropped.
/// A lease dropped without a report fails the job with a non-retryable
/// agent error.
pub struct Lease {
    queue: Arc<JobQueue>,
    job: Job,
    responder: Option<Responder>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("queue", &self.queue.name)
            .field("job_id", &self.job.id)
            .field("attempt", &self.job.attempts)
            .finish()
    }
}

impl Lease {
    /// The leased job.
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// A handle for reporting progress from the processor.
    #[must_use]
    pub fn progress_reporter(&self) -> ProgressReporter {
        ProgressReporter {
            queue: Arc::clone(&self.queue),
            job_id: self.job.id.clone(),
        }
    }

    /// Reports a result and releases the slot.
    pub fn complete(mut self, output: AgentOutput) {
        self.release_slot();
        if let Some(responder) = self.responder.take() {
            let job = self.job.clone();
            self.queue.finish(job, responder, Ok(output));
        }
    }

    /// Reports a failed attempt and releases the slot.
    ///
    /// Retryable errors re-enter the queue after the job's backoff delay
    /// while attempts remain; anything else fails the job.
    pub fn fail(mut self, error: JobError) {
        self.release_slot();
        let Some(responder) = self.responder.take() else {
            return;
        };
        let mut job = self.job.clone();
        job.history.push(AttemptRecord::new(job.attempts, &error));

        if error.is_retryable() && job.can_retry() {
            let delay = job.backoff.delay_for(job.attempts);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(
                queue = %self.queue.name,
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                delay_ms,
                error = %error,
                "Job attempt failed, retrying"
            );
            self.queue.counters.retried.fetch_add(1, Ordering::SeqCst);
            self.queue.counters.delayed.fetch_add(1, Ordering::SeqCst);
            self.queue.publish(QueueEvent::Retrying {
                job_id: job.id.clone(),
                queue: self.queue.name.clone(),
                attempt: job.attempts,
                delay_ms,
                error: error.to_string(),
            });

            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.counters.delayed.fetch_sub(1, Ordering::SeqCst);
                queue.requeue(job, responder);
            });
        } else {
            warn!(
                queue = %self.queue.name,
                job_id = %job.id,
                attempts = job.attempts,
                error = %error,
                "Job failed"
            );
            self.queue.finish(job, responder, Err(error));
        }
    }

    fn release_slot(&mut self) {
        if self.permit.take().is_some() {
            self.queue.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_slot();
        if let Some(responder) = self.responder.take() {
            let job = self.job.clone();
            self.queue.finish(
                job,
                responder,
                Err(JobError::Agent(crate::errors::AgentError::permanent(
                    "worker dropped the job without reporting",
                ))),
            );
        }
    }
}

/// Reports processor progress for one job.
#[derive(Clone)]
pub struct ProgressReporter {
    queue: Arc<JobQueue>,
    job_id: String,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("queue", &self.queue.name)
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl ProgressReporter {
    /// Emits a progress event. Percentages above 100 are clamped.
    pub fn report(&self, percent: u8, message: Option<&str>) {
        self.queue.publish(QueueEvent::Progress {
            job_id: self.job_id.clone(),
            queue: self.queue.name.clone(),
            percent: percent.min(100),
            message: message.map(str::to_string),
        });
    }
}
