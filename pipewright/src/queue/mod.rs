//! In-process job queues.
//!
//! A [`JobQueues`] set owns named [`JobQueue`]s. Jobs carry their own retry
//! policy: workers report each attempt through a [`Lease`], and the queue
//! either re-enqueues the job after a backoff delay or resolves the
//! [`JobHandle`] with a terminal [`JobOutcome`].
//!
//! ```rust,ignore
//! let queues = JobQueues::new(sink);
//! queues.declare("writer", 3);
//! let handle = queues.enqueue("writer", "writer", payload, JobOptions::default())?;
//! let outcome = handle.await_result().await?;
//! ```

mod backoff;
mod events;
mod job;
mod job_queue;

pub use backoff::{BackoffKind, BackoffPolicy, Jitter};
pub use events::QueueEvent;
pub use job::{AttemptRecord, Job, JobError, JobOptions, JobOutcome};
pub use job_queue::{JobQueue, Lease, ProgressReporter, QueueStats};

use crate::errors::QueueError;
use crate::events::{noop_sink, SharedEventSink};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// A set of named queues sharing one event channel.
pub struct JobQueues {
    queues: DashMap<String, Arc<JobQueue>>,
    events: broadcast::Sender<QueueEvent>,
    sink: SharedEventSink,
}

impl Default for JobQueues {
    fn default() -> Self {
        Self::new(noop_sink())
    }
}

impl std::fmt::Debug for JobQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueues")
            .field("queues", &self.names())
            .finish_non_exhaustive()
    }
}

impl JobQueues {
    /// Creates an empty set forwarding events to `sink`.
    #[must_use]
    pub fn new(sink: SharedEventSink) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queues: DashMap::new(),
            events,
            sink,
        }
    }

    /// Declares a queue, or returns the existing one of that name.
    pub fn declare(&self, name: &str, concurrency: usize) -> Arc<JobQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = %name, concurrency, "Queue declared");
                Arc::new(JobQueue::new(
                    name,
                    concurrency,
                    self.events.clone(),
                    Arc::clone(&self.sink),
                ))
            })
            .clone()
    }

    /// Looks up a queue.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<JobQueue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    /// All queues, sorted by name.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<JobQueue>> {
        let mut all: Vec<_> = self.queues.iter().map(|q| Arc::clone(q.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Queue names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|q| q.name().to_string()).collect()
    }

    /// Adds a job to a declared queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownQueue`] for an undeclared queue and
    /// [`QueueError::Closed`] for a closed one.
    pub fn enqueue(
        &self,
        queue: &str,
        agent: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        let target = self
            .get(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        let job = Job::new(queue, agent, payload, options);
        let job_id = job.id.clone();
        let rx = target.push(job)?;
        Ok(JobHandle { job_id, rx })
    }

    /// Subscribes to every job event from every queue in the set.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Closes every queue.
    pub fn close_all(&self) {
        for queue in self.all() {
            queue.close();
        }
    }

    /// Stats per queue.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, QueueStats> {
        self.all()
            .iter()
            .map(|q| (q.name().to_string(), q.stats()))
            .collect()
    }
}

/// Awaitable handle to a job's terminal outcome.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// The job id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.job_id
    }

    /// Waits for the job to complete or fail terminally.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ResultLost`] if the queue dropped the job.
    pub async fn await_result(self) -> Result<JobOutcome, QueueError> {
        self.rx
            .await
            .map_err(|_| QueueError::ResultLost(self.job_id))
    }
}
