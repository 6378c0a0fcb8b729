//! Approval of `manual` stages.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// What an approver is asked to decide on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    /// Run the stage belongs to.
    pub run_id: String,
    /// Stage id.
    pub stage: String,
    /// Agent the stage would run.
    pub agent: String,
}

/// An approver's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Run the stage.
    Approved,
    /// Fail the stage with this reason.
    Denied(String),
}

impl ApprovalDecision {
    /// Returns true for [`ApprovalDecision::Approved`].
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Decides whether a manual stage may run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageApprover: Send + Sync {
    /// Returns the decision for one stage.
    async fn approve(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything. The default for non-interactive runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprover;

#[async_trait]
impl StageApprover for AutoApprover {
    async fn approve(&self, request: ApprovalRequest) -> ApprovalDecision {
        info!(run_id = %request.run_id, stage = %request.stage, "Manual stage auto-approved");
        ApprovalDecision::Approved
    }
}

struct PendingApproval {
    request: ApprovalRequest,
    created_at: Instant,
    response_tx: oneshot::Sender<bool>,
}

/// Parks approval requests until someone answers them.
///
/// Another task lists [`ChannelApprover::pending`] and calls
/// [`ChannelApprover::grant`] or [`ChannelApprover::reject`]. Requests that
/// get no answer within the timeout are denied.
pub struct ChannelApprover {
    timeout: Duration,
    pending: RwLock<HashMap<Uuid, PendingApproval>>,
}

impl ChannelApprover {
    /// Creates an approver that waits up to `timeout` per request.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Requests waiting for an answer, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<(Uuid, ApprovalRequest)> {
        let pending = self.pending.read();
        let mut entries: Vec<_> = pending
            .iter()
            .map(|(id, p)| (p.created_at, *id, p.request.clone()))
            .collect();
        entries.sort_by_key(|(created_at, _, _)| *created_at);
        entries.into_iter().map(|(_, id, req)| (id, req)).collect()
    }

    /// Number of unanswered requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Approves a pending request. Returns false if it is no longer pending.
    pub fn grant(&self, id: Uuid) -> bool {
        self.answer(id, true)
    }

    /// Denies a pending request. Returns false if it is no longer pending.
    pub fn reject(&self, id: Uuid) -> bool {
        self.answer(id, false)
    }

    fn answer(&self, id: Uuid, approved: bool) -> bool {
        match self.pending.write().remove(&id) {
            Some(pending) => pending.response_tx.send(approved).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for ChannelApprover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelApprover")
            .field("timeout", &self.timeout)
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

#[async_trait]
impl StageApprover for ChannelApprover {
    async fn approve(&self, request: ApprovalRequest) -> ApprovalDecision {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        info!(run_id = %request.run_id, stage = %request.stage, request_id = %id, "Waiting for approval");
        self.pending.write().insert(
            id,
            PendingApproval {
                request: request.clone(),
                created_at: Instant::now(),
                response_tx: tx,
            },
        );

        let decision = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(true)) => ApprovalDecision::Approved,
            Ok(Ok(false)) => ApprovalDecision::Denied("approval denied".to_string()),
            Ok(Err(_)) => ApprovalDecision::Denied("approval cancelled".to_string()),
            Err(_) => ApprovalDecision::Denied(format!(
                "approval timed out after {}ms",
                self.timeout.as_millis()
            )),
        };
        self.pending.write().remove(&id);

        if let ApprovalDecision::Denied(ref reason) = decision {
            warn!(stage = %request.stage, reason = %reason, "Manual stage not approved");
        }
        decision
    }
}
