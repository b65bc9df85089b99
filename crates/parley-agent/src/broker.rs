//! Approval and elicitation broker.
//!
//! Tool executions suspend waiting for the user; the transport delivers
//! the user's reply asynchronously.  The broker is the rendezvous: each
//! pending request is a one-shot completion keyed by id.  At most one
//! waiter exists per id, replies for unknown ids are discarded with a
//! warning, and cleanup is idempotent.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use parley_kernel::ElicitationAction;

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// The user's verdict on a pending tool approval.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approved: bool,
    /// Possibly-edited arguments; the executor treats them as candidate
    /// input subject to re-injection.
    pub arguments: Option<Value>,
    pub reason: Option<String>,
}

/// Handle returned by [`ApprovalBroker::create`]; await the decision with
/// [`wait`](ApprovalWaiter::wait).
pub struct ApprovalWaiter {
    rx: oneshot::Receiver<ApprovalDecision>,
}

impl ApprovalWaiter {
    /// Wait for the user's decision.  Returns `None` on timeout or when
    /// the request was cleaned up without a response.
    pub async fn wait(self, timeout: Duration) -> Option<ApprovalDecision> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) => None,
            Err(_) => None,
        }
    }
}

/// Correlates approval requests with their asynchronous responses.
#[derive(Default)]
pub struct ApprovalBroker {
    pending: DashMap<String, oneshot::Sender<ApprovalDecision>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending approval and return its waiter.
    ///
    /// A second create for the same id replaces the first; the old waiter
    /// resolves as cancelled.
    pub fn create(&self, tool_call_id: &str) -> ApprovalWaiter {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(tool_call_id.to_owned(), tx).is_some() {
            tracing::warn!(tool_call_id, "replaced an existing approval waiter");
        }
        ApprovalWaiter { rx }
    }

    /// Deliver the user's decision.  Returns `false` when no waiter exists
    /// for the id (unknown or already resolved); the response is dropped.
    pub fn respond(&self, tool_call_id: &str, decision: ApprovalDecision) -> bool {
        match self.pending.remove(tool_call_id) {
            Some((_, tx)) => tx.send(decision).is_ok(),
            None => {
                tracing::warn!(tool_call_id, "approval response for unknown id discarded");
                false
            }
        }
    }

    /// Remove the pending entry whether or not it fired.
    pub fn cleanup(&self, tool_call_id: &str) {
        self.pending.remove(tool_call_id);
    }

    /// Number of requests currently waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Elicitations
// ---------------------------------------------------------------------------

/// The user's reply to an elicitation request.
#[derive(Debug, Clone)]
pub struct ElicitationReply {
    pub action: ElicitationAction,
    pub data: Option<Value>,
}

/// Handle returned by [`ElicitationBroker::create`].
pub struct ElicitationWaiter {
    rx: oneshot::Receiver<ElicitationReply>,
}

impl ElicitationWaiter {
    /// Wait for the user's reply; `None` on timeout or cleanup.
    pub async fn wait(self, timeout: Duration) -> Option<ElicitationReply> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => None,
        }
    }
}

/// Correlates elicitation requests with their asynchronous responses.
#[derive(Default)]
pub struct ElicitationBroker {
    pending: DashMap<String, oneshot::Sender<ElicitationReply>>,
}

impl ElicitationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, elicitation_id: &str) -> ElicitationWaiter {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(elicitation_id.to_owned(), tx).is_some() {
            tracing::warn!(elicitation_id, "replaced an existing elicitation waiter");
        }
        ElicitationWaiter { rx }
    }

    pub fn respond(&self, elicitation_id: &str, reply: ElicitationReply) -> bool {
        match self.pending.remove(elicitation_id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                tracing::warn!(elicitation_id, "elicitation response for unknown id discarded");
                false
            }
        }
    }

    pub fn cleanup(&self, elicitation_id: &str) {
        self.pending.remove(elicitation_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
