//! Correlates observer decisions with the prompts that asked for them.
//!
//! Each allocated request owns a pending slot holding the sender half of a
//! oneshot channel and the handle of its timeout task. Removing a slot from
//! the map and disarming its timer happen under the same lock, so a slot can
//! never outlive its timer or the other way round. Whoever removes the slot
//! first (an observer decision, the timer, or `expire_all`) settles the
//! request; everyone after that finds nothing and does nothing.
//!
//! A slot may also carry a reply queue. Settlement pushes the outcome onto
//! it while the lock is still held, so the queue sees outcomes in exactly
//! the order requests were settled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nod_common::{Decision, Outcome, PermissionRequest, RequestId, RequestStatus, RiskLevel};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(120);

/// One answer on its way to the agent's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: RequestId,
    pub outcome: Outcome,
}

pub type ReplySender = mpsc::UnboundedSender<Reply>;

struct PendingSlot {
    request: PermissionRequest,
    resolver: oneshot::Sender<Outcome>,
    reply_to: Option<ReplySender>,
    timer: JoinHandle<()>,
}

/// Lifetime counters, reported by the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStats {
    pub allocated: u64,
    pub approved: u64,
    pub denied: u64,
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    approved: AtomicU64,
    denied: AtomicU64,
    expired: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Approved { .. } => &self.approved,
            Outcome::Denied => &self.denied,
            Outcome::Expired => &self.expired,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner {
    next_id: AtomicU64,
    timeout: Duration,
    pending: Mutex<HashMap<RequestId, PendingSlot>>,
    counters: Counters,
}

impl Inner {
    async fn expire(&self, id: RequestId) {
        let mut pending = self.pending.lock().await;
        let Some(slot) = pending.remove(&id) else {
            return;
        };
        warn!(
            request_id = id,
            timeout_secs = self.timeout.as_secs(),
            target = %slot.request.target,
            "No decision before timeout; denying"
        );
        self.settle(slot, Outcome::Expired);
    }

    // Caller holds the pending lock and has already removed the slot.
    fn settle(&self, slot: PendingSlot, outcome: Outcome) {
        slot.timer.abort();
        self.counters.record(&outcome);
        if let Some(reply_to) = &slot.reply_to {
            let reply = Reply {
                id: slot.request.id,
                outcome: outcome.clone(),
            };
            if reply_to.send(reply).is_err() {
                debug!(request_id = slot.request.id, "Reply queue closed; answer dropped");
            }
        }
        if slot.resolver.send(outcome).is_err() {
            debug!(
                request_id = slot.request.id,
                "Decision waiter already gone; outcome dropped"
            );
        }
    }
}

/// The waiting side of one allocated request.
#[derive(Debug)]
pub struct DecisionHandle {
    id: RequestId,
    receiver: oneshot::Receiver<Outcome>,
}

impl DecisionHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Suspends until the request is resolved or expires. Resolves exactly
    /// once; a correlator torn down underneath the waiter counts as expiry.
    pub async fn wait(self) -> Outcome {
        self.receiver.await.unwrap_or(Outcome::Expired)
    }
}

#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<Inner>,
}

impl RequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                timeout,
                pending: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Registers a new pending request and arms its timeout. Returns the
    /// request (already carrying its id) and the handle to await its outcome.
    pub async fn allocate(
        &self,
        action: impl Into<String>,
        target: impl Into<String>,
        risk: RiskLevel,
        estimated_cost: f64,
    ) -> (PermissionRequest, DecisionHandle) {
        self.allocate_slot(action.into(), target.into(), risk, estimated_cost, None)
            .await
    }

    /// Like [`allocate`](Self::allocate), and the outcome is also queued on
    /// `replies` at the moment the request settles.
    pub async fn allocate_answering(
        &self,
        action: impl Into<String>,
        target: impl Into<String>,
        risk: RiskLevel,
        estimated_cost: f64,
        replies: ReplySender,
    ) -> (PermissionRequest, DecisionHandle) {
        self.allocate_slot(
            action.into(),
            target.into(),
            risk,
            estimated_cost,
            Some(replies),
        )
        .await
    }

    async fn allocate_slot(
        &self,
        action: String,
        target: String,
        risk: RiskLevel,
        estimated_cost: f64,
        reply_to: Option<ReplySender>,
    ) -> (PermissionRequest, DecisionHandle) {
        let (resolver, receiver) = oneshot::channel();

        // The timer cannot act before the slot exists: it needs this lock.
        let mut pending = self.inner.pending.lock().await;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request = PermissionRequest {
            id,
            action,
            target,
            risk,
            estimated_cost,
            created_at: Utc::now(),
            status: RequestStatus::Pending,
        };

        let inner = Arc::clone(&self.inner);
        let timeout = self.inner.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner.expire(id).await;
        });

        pending.insert(
            id,
            PendingSlot {
                request: request.clone(),
                resolver,
                reply_to,
                timer,
            },
        );
        drop(pending);

        debug!(request_id = id, risk = %risk, "Request allocated");
        (request, DecisionHandle { id, receiver })
    }

    /// Applies an observer decision. Returns `false` when the id is unknown
    /// or already settled; that is not an error.
    pub async fn resolve(&self, id: RequestId, decision: Decision) -> bool {
        let mut pending = self.inner.pending.lock().await;
        let Some(slot) = pending.remove(&id) else {
            debug!(request_id = id, "Decision for unknown or settled request ignored");
            return false;
        };
        let outcome = Outcome::from(decision);
        info!(
            request_id = id,
            status = ?outcome.status(),
            "Request resolved by observer"
        );
        self.inner.settle(slot, outcome);
        true
    }

    /// Expires every pending request at once. Used when the agent goes away.
    pub async fn expire_all(&self) -> usize {
        let mut pending = self.inner.pending.lock().await;
        let drained: Vec<PendingSlot> = pending.drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for slot in drained {
            self.inner.settle(slot, Outcome::Expired);
        }
        count
    }

    pub async fn pending_ids(&self) -> Vec<RequestId> {
        let pending = self.inner.pending.lock().await;
        let mut ids: Vec<RequestId> = pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> CorrelatorStats {
        let counters = &self.inner.counters;
        CorrelatorStats {
            allocated: self.inner.next_id.load(Ordering::SeqCst),
            approved: counters.approved.load(Ordering::Relaxed),
            denied: counters.denied.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
        }
    }
}
