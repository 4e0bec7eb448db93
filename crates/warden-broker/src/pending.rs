//! Pending-request queue for approval-gated calls.
//!
//! Each entry is a slot that is either waiting for settlement or claimed by
//! an approver who is about to settle it. Settlement removes the entry under
//! the queue lock and records its terminal status in a bounded history, so a
//! duplicate settlement reports [`BrokerError::AlreadySettled`] instead of
//! reaching the waiter twice.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};
use warden_core::RequestId;

use crate::errors::BrokerError;

/// Workflow a pending request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalKind {
    /// Transaction or message signing.
    Signing,
    /// Metadata definition import.
    Metadata,
    /// Site authorization.
    Authorize,
    /// QR or hardware-wallet signing.
    External,
    /// Wallet-connect session proposal.
    WalletConnect,
}

impl ApprovalKind {
    /// All kinds.
    pub const ALL: [Self; 5] = [
        Self::Signing,
        Self::Metadata,
        Self::Authorize,
        Self::External,
        Self::WalletConnect,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signing => "signing",
            Self::Metadata => "metadata",
            Self::Authorize => "authorize",
            Self::External => "external",
            Self::WalletConnect => "walletConnect",
        }
    }
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negative settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Explicit refusal by the approver.
    UserRejected {
        /// Reason.
        message: String,
    },
    /// Dismissed without explicit refusal.
    Cancelled {
        /// Optional reason.
        message: Option<String>,
    },
}

impl From<Rejection> for BrokerError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::UserRejected { message } => Self::UserRejected { message },
            Rejection::Cancelled { message } => Self::Cancelled { message },
        }
    }
}

/// Outcome delivered to the waiting caller.
pub type Outcome = Result<Value, Rejection>;

/// Lifecycle of a request id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Awaiting settlement.
    Pending,
    /// Settled with a value.
    Resolved,
    /// Settled with a rejection.
    Rejected,
}

/// What approvers see for each pending request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    /// Request id.
    pub id: RequestId,
    /// Workflow.
    pub kind: ApprovalKind,
    /// Request payload for display.
    pub payload: Value,
    /// When the request was queued.
    pub created_at: DateTime<Utc>,
}

enum Slot {
    Waiting(oneshot::Sender<Outcome>),
    Claimed,
}

struct Entry {
    summary: PendingSummary,
    seq: u64,
    slot: Slot,
}

struct QueueState {
    entries: HashMap<RequestId, Entry>,
    settled: VecDeque<(RequestId, RequestStatus)>,
    history: usize,
    next_seq: u64,
}

impl QueueState {
    fn settled_status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.settled
            .iter()
            .rev()
            .find(|(settled, _)| settled == id)
            .map(|(_, status)| *status)
    }

    fn missing(&self, id: &RequestId) -> BrokerError {
        if self.settled_status(id).is_some() {
            BrokerError::AlreadySettled { id: id.to_string() }
        } else {
            BrokerError::not_found("pending request", id.as_str())
        }
    }

    fn remember(&mut self, id: RequestId, status: RequestStatus) {
        if self.history == 0 {
            return;
        }
        while self.settled.len() >= self.history {
            let _ = self.settled.pop_front();
        }
        self.settled.push_back((id, status));
    }

    fn summaries(&self) -> Vec<PendingSummary> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.summary.clone()).collect()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    published: watch::Sender<Vec<PendingSummary>>,
}

impl Shared {
    fn publish(&self, summaries: Vec<PendingSummary>) {
        let _ = self.published.send_replace(summaries);
    }
}

/// Process-wide queue of approval-gated requests. Cheap to clone.
#[derive(Clone)]
pub struct PendingQueue {
    shared: Arc<Shared>,
}

/// The awaiting side of an enqueued request.
pub struct Ticket {
    id: RequestId,
    rx: oneshot::Receiver<Outcome>,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Ticket {
    /// Request id.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for settlement. A dropped entry counts as cancelled.
    pub async fn wait(self) -> Result<Value, BrokerError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(rejection)) => Err(rejection.into()),
            Err(_) => Err(BrokerError::Cancelled {
                message: Some("pending request dropped".into()),
            }),
        }
    }
}

/// Exclusive right to settle one request.
///
/// Obtained with [`PendingQueue::claim`] by approvers that must do work
/// (e.g. sign) before they know the outcome. While claimed, other settlement
/// attempts report `AlreadySettled`. Dropping an unsettled claim puts the
/// request back in the queue.
pub struct Claim {
    queue: PendingQueue,
    summary: PendingSummary,
    responder: Option<oneshot::Sender<Outcome>>,
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("summary", &self.summary)
            .field("settled", &self.responder.is_none())
            .finish_non_exhaustive()
    }
}

impl Claim {
    /// The claimed request.
    pub fn summary(&self) -> &PendingSummary {
        &self.summary
    }

    /// Settle with a value.
    pub fn resolve(mut self, value: Value) {
        self.finish(Ok(value));
    }

    /// Settle with a rejection.
    pub fn reject(mut self, rejection: Rejection) {
        self.finish(Err(rejection));
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(responder) = self.responder.take() {
            self.queue.complete(&self.summary.id, responder, outcome);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            self.queue.release(&self.summary.id, responder);
        }
    }
}

impl PendingQueue {
    /// Queue remembering the last `history` settled ids.
    pub fn new(history: usize) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    entries: HashMap::new(),
                    settled: VecDeque::new(),
                    history,
                    next_seq: 0,
                }),
                published,
            }),
        }
    }

    /// Queue a request. Fails when `id` is already pending.
    pub fn enqueue(&self, id: RequestId, kind: ApprovalKind, payload: Value) -> Result<Ticket, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let summaries = {
            let mut state = self.shared.state.lock();
            if state.entries.contains_key(&id) {
                return Err(BrokerError::invalid_params(format!(
                    "request '{id}' is already pending"
                )));
            }
            state.settled.retain(|(settled, _)| settled != &id);
            let seq = state.next_seq;
            state.next_seq += 1;
            let summary = PendingSummary {
                id: id.clone(),
                kind,
                payload,
                created_at: Utc::now(),
            };
            let _ = state.entries.insert(
                id.clone(),
                Entry {
                    summary,
                    seq,
                    slot: Slot::Waiting(tx),
                },
            );
            state.summaries()
        };
        self.shared.publish(summaries);
        info!(request_id = %id, %kind, "approval request queued");
        Ok(Ticket { id, rx })
    }

    /// Summary of a pending request; `NotFound` when unknown or settled.
    pub fn get(&self, id: &RequestId) -> Result<PendingSummary, BrokerError> {
        self.shared
            .state
            .lock()
            .entries
            .get(id)
            .map(|e| e.summary.clone())
            .ok_or_else(|| BrokerError::not_found("pending request", id.as_str()))
    }

    /// Status of `id`, if it is pending or still in the settled history.
    pub fn status(&self, id: &RequestId) -> Option<RequestStatus> {
        let state = self.shared.state.lock();
        if state.entries.contains_key(id) {
            Some(RequestStatus::Pending)
        } else {
            state.settled_status(id)
        }
    }

    /// Resolve `id` with `value`.
    pub fn resolve(&self, id: &RequestId, value: Value) -> Result<(), BrokerError> {
        self.settle(id, None, Ok(value))
    }

    /// Reject `id`.
    pub fn reject(&self, id: &RequestId, rejection: Rejection) -> Result<(), BrokerError> {
        self.settle(id, None, Err(rejection))
    }

    /// Settle `id`, requiring it to be of `kind` when given.
    pub fn settle(&self, id: &RequestId, kind: Option<ApprovalKind>, outcome: Outcome) -> Result<(), BrokerError> {
        let responder = {
            let mut state = self.shared.state.lock();
            let Some(entry) = state.entries.get_mut(id) else {
                return Err(state.missing(id));
            };
            if kind.is_some_and(|k| k != entry.summary.kind) {
                return Err(BrokerError::not_found("pending request", id.as_str()));
            }
            match std::mem::replace(&mut entry.slot, Slot::Claimed) {
                Slot::Waiting(responder) => responder,
                Slot::Claimed => return Err(BrokerError::AlreadySettled { id: id.to_string() }),
            }
        };
        self.complete(id, responder, outcome);
        Ok(())
    }

    /// Take exclusive settlement rights over `id`.
    pub fn claim(&self, id: &RequestId, kind: ApprovalKind) -> Result<Claim, BrokerError> {
        let (summary, responder) = {
            let mut state = self.shared.state.lock();
            let Some(entry) = state.entries.get_mut(id) else {
                return Err(state.missing(id));
            };
            if entry.summary.kind != kind {
                return Err(BrokerError::not_found("pending request", id.as_str()));
            }
            match std::mem::replace(&mut entry.slot, Slot::Claimed) {
                Slot::Waiting(responder) => (entry.summary.clone(), responder),
                Slot::Claimed => return Err(BrokerError::AlreadySettled { id: id.to_string() }),
            }
        };
        debug!(request_id = %id, "pending request claimed");
        Ok(Claim {
            queue: self.clone(),
            summary,
            responder: Some(responder),
        })
    }

    fn complete(&self, id: &RequestId, responder: oneshot::Sender<Outcome>, outcome: Outcome) {
        let status = if outcome.is_ok() {
            RequestStatus::Resolved
        } else {
            RequestStatus::Rejected
        };
        let summaries = {
            let mut state = self.shared.state.lock();
            let _ = state.entries.remove(id);
            state.remember(id.clone(), status);
            state.summaries()
        };
        if responder.send(outcome).is_err() {
            debug!(request_id = %id, "settled request had no waiter");
        }
        self.shared.publish(summaries);
        info!(request_id = %id, ?status, "approval request settled");
    }

    fn release(&self, id: &RequestId, responder: oneshot::Sender<Outcome>) {
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.entries.get_mut(id) {
            entry.slot = Slot::Waiting(responder);
            debug!(request_id = %id, "claim released");
        }
    }

    /// Pending requests in queue order.
    pub fn list(&self) -> Vec<PendingSummary> {
        self.shared.state.lock().summaries()
    }

    /// Observe the pending list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PendingSummary>> {
        self.shared.published.subscribe()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().entries.is_empty()
    }

    /// Drop every pending entry; waiters observe `Cancelled`.
    pub fn clear(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut state = self.shared.state.lock();
            state.entries.drain().map(|(_, e)| e).collect()
        };
        let count = drained.len();
        drop(drained);
        self.shared.publish(Vec::new());
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    fn rid(s: &str) -> RequestId {
        RequestId::from(s)
    }

    #[tokio::test]
    async fn reject_then_resolve_reports_already_settled() {
        let queue = PendingQueue::new(16);
        let ticket = queue
            .enqueue(rid("req-1"), ApprovalKind::Signing, json!({"tx": 1}))
            .unwrap();

        queue
            .reject(
                &rid("req-1"),
                Rejection::UserRejected {
                    message: "no".into(),
                },
            )
            .unwrap();
        assert_matches!(
            queue.resolve(&rid("req-1"), json!("sig")),
            Err(BrokerError::AlreadySettled { id }) if id == "req-1"
        );

        assert_matches!(ticket.wait().await, Err(BrokerError::UserRejected { message }) if message == "no");
        assert_eq!(queue.status(&rid("req-1")), Some(RequestStatus::Rejected));
    }

    #[tokio::test]
    async fn resolve_delivers_value() {
        let queue = PendingQueue::new(16);
        let ticket = queue
            .enqueue(rid("a"), ApprovalKind::Metadata, json!(null))
            .unwrap();
        queue.resolve(&rid("a"), json!({"ok": true})).unwrap();
        assert_eq!(ticket.wait().await.unwrap(), json!({"ok": true}));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn silent_cancel_still_settles() {
        let queue = PendingQueue::new(16);
        let ticket = queue
            .enqueue(rid("qr"), ApprovalKind::External, json!(null))
            .unwrap();
        queue
            .reject(&rid("qr"), Rejection::Cancelled { message: None })
            .unwrap();
        assert_matches!(ticket.wait().await, Err(BrokerError::Cancelled { message: None }));
    }

    #[test]
    fn get_fails_for_unknown_and_settled() {
        let queue = PendingQueue::new(16);
        assert_matches!(queue.get(&rid("x")), Err(BrokerError::NotFound { .. }));

        let _ticket = queue
            .enqueue(rid("x"), ApprovalKind::Authorize, json!({"url": "https://a"}))
            .unwrap();
        assert_eq!(queue.get(&rid("x")).unwrap().payload["url"], "https://a");

        queue.resolve(&rid("x"), json!(true)).unwrap();
        assert_matches!(queue.get(&rid("x")), Err(BrokerError::NotFound { .. }));
    }

    #[test]
    fn unknown_settlement_is_not_found() {
        let queue = PendingQueue::new(16);
        assert_matches!(
            queue.resolve(&rid("ghost"), json!(1)),
            Err(BrokerError::NotFound { .. })
        );
    }

    #[test]
    fn history_is_bounded() {
        let queue = PendingQueue::new(2);
        for id in ["a", "b", "c"] {
            let _t = queue.enqueue(rid(id), ApprovalKind::Signing, json!(null)).unwrap();
            queue.resolve(&rid(id), json!(null)).unwrap();
        }
        assert_eq!(queue.status(&rid("a")), None);
        assert_matches!(queue.resolve(&rid("a"), json!(1)), Err(BrokerError::NotFound { .. }));
        assert_matches!(
            queue.resolve(&rid("c"), json!(1)),
            Err(BrokerError::AlreadySettled { .. })
        );
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let queue = PendingQueue::new(4);
        let _t = queue.enqueue(rid("d"), ApprovalKind::Signing, json!(null)).unwrap();
        assert_matches!(
            queue.enqueue(rid("d"), ApprovalKind::Signing, json!(null)),
            Err(BrokerError::InvalidParams { .. })
        );
    }

    #[test]
    fn wrong_kind_is_not_found() {
        let queue = PendingQueue::new(4);
        let _t = queue.enqueue(rid("m"), ApprovalKind::Metadata, json!(null)).unwrap();
        assert_matches!(
            queue.settle(&rid("m"), Some(ApprovalKind::Signing), Ok(json!(1))),
            Err(BrokerError::NotFound { .. })
        );
        assert_matches!(
            queue.claim(&rid("m"), ApprovalKind::Signing),
            Err(BrokerError::NotFound { .. })
        );
        assert_eq!(queue.status(&rid("m")), Some(RequestStatus::Pending));
    }

    #[tokio::test]
    async fn claim_blocks_concurrent_settlement() {
        let queue = PendingQueue::new(4);
        let ticket = queue.enqueue(rid("s"), ApprovalKind::Signing, json!({"n": 1})).unwrap();

        let claim = queue.claim(&rid("s"), ApprovalKind::Signing).unwrap();
        assert_eq!(claim.summary().payload["n"], 1);
        assert_matches!(
            queue.resolve(&rid("s"), json!("other")),
            Err(BrokerError::AlreadySettled { .. })
        );
        assert_matches!(
            queue.claim(&rid("s"), ApprovalKind::Signing),
            Err(BrokerError::AlreadySettled { .. })
        );

        claim.resolve(json!("sig"));
        assert_eq!(ticket.wait().await.unwrap(), json!("sig"));
    }

    #[tokio::test]
    async fn dropped_claim_is_released() {
        let queue = PendingQueue::new(4);
        let ticket = queue.enqueue(rid("s"), ApprovalKind::Signing, json!(null)).unwrap();
        drop(queue.claim(&rid("s"), ApprovalKind::Signing).unwrap());

        assert_eq!(queue.status(&rid("s")), Some(RequestStatus::Pending));
        queue.resolve(&rid("s"), json!(7)).unwrap();
        assert_eq!(ticket.wait().await.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn cleared_entries_cancel_waiters() {
        let queue = PendingQueue::new(4);
        let ticket = queue.enqueue(rid("w"), ApprovalKind::WalletConnect, json!(null)).unwrap();
        assert_eq!(queue.clear(), 1);
        assert_matches!(ticket.wait().await, Err(BrokerError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn observers_see_queue_changes() {
        let queue = PendingQueue::new(4);
        let mut rx = queue.subscribe();

        let _a = queue.enqueue(rid("a"), ApprovalKind::Signing, json!(null)).unwrap();
        let _b = queue.enqueue(rid("b"), ApprovalKind::Metadata, json!(null)).unwrap();
        rx.changed().await.unwrap();
        let ids: Vec<String> = rx.borrow_and_update().iter().map(|s| s.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        queue.resolve(&rid("a"), json!(null)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[test]
    fn summary_wire_shape() {
        let queue = PendingQueue::new(4);
        let _t = queue.enqueue(rid("a"), ApprovalKind::WalletConnect, json!({"p": 1})).unwrap();
        let v = serde_json::to_value(queue.list()).unwrap();
        assert_eq!(v[0]["kind"], "walletConnect");
        assert!(v[0]["createdAt"].is_string());
    }

    #[derive(Clone, Debug)]
    enum Attempt {
        Resolve,
        Reject,
        Cancel,
    }

    proptest! {
        #[test]
        fn exactly_one_settlement_succeeds(attempts in proptest::collection::vec(
            prop_oneof![Just(Attempt::Resolve), Just(Attempt::Reject), Just(Attempt::Cancel)],
            1..12,
        )) {
            let queue = PendingQueue::new(8);
            let mut ticket = queue.enqueue(rid("p"), ApprovalKind::Signing, json!(null)).unwrap();

            let mut successes = 0;
            for (n, attempt) in attempts.iter().enumerate() {
                let result = match attempt {
                    Attempt::Resolve => queue.resolve(&rid("p"), json!(n)),
                    Attempt::Reject => queue.reject(&rid("p"), Rejection::UserRejected { message: format!("{n}") }),
                    Attempt::Cancel => queue.reject(&rid("p"), Rejection::Cancelled { message: None }),
                };
                match result {
                    Ok(()) => successes += 1,
                    Err(err) => prop_assert_eq!(err.code(), crate::errors::ALREADY_SETTLED),
                }
            }
            prop_assert_eq!(successes, 1);

            let outcome = ticket.rx.try_recv().unwrap();
            match &attempts[0] {
                Attempt::Resolve => prop_assert_eq!(outcome, Ok(json!(0))),
                Attempt::Reject => prop_assert_eq!(outcome, Err(Rejection::UserRejected { message: "0".into() })),
                Attempt::Cancel => prop_assert_eq!(outcome, Err(Rejection::Cancelled { message: None })),
            }
        }
    }
}
