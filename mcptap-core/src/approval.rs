//! Human-approval coordination.
//!
//! The [`ApprovalManager`] hands out `apr-N` tickets, holds them in a
//! mutex-guarded pending map, and guarantees exactly-once resolution: the
//! decision travels over a consumed oneshot sender, so whichever of
//! `resolve` / the timeout timer wins the removal race is the only party
//! that can deliver. Delivery itself happens outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::Direction;
use crate::store::ApprovalRecord;

/// Default wait before a pending ticket times out.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// The human's (or the timer's) decision on a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Denied,
    Timeout,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Pending => "pending",
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Denied => "denied",
            ApprovalDecision::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a submitter provides; the manager assigns the id and decision.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub direction: Direction,
    pub method: String,
    pub tool_name: String,
    pub rule_name: String,
    pub payload: String,
}

/// A pending (or just-decided) approval ticket.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalTicket {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub direction: Direction,
    pub method: String,
    pub tool_name: String,
    pub rule_name: String,
    pub payload: String,
    pub decision: ApprovalDecision,
    pub decided_at: Option<DateTime<Utc>>,
}

impl From<&ApprovalTicket> for ApprovalRecord {
    fn from(t: &ApprovalTicket) -> Self {
        ApprovalRecord {
            id: t.id.clone(),
            timestamp: t.timestamp,
            session_id: t.session_id.clone(),
            direction: t.direction.as_str().to_string(),
            method: t.method.clone(),
            tool_name: t.tool_name.clone(),
            rule_name: t.rule_name.clone(),
            payload: t.payload.clone(),
            decision: t.decision.as_str().to_string(),
            decided_at: t.decided_at,
        }
    }
}

/// Errors from approval operations.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// The ticket does not exist — never issued, already resolved, or
    /// already timed out. A late `resolve` after timeout lands here.
    #[error("approval request {id:?} not found or already resolved")]
    NotFound { id: String },
}

/// Callback invoked (best-effort, outside the lock) when a ticket is issued.
pub type ApprovalHook = Box<dyn Fn(&ApprovalTicket) + Send + Sync>;

struct PendingEntry {
    ticket: ApprovalTicket,
    done: oneshot::Sender<ApprovalDecision>,
}

#[derive(Default)]
struct PendingState {
    tickets: HashMap<String, PendingEntry>,
    next_id: u64,
}

struct Shared {
    pending: Mutex<PendingState>,
    timeout: Duration,
    hook: Mutex<Option<ApprovalHook>>,
}

/// Coordinates approval tickets between the blocking interceptor and an
/// external resolver (the dashboard). Cheap to clone.
#[derive(Clone)]
pub struct ApprovalManager {
    shared: Arc<Shared>,
}

impl ApprovalManager {
    /// Create a manager with the given timeout (zero falls back to the
    /// 60-second default).
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_APPROVAL_TIMEOUT
        } else {
            timeout
        };
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(PendingState::default()),
                timeout,
                hook: Mutex::new(None),
            }),
        }
    }

    /// Register the notification hook called for every issued ticket.
    pub fn set_hook(&self, hook: impl Fn(&ApprovalTicket) + Send + Sync + 'static) {
        *lock(&self.shared.hook) = Some(Box::new(hook));
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Issue a ticket and start its timeout timer.
    ///
    /// Returns the ticket snapshot (with its assigned `apr-N` id) and the
    /// channel the decision will arrive on. Must be called from within a
    /// tokio runtime (the timer is a spawned task).
    pub fn submit(
        &self,
        req: ApprovalRequest,
    ) -> (ApprovalTicket, oneshot::Receiver<ApprovalDecision>) {
        let (done_tx, done_rx) = oneshot::channel();

        let ticket = {
            let mut state = lock(&self.shared.pending);
            state.next_id += 1;
            let ticket = ApprovalTicket {
                id: format!("apr-{}", state.next_id),
                timestamp: req.timestamp,
                session_id: req.session_id,
                direction: req.direction,
                method: req.method,
                tool_name: req.tool_name,
                rule_name: req.rule_name,
                payload: req.payload,
                decision: ApprovalDecision::Pending,
                decided_at: None,
            };
            state.tickets.insert(
                ticket.id.clone(),
                PendingEntry {
                    ticket: ticket.clone(),
                    done: done_tx,
                },
            );
            ticket
        };

        if let Some(hook) = lock(&self.shared.hook).as_ref() {
            hook(&ticket);
        }

        let shared = Arc::clone(&self.shared);
        let id = ticket.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.timeout).await;
            let entry = lock(&shared.pending).tickets.remove(&id);
            // A resolve that won the race already emptied the slot; the
            // timer then does nothing.
            if let Some(mut entry) = entry {
                entry.ticket.decision = ApprovalDecision::Timeout;
                entry.ticket.decided_at = Some(Utc::now());
                tracing::warn!(ticket = %id, "approval request timed out");
                let _ = entry.done.send(ApprovalDecision::Timeout);
            }
        });

        (ticket, done_rx)
    }

    /// Resolve a pending ticket. Exactly-once: a second resolve (or a
    /// resolve after timeout) fails with [`ApprovalError::NotFound`].
    pub fn resolve(&self, id: &str, approved: bool) -> Result<(), ApprovalError> {
        let mut entry = lock(&self.shared.pending)
            .tickets
            .remove(id)
            .ok_or_else(|| ApprovalError::NotFound { id: id.to_string() })?;

        let decision = if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Denied
        };
        entry.ticket.decision = decision;
        entry.ticket.decided_at = Some(Utc::now());

        // Deliver outside the lock; the receiver may already be gone.
        let _ = entry.done.send(decision);
        Ok(())
    }

    /// Remove a ticket without delivering a decision. Used by the approval
    /// interceptor when its caller is cancelled, so abandoned tickets do not
    /// linger until the timer fires. Returns whether the ticket existed.
    pub fn remove(&self, id: &str) -> bool {
        lock(&self.shared.pending).tickets.remove(id).is_some()
    }

    /// Point-in-time snapshot of all pending tickets.
    pub fn pending(&self) -> Vec<ApprovalTicket> {
        lock(&self.shared.pending)
            .tickets
            .values()
            .map(|e| e.ticket.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).tickets.len()
    }
}

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            direction: Direction::HostToServer,
            method: "tools/call".to_string(),
            tool_name: "delete_file".to_string(),
            rule_name: "review-deletes".to_string(),
            payload: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let mgr = ApprovalManager::new(Duration::from_secs(60));
        let (t1, _rx1) = mgr.submit(request());
        let (t2, _rx2) = mgr.submit(request());
        assert_eq!(t1.id, "apr-1");
        assert_eq!(t2.id, "apr-2");
        assert_eq!(mgr.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_resolve_approved_delivers() {
        let mgr = ApprovalManager::new(Duration::from_secs(60));
        let (ticket, rx) = mgr.submit(request());
        mgr.resolve(&ticket.id, true).unwrap();
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approved);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_denied_delivers() {
        let mgr = ApprovalManager::new(Duration::from_secs(60));
        let (ticket, rx) = mgr.submit(request());
        mgr.resolve(&ticket.id, false).unwrap();
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Denied);
    }

    #[tokio::test]
    async fn test_resolve_is_exactly_once() {
        let mgr = ApprovalManager::new(Duration::from_secs(60));
        let (ticket, _rx) = mgr.submit(request());
        mgr.resolve(&ticket.id, true).unwrap();
        assert!(matches!(
            mgr.resolve(&ticket.id, false),
            Err(ApprovalError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_fails() {
        let mgr = ApprovalManager::new(Duration::from_secs(60));
        assert!(mgr.resolve("apr-99", true).is_err());
    }

    #[tokio::test]
    async fn test_timeout_delivers_and_removes() {
        let mgr = ApprovalManager::new(Duration::from_millis(20));
        let (ticket, rx) = mgr.submit(request());
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Timeout);
        assert_eq!(mgr.pending_count(), 0);
        // A late resolve reports not-found.
        assert!(matches!(
            mgr.resolve(&ticket.id, true),
            Err(ApprovalError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_beats_timer() {
        let mgr = ApprovalManager::new(Duration::from_millis(50));
        let (ticket, rx) = mgr.submit(request());
        mgr.resolve(&ticket.id, true).unwrap();
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approved);
        // Let the timer fire; it must be a no-op.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_hook_fires_on_submit() {
        let mgr = ApprovalManager::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        mgr.set_hook(move |ticket| {
            assert_eq!(ticket.decision, ApprovalDecision::Pending);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let _pending = mgr.submit(request());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_snapshot() {
        let mgr = ApprovalManager::new(Duration::from_secs(60));
        let (ticket, _rx) = mgr.submit(request());
        let snapshot = mgr.pending();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, ticket.id);
        assert_eq!(snapshot[0].decision, ApprovalDecision::Pending);
    }

    #[tokio::test]
    async fn test_remove_drops_without_decision() {
        let mgr = ApprovalManager::new(Duration::from_secs(60));
        let (ticket, rx) = mgr.submit(request());
        assert!(mgr.remove(&ticket.id));
        assert!(!mgr.remove(&ticket.id));
        // The sender was dropped without a decision.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_zero_timeout_falls_back_to_default() {
        let mgr = ApprovalManager::new(Duration::ZERO);
        assert_eq!(mgr.timeout(), DEFAULT_APPROVAL_TIMEOUT);
    }
}
