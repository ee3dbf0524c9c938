//! Typed fan-out event bus for live dashboard streams.
//!
//! Two channels: log entries and approval events. Each subscriber gets a
//! bounded buffer; `publish` never blocks — a full subscriber simply misses
//! the event (slow consumers re-query the store to recover). Publishing
//! takes the subscriber table's read lock, subscribe/unsubscribe take the
//! write lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::store::{ApprovalEvent, LogEntry};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_BUFFER: usize = 256;

struct BusInner {
    buffer: usize,
    log_subs: RwLock<HashMap<String, mpsc::Sender<Arc<LogEntry>>>>,
    approval_subs: RwLock<HashMap<String, mpsc::Sender<Arc<ApprovalEvent>>>>,
}

/// Fan-out publish/subscribe hub. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer (zero falls back to
    /// [`DEFAULT_BUFFER`]).
    pub fn new(buffer: usize) -> Self {
        let buffer = if buffer == 0 { DEFAULT_BUFFER } else { buffer };
        Self {
            inner: Arc::new(BusInner {
                buffer,
                log_subs: RwLock::new(HashMap::new()),
                approval_subs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to log entries. Dropping (or explicitly unsubscribing) the
    /// returned guard closes the stream.
    pub fn subscribe(&self, id: impl Into<String>) -> (mpsc::Receiver<Arc<LogEntry>>, Subscription) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        write(&self.inner.log_subs).insert(id.clone(), tx);
        (
            rx,
            Subscription {
                inner: Arc::clone(&self.inner),
                id,
                kind: SubKind::Log,
                active: true,
            },
        )
    }

    /// Subscribe to approval events.
    pub fn subscribe_approvals(
        &self,
        id: impl Into<String>,
    ) -> (mpsc::Receiver<Arc<ApprovalEvent>>, Subscription) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        write(&self.inner.approval_subs).insert(id.clone(), tx);
        (
            rx,
            Subscription {
                inner: Arc::clone(&self.inner),
                id,
                kind: SubKind::Approval,
                active: true,
            },
        )
    }

    /// Deliver a log entry to all subscribers. Non-blocking; full buffers
    /// drop the delivery.
    pub fn publish(&self, entry: Arc<LogEntry>) {
        let subs = read(&self.inner.log_subs);
        for tx in subs.values() {
            let _ = tx.try_send(Arc::clone(&entry));
        }
    }

    /// Deliver an approval event to all approval subscribers.
    pub fn publish_approval(&self, event: Arc<ApprovalEvent>) {
        let subs = read(&self.inner.approval_subs);
        for tx in subs.values() {
            let _ = tx.try_send(Arc::clone(&event));
        }
    }

    /// Number of active log-entry subscribers.
    pub fn subscriber_count(&self) -> usize {
        read(&self.inner.log_subs).len()
    }
}

enum SubKind {
    Log,
    Approval,
}

/// Handle for one subscription; removing it closes the receive channel.
pub struct Subscription {
    inner: Arc<BusInner>,
    id: String,
    kind: SubKind,
    active: bool,
}

impl Subscription {
    /// Explicitly end the subscription.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        match self.kind {
            SubKind::Log => {
                write(&self.inner.log_subs).remove(&self.id);
            }
            SubKind::Approval => {
                write(&self.inner.approval_subs).remove(&self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
