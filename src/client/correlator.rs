//! Pending-call correlator.
//!
//! Maps a [`CorrelationId`] to the one caller waiting for it. A reply is
//! delivered by removing exactly that entry; a reply whose entry is gone
//! (unknown id, already answered, timed out) is logged and dropped and can
//! never settle someone else's call.
//!
//! Every call carries a deadline. [`Waiter::wait`] enforces it for the
//! caller, and dropping a [`Waiter`] removes its entry, so cancelling the
//! caller's future frees the slot too. A reaper task sweeps anything left
//! behind.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::protocol::CorrelationId;

/// Outcome delivered to a waiting call.
pub type CallResult = Result<Value, ClientError>;

type PendingMap = HashMap<CorrelationId, PendingCall>;

#[derive(Debug)]
struct PendingCall {
    created_at: Instant,
    deadline: Instant,
    sink: oneshot::Sender<CallResult>,
}

/// Table of outstanding correlated calls.
#[derive(Debug, Clone)]
pub struct Correlator {
    pending: Arc<Mutex<PendingMap>>,
    default_timeout: Duration,
}

impl Correlator {
    /// Correlator whose calls time out after `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    /// Register a call with the default timeout.
    pub fn register(&self) -> (CorrelationId, Waiter) {
        self.register_with_timeout(self.default_timeout)
    }

    /// Register a call that expires after `timeout`.
    pub fn register_with_timeout(&self, timeout: Duration) -> (CorrelationId, Waiter) {
        let (sink, rx) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + timeout;

        let mut pending = lock(&self.pending);
        let mut id = CorrelationId::random();
        while pending.contains_key(&id) {
            id = CorrelationId::random();
        }
        pending.insert(
            id.clone(),
            PendingCall {
                created_at,
                deadline,
                sink,
            },
        );
        drop(pending);

        log::trace!("[Correlator] Registered {id}");
        let waiter = Waiter {
            id: id.clone(),
            rx,
            deadline,
            timeout,
            pending: Arc::downgrade(&self.pending),
        };
        (id, waiter)
    }

    /// Deliver `payload` to the call registered under `id`.
    ///
    /// Returns `false` when no such call is outstanding.
    pub fn resolve(&self, id: &CorrelationId, payload: Value) -> bool {
        let Some(call) = lock(&self.pending).remove(id) else {
            log::debug!("[Correlator] Dropping reply for unknown or expired call {id}");
            return false;
        };
        log::trace!(
            "[Correlator] Resolved {id} after {:?}",
            call.created_at.elapsed()
        );
        if call.sink.send(Ok(payload)).is_err() {
            log::debug!("[Correlator] Caller for {id} went away before its reply");
        }
        true
    }

    /// Fail the call registered under `id` with `reason`.
    pub fn cancel(&self, id: &CorrelationId, reason: ClientError) -> bool {
        match lock(&self.pending).remove(id) {
            Some(call) => {
                let _ = call.sink.send(Err(reason));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding call with `reason`; returns how many.
    pub fn cancel_all(&self, reason: &ClientError) -> usize {
        let drained: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.sink.send(Err(reason.clone()));
        }
        if count > 0 {
            log::debug!("[Correlator] Cancelled {count} pending call(s): {reason}");
        }
        count
    }

    /// Time out every call past its deadline; returns how many.
    pub fn reap_expired(&self) -> usize {
        reap(&self.pending, Instant::now())
    }

    /// Sweep expired calls every `interval` until the correlator is dropped.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let pending = Arc::downgrade(&self.pending);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pending) = pending.upgrade() else {
                    break;
                };
                reap(&pending, Instant::now());
            }
        })
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: &CorrelationId) -> bool {
        lock(&self.pending).contains_key(id)
    }
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reap(pending: &Mutex<PendingMap>, now: Instant) -> usize {
    let expired: Vec<(CorrelationId, PendingCall)> = {
        let mut pending = lock(pending);
        let ids: Vec<CorrelationId> = pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
            .collect()
    };

    let count = expired.len();
    for (id, call) in expired {
        log::debug!("[Correlator] Call {id} expired");
        let timeout = call.deadline - call.created_at;
        let _ = call.sink.send(Err(ClientError::Timeout(timeout)));
    }
    count
}

/// The caller's end of a pending call.
///
/// Dropping it without waiting withdraws the call.
#[derive(Debug)]
pub struct Waiter {
    id: CorrelationId,
    rx: oneshot::Receiver<CallResult>,
    deadline: Instant,
    timeout: Duration,
    pending: Weak<Mutex<PendingMap>>,
}

impl Waiter {
    /// Id the reply must carry.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the reply, failing with [`ClientError::Timeout`] at the
    /// deadline.
    pub async fn wait(mut self) -> CallResult {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Cancelled("correlator dropped".to_string())),
            Err(_) => {
                log::debug!("[Correlator] Call {} timed out", self.id);
                Err(ClientError::Timeout(self.timeout))
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade() {
            lock(&pending).remove(&self.id);
        }
    }
}
