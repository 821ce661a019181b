//! Request/response correlation.
//!
//! Every outgoing request gets a fresh [`CorrelationId`] written into its
//! correlation field; the native library echoes that field back on the
//! answer and the dispatcher hands the answer to [`Correlator::resolve`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::errors::RpcError;
use crate::result::{ResultFuture, Response};

// ─── CorrelationId ───────────────────────────────────────────────────────────

/// Process-unique token linking a request to its response.
///
/// Allocated from a monotonic counter and never reused.  On the wire it is a
/// decimal string (`"42"`); plain JSON numbers are accepted on the way back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn to_wire(self) -> Value {
        Value::String(self.0.to_string())
    }

    /// Parse an echoed correlation value. Anything that isn't one of ours yields `None`.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => s.parse().ok().map(Self),
            Value::Number(n) => n.as_u64().map(Self),
            _                => None,
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Correlator ──────────────────────────────────────────────────────────────

struct Pending {
    next:    u64,
    waiters: HashMap<CorrelationId, oneshot::Sender<Response>>,
    closed:  Option<RpcError>,
}

/// Owns the map from correlation id to pending [`ResultFuture`].
///
/// The map is behind a mutex: registration happens on caller tasks while
/// resolution happens on the dispatcher task, possibly on another worker.
/// The lock is never held across an `.await`.
pub struct Correlator {
    pending: Mutex<Pending>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Pending {
                next:    1,
                waiters: HashMap::new(),
                closed:  None,
            }),
        })
    }

    /// Allocate a fresh id and the future that will receive its response.
    ///
    /// After [`abandon_all`](Self::abandon_all) the returned future is
    /// already settled with the shutdown error.
    pub fn register(self: &Arc<Self>) -> (CorrelationId, ResultFuture) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        let id = CorrelationId(pending.next);
        pending.next += 1;
        match pending.closed.clone() {
            Some(err) => { let _ = tx.send(Response::abandoned(&err)); }
            None      => { pending.waiters.insert(id, tx); }
        }
        drop(pending);
        (id, ResultFuture::new(id, rx, Arc::downgrade(self)))
    }

    /// Settle the future registered under `id` with `payload`.
    ///
    /// Returns `false` when nothing is waiting for `id` (already resolved,
    /// abandoned by its caller, or never issued); the payload is dropped.
    pub fn resolve(&self, id: CorrelationId, payload: Value) -> bool {
        let Some(tx) = self.lock().waiters.remove(&id) else {
            tracing::debug!("[correlator] no pending request for id {id}");
            return false;
        };
        let response = Response::from_value(payload);
        if response.is_error() {
            tracing::debug!("[correlator] id {id} resolved with {:?}", response.error());
        }
        // The receiver may have been dropped in the meantime; nothing to do then.
        let _ = tx.send(response);
        true
    }

    /// Drop the entry for `id` without settling it.
    pub(crate) fn forget(&self, id: CorrelationId) {
        self.lock().waiters.remove(&id);
    }

    /// Settle every pending future with `error` and refuse new registrations.
    ///
    /// Returns how many futures were abandoned.
    pub fn abandon_all(&self, error: RpcError) -> usize {
        let waiters = {
            let mut pending = self.lock();
            pending.closed = Some(error.clone());
            std::mem::take(&mut pending.waiters)
        };
        let n = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Response::abandoned(&error));
        }
        if n > 0 {
            tracing::info!("[correlator] abandoned {n} pending request(s): {error}");
        }
        n
    }

    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.lock().waiters.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
