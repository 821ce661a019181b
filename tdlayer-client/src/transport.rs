//! The port to the native JSON library.
//!
//! Implement [`TransportPort`] over the native shared library (or anything
//! else that speaks the same JSON objects) and hand it to
//! [`crate::Client::new`]. [`MemoryTransport`] is an in-process
//! implementation for tests and demos.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::errors::TransportError;

/// Identifier of one native-library session.
pub type InstanceId = i64;

/// Key the native library stamps on every inbound object to name its instance.
pub const CLIENT_ID_FIELD: &str = "@client_id";

/// The four operations the dispatch core needs from the native layer.
///
/// `receive` may block for up to `timeout`; the dispatcher always calls it
/// from the blocking thread pool.
pub trait TransportPort: Send + Sync + 'static {
    /// Create the session handle. Failure here is fatal.
    fn create_instance(&self) -> Result<InstanceId, TransportError>;

    /// Queue `request` for `instance`. Does not wait for an answer.
    fn send(&self, instance: InstanceId, request: &Value) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next inbound object.
    fn receive(&self, timeout: Duration) -> Option<Value>;

    /// Run a request synchronously. Only valid for a small allowlist of types.
    fn execute(&self, request: &Value) -> Option<Value>;
}

// ─── MemoryTransport ─────────────────────────────────────────────────────────

type Responder = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

struct MemoryState {
    inbox:         VecDeque<Value>,
    sent:          Vec<Value>,
    next_instance: InstanceId,
    instance:      Option<InstanceId>,
    fail_create:   Option<String>,
    responder:     Option<Responder>,
}

/// In-process loopback standing in for the native library.
///
/// Inbound objects are queued with [`push`](Self::push); everything the
/// client sends is recorded and available from [`sent`](Self::sent).
/// An optional responder plays the native side: each outgoing request is
/// passed to it and whatever it returns is queued as a reply, with the
/// request's correlation field copied across.
///
/// ```rust
/// use serde_json::json;
/// use tdlayer_client::MemoryTransport;
///
/// let transport = MemoryTransport::new().with_responder(|req| {
///     (req["@type"] == "getMe").then(|| json!({"@type": "user", "id": 1}))
/// });
/// ```
pub struct MemoryTransport {
    state:             Mutex<MemoryState>,
    ready:             Condvar,
    correlation_field: String,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                inbox:         VecDeque::new(),
                sent:          Vec::new(),
                next_instance: 1,
                instance:      None,
                fail_create:   None,
                responder:     None,
            }),
            ready:             Condvar::new(),
            correlation_field: crate::DEFAULT_CORRELATION_FIELD.to_string(),
        }
    }

    /// Copy `field` (instead of `@extra`) from requests into responder replies.
    pub fn with_correlation_field(mut self, field: impl Into<String>) -> Self {
        self.correlation_field = field.into();
        self
    }

    /// Answer outgoing requests (and synchronous executes) with `f`.
    pub fn with_responder<F>(self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.lock().responder = Some(Box::new(f));
        self
    }

    /// Make `create_instance` fail, as an unreachable native library would.
    pub fn fail_create(self, reason: impl Into<String>) -> Self {
        self.lock().fail_create = Some(reason.into());
        self
    }

    /// Queue an inbound object and wake a waiting `receive`.
    pub fn push(&self, value: Value) {
        self.lock().inbox.push_back(value);
        self.ready.notify_one();
    }

    /// Every request sent so far, in order.
    pub fn sent(&self) -> Vec<Value> {
        self.lock().sent.clone()
    }

    /// The instance handed out by `create_instance`, if any.
    pub fn instance(&self) -> Option<InstanceId> {
        self.lock().instance
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self { Self::new() }
}

impl TransportPort for MemoryTransport {
    fn create_instance(&self) -> Result<InstanceId, TransportError> {
        let mut state = self.lock();
        if let Some(reason) = &state.fail_create {
            return Err(TransportError::Unavailable(reason.clone()));
        }
        let id = state.next_instance;
        state.next_instance += 1;
        state.instance = Some(id);
        Ok(id)
    }

    fn send(&self, instance: InstanceId, request: &Value) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.sent.push(request.clone());
        let reply = state.responder.as_ref().and_then(|f| f(request));
        if let Some(mut reply) = reply {
            if let Value::Object(obj) = &mut reply {
                if let Some(extra) = request.get(&self.correlation_field) {
                    obj.entry(self.correlation_field.clone()).or_insert_with(|| extra.clone());
                }
                obj.entry(CLIENT_ID_FIELD).or_insert_with(|| Value::from(instance));
            }
            state.inbox.push_back(reply);
            self.ready.notify_one();
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(v) = state.inbox.pop_front() {
                return Some(v);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn execute(&self, request: &Value) -> Option<Value> {
        let state = self.lock();
        state.responder.as_ref().and_then(|f| f(request))
    }
}
