//! The receive loop.
//!
//! One dispatcher runs per instance. It polls [`TransportPort::receive`]
//! with a bounded timeout and routes every object it gets:
//!
//! * objects carrying one of our correlation ids settle the matching
//!   [`crate::ResultFuture`] (or are dropped if nobody waits any more);
//! * everything else is an [`Update`] and fans out to the registered
//!   handlers, each on its own task.
//!
//! Handlers for one update are *started* in registration order: each handler
//! task is held back until the previous one has been polled once, so the
//! body of handler `i` always begins before that of handler `i + 1`, even on
//! a multi-threaded runtime. After that first poll every handler runs as an
//! independent task and completion order is not guaranteed.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::Client;
use crate::correlator::{CorrelationId, Correlator};
use crate::errors::RpcError;
use crate::errors::HandlerError;
use crate::handlers::{HandlerEntry, HandlerFuture, HandlerRegistry};
use crate::result::CLOSED_CODE;
use crate::state::SessionState;
use crate::transport::{CLIENT_ID_FIELD, InstanceId, TransportPort};
use crate::update::Update;

/// Lifecycle of the receive loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    NotStarted,
    Running,
    /// Exit requested; the loop leaves after the current receive returns.
    Stopping,
    Stopped,
}

pub(crate) struct Dispatcher {
    pub(crate) transport:         Arc<dyn TransportPort>,
    pub(crate) instance:          InstanceId,
    pub(crate) correlator:        Arc<Correlator>,
    pub(crate) registry:          Arc<HandlerRegistry>,
    pub(crate) session:           Option<Arc<SessionState>>,
    pub(crate) state:             Arc<watch::Sender<DispatcherState>>,
    pub(crate) poll_timeout:      Duration,
    pub(crate) correlation_field: String,
    pub(crate) default_timeout:   Option<Duration>,
}

/// What to do with one inbound object.
#[derive(Debug, PartialEq)]
pub(crate) enum Route {
    Response(CorrelationId),
    Update,
    Foreign(InstanceId),
}

impl Dispatcher {
    pub(crate) async fn run(self, client: Client) {
        tracing::info!("[dispatcher] running for instance {}", self.instance);
        loop {
            if *self.state.borrow() != DispatcherState::Running {
                break;
            }
            let transport = self.transport.clone();
            let timeout   = self.poll_timeout;
            let received  = tokio::task::spawn_blocking(move || transport.receive(timeout)).await;
            match received {
                Ok(Some(obj)) => self.route(&client, obj),
                Ok(None)      => {}
                Err(e) if e.is_cancelled() => {
                    tracing::warn!("[dispatcher] receive cancelled, runtime shutting down");
                    break;
                }
                Err(e) => tracing::error!("[dispatcher] receive panicked: {e}"),
            }
        }

        self.state.send_replace(DispatcherState::Stopping);
        self.correlator.abandon_all(RpcError::new(CLOSED_CODE, "Instance closed"));
        self.state.send_replace(DispatcherState::Stopped);
        tracing::info!("[dispatcher] stopped for instance {}", self.instance);
    }

    pub(crate) fn classify(&self, obj: &Value) -> Route {
        if let Some(owner) = obj.get(CLIENT_ID_FIELD).and_then(Value::as_i64) {
            if owner != self.instance {
                return Route::Foreign(owner);
            }
        }
        match obj.get(&self.correlation_field).and_then(CorrelationId::from_wire) {
            Some(id) => Route::Response(id),
            None     => Route::Update,
        }
    }

    fn route(&self, client: &Client, obj: Value) {
        match self.classify(&obj) {
            Route::Foreign(owner) => {
                tracing::warn!("[dispatcher] dropping object for instance {owner}");
            }
            Route::Response(id) => {
                if !self.correlator.resolve(id, obj) {
                    tracing::debug!("[dispatcher] dropped late response for id {id}");
                }
            }
            Route::Update => self.fan_out(client, Update::new(obj)),
        }
    }

    fn fan_out(&self, client: &Client, update: Update) {
        if let Some(session) = &self.session {
            session.observe(&update);
        }
        let entries = self.registry.matching(update.type_name());
        tracing::debug!("[dispatcher] {} → {} handler(s)", update.type_name(), entries.len());
        // Fires once the previously spawned handler has been polled.
        let mut gate = None;
        for entry in entries {
            match catch_unwind(AssertUnwindSafe(|| entry.accepts(&update))) {
                Ok(true)  => gate = self.spawn_handler(client.clone(), entry, update.clone(), gate),
                Ok(false) => {}
                Err(_)    => tracing::error!(
                    "[dispatcher] filter of {} panicked on {}; skipping",
                    entry.handler().name(), update.type_name(),
                ),
            }
        }
    }

    /// Call `entry`'s callback and supervise the returned future on its own task.
    ///
    /// The task waits for `gate` before its first poll. Returns the gate for
    /// the next handler, or `gate` itself if nothing was spawned.
    fn spawn_handler(
        &self,
        client: Client,
        entry:  Arc<HandlerEntry>,
        update: Update,
        gate:   Option<oneshot::Receiver<()>>,
    ) -> Option<oneshot::Receiver<()>> {
        let type_name = update.type_name().to_string();
        let fut = match catch_unwind(AssertUnwindSafe(|| entry.handler().call(client, update))) {
            Ok(fut) => fut,
            Err(_)  => {
                tracing::error!("[dispatcher] handler {} panicked on {type_name}", entry.handler().name());
                return gate;
            }
        };
        let (started_tx, started_rx) = oneshot::channel();
        let timeout = entry.get_timeout().or(self.default_timeout);
        let task    = tokio::spawn(async move {
            if let Some(gate) = gate {
                // A dropped sender (predecessor aborted or panicked) also opens the gate.
                let _ = gate.await;
            }
            SignalStart { inner: fut, started: Some(started_tx) }.await
        });
        tokio::spawn(supervise(entry, type_name, task, timeout));
        Some(started_rx)
    }
}

/// Polls `inner`, firing `started` as soon as the first poll returns.
struct SignalStart {
    inner:   HandlerFuture,
    started: Option<oneshot::Sender<()>>,
}

impl Future for SignalStart {
    type Output = Result<(), HandlerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let poll = this.inner.as_mut().poll(cx);
        if let Some(started) = this.started.take() {
            let _ = started.send(());
        }
        poll
    }
}

async fn supervise(
    entry:     Arc<HandlerEntry>,
    type_name: String,
    mut task:  JoinHandle<Result<(), HandlerError>>,
    timeout:   Option<Duration>,
) {
    let name = entry.handler().name();
    let joined = match timeout {
        None        => task.await,
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                tracing::warn!("[dispatcher] handler {name} timed out after {limit:?} on {type_name}; cancelled");
                return;
            }
        },
    };
    match joined {
        Ok(Ok(()))                => {}
        Ok(Err(e))                => tracing::error!("[dispatcher] handler {name} failed on {type_name}: {e}"),
        Err(e) if e.is_panic()    => tracing::error!("[dispatcher] handler {name} panicked on {type_name}"),
        Err(_)                    => tracing::warn!("[dispatcher] handler {name} cancelled on {type_name}"),
    }
}
