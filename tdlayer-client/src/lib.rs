//! # tdlayer-client
//!
//! Async client core over a native messaging library that speaks JSON
//! objects tagged with `@type`.
//!
//! ## Features
//! - Request/response correlation through a per-request id echoed by the library
//! - Awaitable, inspectable [`Response`]s — error objects are values, not panics
//! - Ordered, filtered, timeout-bound update handlers per update type
//! - Rate-limit (`"Too Many Requests: retry after N"`) auto-retry policy
//! - Synchronous `execute` for the library's allowlisted calls
//! - Clean shutdown: pending requests settle with an "instance closed" error
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tdlayer_client::{Client, Config, MemoryTransport, Request};
//!
//! # async fn f() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(Arc::new(MemoryTransport::new()), Config::default())?;
//! client.start();
//! let me = client.invoke(Request::new("getMe")).await?;
//! if me.is_error() {
//!     eprintln!("getMe failed: {:?}", me.error());
//! }
//! client.stop().await;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod correlator;
mod dispatcher;
mod errors;
mod request;
mod result;
mod retry;
mod state;
pub mod handlers;
pub mod transport;
pub mod update;

pub use correlator::{CorrelationId, Correlator};
pub use dispatcher::DispatcherState;
pub use errors::{HandlerError, InvocationError, RegistrationError, RpcError, TransportError};
pub use handlers::{ANY_UPDATE, Filter, Handler, HandlerEntry, HandlerRegistry};
pub use request::{Request, TYPE_FIELD};
pub use result::{CLOSED_CODE, ERROR_TYPE, Response, ResultFuture};
pub use retry::{AutoSleep, NoRetries, RetryContext, RetryPolicy};
pub use transport::{InstanceId, MemoryTransport, TransportPort};
pub use update::Update;

use std::future::Future;
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use dispatcher::Dispatcher;
use state::SessionState;

/// Wire key the library echoes back on responses.
pub const DEFAULT_CORRELATION_FIELD: &str = "@extra";

/// Request types the native library can answer without an instance.
pub const SYNCHRONOUS_REQUESTS: &[&str] = &[
    "getOption",
    "getTextEntities",
    "parseTextEntities",
    "parseMarkdown",
    "getMarkdownText",
    "searchQuote",
    "getFileMimeType",
    "getFileExtension",
    "cleanFileName",
    "getLanguagePackString",
    "getPhoneNumberInfoSync",
    "getCountryFlagEmoji",
    "getJsonValue",
    "getJsonString",
    "getThemeParametersJsonString",
    "getPushReceiverId",
    "searchStringsByPrefix",
    "setLogStream",
    "getLogStream",
    "setLogVerbosityLevel",
    "getLogVerbosityLevel",
    "getLogTags",
    "setLogTagVerbosityLevel",
    "getLogTagVerbosityLevel",
    "addLogMessage",
    "testReturnError",
];

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`Client::new`].
#[derive(Clone)]
pub struct Config {
    /// Upper bound of one blocking receive; also bounds shutdown latency.
    pub poll_timeout:            Duration,
    /// Field carrying the correlation id on requests and responses.
    pub correlation_field:       String,
    /// How [`Client::invoke`] reacts to rate-limit errors (default: [`AutoSleep`]).
    pub retry_policy:            Arc<dyn RetryPolicy>,
    /// Timeout for handlers registered without one (default: none).
    pub default_handler_timeout: Option<Duration>,
    /// Keep the option / authorization-state cache current (default: true).
    pub track_session_state:     bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_timeout:            Duration::from_secs(1),
            correlation_field:       DEFAULT_CORRELATION_FIELD.to_string(),
            retry_policy:            Arc::new(AutoSleep::default()),
            default_handler_timeout: None,
            track_session_state:     true,
        }
    }
}

// ─── ClientInner ─────────────────────────────────────────────────────────────

struct ClientInner {
    transport:               Arc<dyn TransportPort>,
    instance:                InstanceId,
    correlator:              Arc<Correlator>,
    registry:                Arc<HandlerRegistry>,
    session:                 Arc<SessionState>,
    state:                   Arc<watch::Sender<DispatcherState>>,
    task:                    Mutex<Option<JoinHandle<()>>>,
    poll_timeout:            Duration,
    correlation_field:       String,
    retry_policy:            Arc<dyn RetryPolicy>,
    default_handler_timeout: Option<Duration>,
    track_session_state:     bool,
}

/// Handle to one native-library instance. Cheap to clone — internally Arc-wrapped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Create the native instance. Transport failure is returned immediately.
    ///
    /// The dispatcher is not running yet; register handlers, then call
    /// [`start`](Self::start).
    pub fn new(transport: Arc<dyn TransportPort>, config: Config) -> Result<Self, InvocationError> {
        let instance = transport.create_instance()?;
        tracing::info!("[tdlayer] created instance {instance}");
        let (state, _) = watch::channel(DispatcherState::NotStarted);
        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                instance,
                correlator:              Correlator::new(),
                registry:                Arc::new(HandlerRegistry::new()),
                session:                 Arc::new(SessionState::default()),
                state:                   Arc::new(state),
                task:                    Mutex::new(None),
                poll_timeout:            config.poll_timeout,
                correlation_field:       config.correlation_field,
                retry_policy:            config.retry_policy,
                default_handler_timeout: config.default_handler_timeout,
                track_session_state:     config.track_session_state,
            }),
        })
    }

    /// Spawn the dispatcher on the current tokio runtime.
    ///
    /// Does nothing unless the dispatcher is still `NotStarted`.
    pub fn start(&self) {
        let started = self.inner.state.send_if_modified(|s| {
            if *s == DispatcherState::NotStarted {
                *s = DispatcherState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }
        let inner = &self.inner;
        let dispatcher = Dispatcher {
            transport:         inner.transport.clone(),
            instance:          inner.instance,
            correlator:        inner.correlator.clone(),
            registry:          inner.registry.clone(),
            session:           inner.track_session_state.then(|| inner.session.clone()),
            state:             inner.state.clone(),
            poll_timeout:      inner.poll_timeout,
            correlation_field: inner.correlation_field.clone(),
            default_timeout:   inner.default_handler_timeout,
        };
        let handle = tokio::spawn(dispatcher.run(self.clone()));
        *inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the dispatcher and settle every pending request with an
    /// "instance closed" error. Returns once the dispatcher is `Stopped`.
    pub async fn stop(&self) {
        let mut never_started = false;
        self.inner.state.send_if_modified(|s| match *s {
            DispatcherState::Running => {
                *s = DispatcherState::Stopping;
                true
            }
            DispatcherState::NotStarted => {
                never_started = true;
                false
            }
            _ => false,
        });
        if never_started {
            self.inner.correlator.abandon_all(RpcError::new(CLOSED_CODE, "Instance closed"));
            self.inner.state.send_replace(DispatcherState::Stopped);
            tracing::info!("[tdlayer] instance {} closed before start", self.inner.instance);
            return;
        }
        self.wait_stopped().await;
        let task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Resolve once the dispatcher reaches `Stopped`.
    pub fn wait_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.state.subscribe();
        async move {
            let _ = rx.wait_for(|s| *s == DispatcherState::Stopped).await;
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.inner.state.borrow()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance
    }

    // ── Requests ───────────────────────────────────────────────────────────

    /// Send `request` and return the future for its response.
    ///
    /// No retries: an error response is delivered as-is.
    pub fn send(&self, mut request: Request) -> Result<ResultFuture, InvocationError> {
        let (id, fut) = self.inner.correlator.register();
        if self.inner.correlator.is_closed() {
            return Ok(fut);
        }
        request.set(&self.inner.correlation_field, id.to_wire());
        tracing::debug!("[tdlayer] → {} (id {id})", request.type_name());
        // Dropping `fut` on failure releases the correlation entry.
        self.inner.transport.send(self.inner.instance, &request.to_value())?;
        Ok(fut)
    }

    /// Send `request`, await the response, and retry rate-limited calls
    /// according to the configured [`RetryPolicy`].
    ///
    /// Only transport failures are `Err`; error objects come back as a
    /// [`Response`] with `is_error() == true`.
    pub async fn invoke(&self, request: Request) -> Result<Response, InvocationError> {
        let mut fail_count   = NonZeroU32::MIN;
        let mut slept_so_far = Duration::default();
        loop {
            let response = self.send(request.clone())?.await;
            let error = match response.error() {
                Some(e) if !response.is_closed() => e.clone(),
                _ => return Ok(response),
            };
            let ctx = RetryContext { fail_count, slept_so_far, error };
            match self.inner.retry_policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    sleep(delay).await;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => return Ok(response),
            }
        }
    }

    /// Run an allowlisted request synchronously, bypassing correlation.
    pub fn execute(&self, request: &Request) -> Result<Option<Response>, InvocationError> {
        if !SYNCHRONOUS_REQUESTS.contains(&request.type_name()) {
            return Err(InvocationError::NotSynchronous(request.type_name().to_string()));
        }
        Ok(self.inner.transport.execute(&request.to_value()).map(Response::from_value))
    }

    // ── Handlers ───────────────────────────────────────────────────────────

    /// Register a prepared [`HandlerEntry`].
    pub fn add_handler(&self, entry: HandlerEntry) -> Result<(), RegistrationError> {
        self.inner.registry.insert(entry)
    }

    /// Shorthand: register `f` for `update_type` with no filter, position or timeout.
    ///
    /// Returns the [`Handler`] so it can be removed later.
    pub fn on<F, Fut>(&self, update_type: &str, f: F) -> Result<Handler, RegistrationError>
    where
        F:   Fn(Client, Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Handler::named(update_type, f);
        self.add_handler(HandlerEntry::new(update_type, handler.clone()))?;
        Ok(handler)
    }

    pub fn remove_handler(&self, update_type: &str, handler: &Handler) -> bool {
        self.inner.registry.remove(update_type, handler)
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    // ── Session state ──────────────────────────────────────────────────────

    /// Latest value announced for option `name` via `updateOption`.
    pub fn option(&self, name: &str) -> Option<Value> {
        self.inner.session.option(name)
    }

    /// `@type` of the latest `updateAuthorizationState`.
    pub fn authorization_state(&self) -> Option<String> {
        self.inner.session.authorization_state()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("instance", &self.inner.instance)
            .field("state", &self.state())
            .finish()
    }
}
