//! Handler registration and ordering.
//!
//! Handlers are kept per update type.  Within a type, entries registered
//! with an explicit position come first, in ascending position order; equal
//! positions keep registration order.  Entries without a position follow,
//! in registration order.  Entries registered under [`ANY_UPDATE`] run for
//! every update, after the type-specific ones.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tdlayer_client::{Client, Filter, Handler, HandlerEntry};
//!
//! fn setup(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
//!     let ping = Handler::named("ping", |client: Client, update| async move {
//!         let chat = update.chat_id().unwrap_or_default();
//!         client.invoke(tdlayer_client::Request::new("sendMessage").with("chat_id", chat)).await?;
//!         Ok::<(), tdlayer_client::HandlerError>(())
//!     });
//!     client.add_handler(
//!         HandlerEntry::new("updateNewMessage", ping)
//!             .filter(Filter::text_prefix("/ping") & Filter::incoming())
//!             .position(0)
//!             .timeout(Duration::from_secs(10)),
//!     )?;
//!     Ok(())
//! }
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::{BitAnd, BitOr, Not};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::Value;

use crate::Client;
use crate::errors::{HandlerError, RegistrationError};
use crate::update::Update;

/// Pseudo update type matching every update.
pub const ANY_UPDATE: &str = "*";

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

type Callback = dyn Fn(Client, Update) -> HandlerFuture + Send + Sync;

// ─── Handler ─────────────────────────────────────────────────────────────────

/// An async callback invoked for matching updates.
///
/// Only async callbacks can be wrapped: the constructor requires a closure
/// returning a `Future`, so a synchronous callback is rejected at compile
/// time.
///
/// Identity, which the duplicate-registration guard compares, is shared by
/// clones. Callbacks without captured state (`async fn` items, non-capturing
/// closures) are also identified by their type, so wrapping the same `async fn`
/// twice yields the same handler.
#[derive(Clone)]
pub struct Handler {
    name:     Arc<str>,
    callback: Arc<Callback>,
    type_key: Option<TypeId>,
}

impl Handler {
    /// Wrap `f`, named after its type.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F:   Fn(Client, Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::named(std::any::type_name::<F>(), f)
    }

    /// Wrap `f` under a name used in log lines.
    pub fn named<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F:   Fn(Client, Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let name: String = name.into();
        let type_key = (size_of::<F>() == 0).then(TypeId::of::<F>);
        Self {
            name:     name.into(),
            callback: Arc::new(move |client: Client, update: Update| {
                Box::pin(f(client, update)) as HandlerFuture
            }),
            type_key,
        }
    }

    pub fn name(&self) -> &str { &self.name }

    /// `true` if `other` wraps the same callback: a clone of this handler, or
    /// the same stateless callback wrapped again.
    pub fn same_as(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback)
            || matches!((self.type_key, other.type_key), (Some(a), Some(b)) if a == b)
    }

    pub(crate) fn call(&self, client: Client, update: Update) -> HandlerFuture {
        (self.callback)(client, update)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.name).finish()
    }
}

// ─── Filter ──────────────────────────────────────────────────────────────────

/// Predicate gating whether a handler runs for an update.
#[derive(Clone)]
pub struct Filter(Arc<dyn Fn(&Update) -> bool + Send + Sync>);

impl Filter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Update) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn check(&self, update: &Update) -> bool {
        (self.0)(update)
    }

    pub fn and(self, other: Filter) -> Self {
        Self::new(move |u| self.check(u) && other.check(u))
    }

    pub fn or(self, other: Filter) -> Self {
        Self::new(move |u| self.check(u) || other.check(u))
    }

    pub fn negate(self) -> Self {
        Self::new(move |u| !self.check(u))
    }

    /// Value at JSON `pointer` equals `value`.
    pub fn field_eq(pointer: impl Into<String>, value: impl Into<Value>) -> Self {
        let pointer = pointer.into();
        let value   = value.into();
        Self::new(move |u| u.pointer(&pointer) == Some(&value))
    }

    /// Update concerns chat `chat_id`.
    pub fn chat(chat_id: i64) -> Self {
        Self::new(move |u| u.chat_id() == Some(chat_id))
    }

    /// Carried message text starts with `prefix`.
    pub fn text_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(move |u| u.message_text().is_some_and(|t| t.starts_with(prefix.as_str())))
    }

    /// Carried message was not sent by this account.
    pub fn incoming() -> Self {
        Self::new(|u| !u.is_outgoing())
    }
}

impl BitAnd for Filter {
    type Output = Filter;
    fn bitand(self, rhs: Filter) -> Filter { self.and(rhs) }
}

impl BitOr for Filter {
    type Output = Filter;
    fn bitor(self, rhs: Filter) -> Filter { self.or(rhs) }
}

impl Not for Filter {
    type Output = Filter;
    fn not(self) -> Filter { self.negate() }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter(..)")
    }
}

// ─── HandlerEntry ────────────────────────────────────────────────────────────

/// One registration: which updates, which callback, under what conditions.
#[derive(Clone, Debug)]
pub struct HandlerEntry {
    update_type: String,
    handler:     Handler,
    filter:      Option<Filter>,
    position:    Option<i32>,
    timeout:     Option<Duration>,
}

impl HandlerEntry {
    pub fn new(update_type: impl Into<String>, handler: Handler) -> Self {
        Self {
            update_type: update_type.into(),
            handler,
            filter:   None,
            position: None,
            timeout:  None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter); self
    }

    pub fn position(mut self, position: i32) -> Self {
        self.position = Some(position); self
    }

    /// Cancel the callback if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout); self
    }

    pub fn update_type(&self) -> &str { &self.update_type }
    pub fn handler(&self) -> &Handler { &self.handler }
    pub fn get_position(&self) -> Option<i32> { self.position }
    pub fn get_timeout(&self) -> Option<Duration> { self.timeout }

    /// `true` if there is no filter or the filter accepts `update`.
    pub fn accepts(&self, update: &Update) -> bool {
        self.filter.as_ref().is_none_or(|f| f.check(update))
    }
}

// ─── HandlerRegistry ─────────────────────────────────────────────────────────

/// Per-update-type ordered handler lists.
///
/// Registration may happen while the dispatcher is running; readers get a
/// snapshot so a concurrent insert never disturbs an in-progress fan-out.
#[derive(Default)]
pub struct HandlerRegistry {
    by_type: RwLock<HashMap<String, Vec<Arc<HandlerEntry>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self { Self::default() }

    /// Register `handler` for `update_type` with the given options.
    pub fn register(
        &self,
        update_type: &str,
        handler:     Handler,
        filter:      Option<Filter>,
        position:    Option<i32>,
        timeout:     Option<Duration>,
    ) -> Result<(), RegistrationError> {
        let mut entry = HandlerEntry::new(update_type, handler);
        entry.filter   = filter;
        entry.position = position;
        entry.timeout  = timeout;
        self.insert(entry)
    }

    /// Insert a prepared entry at its ordered place.
    ///
    /// Fails if the same handler is already registered for the same type.
    pub fn insert(&self, entry: HandlerEntry) -> Result<(), RegistrationError> {
        if entry.update_type.is_empty() {
            return Err(RegistrationError::EmptyUpdateType);
        }
        let mut by_type = self.write();
        let list = by_type.entry(entry.update_type.clone()).or_default();
        if list.iter().any(|e| e.handler.same_as(&entry.handler)) {
            return Err(RegistrationError::Duplicate { update_type: entry.update_type });
        }
        let idx = match entry.position {
            None    => list.len(),
            Some(p) => list.partition_point(|e| matches!(e.position, Some(q) if q <= p)),
        };
        tracing::debug!(
            "[handlers] {} registered for {} at index {idx}",
            entry.handler.name(), entry.update_type,
        );
        list.insert(idx, Arc::new(entry));
        Ok(())
    }

    /// Remove `handler` from `update_type`. Returns whether anything was removed.
    pub fn remove(&self, update_type: &str, handler: &Handler) -> bool {
        let mut by_type = self.write();
        let Some(list) = by_type.get_mut(update_type) else { return false };
        let before = list.len();
        list.retain(|e| !e.handler.same_as(handler));
        let removed = list.len() != before;
        if list.is_empty() {
            by_type.remove(update_type);
        }
        removed
    }

    /// Entries registered for exactly `update_type`, in run order.
    pub fn get(&self, update_type: &str) -> Vec<Arc<HandlerEntry>> {
        self.read().get(update_type).cloned().unwrap_or_default()
    }

    /// Entries to run for an update of `update_type`: its own, then catch-alls.
    pub fn matching(&self, update_type: &str) -> Vec<Arc<HandlerEntry>> {
        let by_type = self.read();
        let own = by_type.get(update_type).into_iter().flatten();
        let any = by_type.get(ANY_UPDATE).into_iter().flatten();
        own.chain(any).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Arc<HandlerEntry>>>> {
        self.by_type.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Arc<HandlerEntry>>>> {
        self.by_type.write().unwrap_or_else(PoisonError::into_inner)
    }
}
