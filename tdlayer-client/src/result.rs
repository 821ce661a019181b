//! Outcomes of outgoing requests.
//!
//! [`ResultFuture`] is what a caller awaits; it settles into a [`Response`],
//! which is either the native library's answer or an error object. Error
//! responses are values, not Rust errors: branch on [`Response::is_error`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::correlator::{CorrelationId, Correlator};
use crate::errors::{InvocationError, RpcError};
use crate::request::TYPE_FIELD;

/// `@type` of error objects.
pub const ERROR_TYPE: &str = "error";

/// Code carried by the synthetic error given to requests abandoned at shutdown.
pub const CLOSED_CODE: i32 = 500;

// ─── Response ────────────────────────────────────────────────────────────────

/// The settled outcome of one request.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    raw:    Value,
    error:  Option<RpcError>,
    closed: bool,
}

impl Response {
    /// Classify a raw object by its `@type`.
    pub fn from_value(raw: Value) -> Self {
        let error = (raw.get(TYPE_FIELD).and_then(Value::as_str) == Some(ERROR_TYPE))
            .then(|| RpcError::from_object(&raw));
        Self { raw, error, closed: false }
    }

    /// Synthetic error for a request that will never be answered.
    pub(crate) fn abandoned(error: &RpcError) -> Self {
        let raw = json!({
            TYPE_FIELD: ERROR_TYPE,
            "code":     error.code,
            "message":  error.message,
        });
        Self { raw, error: Some(error.clone()), closed: true }
    }

    /// The error used when the instance goes away under a pending request.
    pub(crate) fn closed() -> Self {
        Self::abandoned(&RpcError::new(CLOSED_CODE, "Instance closed"))
    }

    /// `true` if the library answered with an error object, or the request was abandoned.
    pub fn is_error(&self) -> bool { self.error.is_some() }

    /// `true` if the request was abandoned because the instance shut down.
    pub fn is_closed(&self) -> bool { self.closed }

    /// The payload's `@type`.
    pub fn type_name(&self) -> &str {
        self.raw.get(TYPE_FIELD).and_then(Value::as_str).unwrap_or_default()
    }

    /// The raw payload. On an error response this is the error object itself.
    pub fn result(&self) -> &Value { &self.raw }

    pub fn get(&self, key: &str) -> Option<&Value> { self.raw.get(key) }

    pub fn error(&self) -> Option<&RpcError> { self.error.as_ref() }

    /// Seconds to wait for a rate-limit error, `0` otherwise.
    pub fn retry_after(&self) -> u64 {
        self.error.as_ref().map_or(0, RpcError::retry_after)
    }

    /// Split into payload or error.
    pub fn into_result(self) -> Result<Value, InvocationError> {
        match self.error {
            _ if self.closed => Err(InvocationError::Closed),
            Some(e)          => Err(InvocationError::Rpc(e)),
            None             => Ok(self.raw),
        }
    }

    /// Deserialize a successful payload into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, InvocationError> {
        if self.closed {
            return Err(InvocationError::Closed);
        }
        if let Some(e) = &self.error {
            return Err(InvocationError::Rpc(e.clone()));
        }
        T::deserialize(&self.raw).map_err(Into::into)
    }
}

// ─── ResultFuture ────────────────────────────────────────────────────────────

/// Awaitable, single-assignment slot for one request's [`Response`].
///
/// Dropping an unsettled `ResultFuture` releases its correlation entry, so a
/// late answer is discarded instead of lingering in the pending map.
pub struct ResultFuture {
    id:         CorrelationId,
    rx:         oneshot::Receiver<Response>,
    correlator: Weak<Correlator>,
    settled:    bool,
}

impl ResultFuture {
    pub(crate) fn new(
        id:         CorrelationId,
        rx:         oneshot::Receiver<Response>,
        correlator: Weak<Correlator>,
    ) -> Self {
        Self { id, rx, correlator, settled: false }
    }

    /// The correlation id attached to the outgoing request.
    pub fn id(&self) -> CorrelationId { self.id }

    /// Wait at most `limit` for the response.
    ///
    /// On expiry the pending entry is released and [`InvocationError::Timeout`]
    /// is returned.
    pub async fn timeout(self, limit: Duration) -> Result<Response, InvocationError> {
        tokio::time::timeout(limit, self).await.map_err(|_| InvocationError::Timeout)
    }
}

impl Future for ResultFuture {
    type Output = Response;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Response> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(res) => {
                this.settled = true;
                // A dropped sender means the correlator itself is gone.
                Poll::Ready(res.unwrap_or_else(|_| Response::closed()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResultFuture {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.forget(self.id);
        }
    }
}

impl std::fmt::Debug for ResultFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultFuture")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}
