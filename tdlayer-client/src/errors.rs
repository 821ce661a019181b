//! Error types for tdlayer-client.
//!
//! Protocol-level failures (`{"@type":"error", ...}`) are *not* errors of the
//! client itself: they travel inside a [`crate::Response`] and surface here
//! only when the caller asks for a typed result.

use std::{fmt, io};

use serde_json::Value;

/// Prefix the native library puts in front of rate-limit messages.
pub(crate) const RETRY_AFTER_PREFIX: &str = "Too Many Requests: retry after ";

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error object returned by the native library in response to a request.
///
/// # Example
/// `{"@type":"error","code":429,"message":"Too Many Requests: retry after 30"}`
/// → `RpcError { code: 429, message: "Too Many Requests: retry after 30" }`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code:    i32,
    /// Human-readable message, e.g. `"PHONE_CODE_INVALID"`.
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Read the `code` / `message` fields of an error object.
    ///
    /// Missing fields default to `0` / `""`; the caller has already decided
    /// that the object is an error by its `@type`.
    pub fn from_object(obj: &Value) -> Self {
        let code = obj.get("code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(0);
        let message = obj.get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { code, message }
    }

    /// Match on the message, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("PHONE_CODE_INVALID")` — exact match
    /// - `err.is("PHONE_CODE_*")` — starts-with match
    /// - `err.is("*_INVALID")` — ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.message.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.message.ends_with(suffix)
        } else {
            self.message == pattern
        }
    }

    /// `true` for "too many requests" errors.
    pub fn is_flood(&self) -> bool {
        self.code == 429 || self.message.starts_with(RETRY_AFTER_PREFIX)
    }

    /// Seconds to wait before retrying, parsed from
    /// `"Too Many Requests: retry after N"`.
    ///
    /// Any other message, or a malformed suffix, yields `0`.
    pub fn retry_after(&self) -> u64 {
        self.message
            .strip_prefix(RETRY_AFTER_PREFIX)
            .and_then(|rest| rest.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }
}

// ─── TransportError ───────────────────────────────────────────────────────────

/// Failure of the native call layer itself.
#[derive(Debug)]
pub enum TransportError {
    /// The native library could not be reached or refused to create an instance.
    Unavailable(String),
    /// I/O failure inside a transport implementation.
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(s) => write!(f, "native layer unavailable: {s}"),
            Self::Io(e)          => write!(f, "transport I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _           => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from `Client` methods.
///
/// Error *responses* are delivered as [`crate::Response`] values; only the
/// typed helpers on `Response` turn them into [`InvocationError::Rpc`].
#[derive(Debug)]
pub enum InvocationError {
    /// The native library answered with an error object.
    Rpc(RpcError),
    /// The native call layer failed.
    Transport(TransportError),
    /// The response could not be converted into the requested type.
    Deserialize(String),
    /// The request type is not on the synchronous allowlist.
    NotSynchronous(String),
    /// The request was malformed (e.g. missing `@type`).
    InvalidRequest(String),
    /// The instance was closed before a response arrived.
    Closed,
    /// A caller-imposed wait bound elapsed.
    Timeout,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)            => write!(f, "{e}"),
            Self::Transport(e)      => write!(f, "{e}"),
            Self::Deserialize(s)    => write!(f, "deserialize error: {s}"),
            Self::NotSynchronous(t) => write!(f, "{t} cannot be executed synchronously"),
            Self::InvalidRequest(s) => write!(f, "invalid request: {s}"),
            Self::Closed            => write!(f, "instance closed"),
            Self::Timeout           => write!(f, "timed out waiting for response"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<TransportError> for InvocationError {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl From<serde_json::Error> for InvocationError {
    fn from(e: serde_json::Error) -> Self { Self::Deserialize(e.to_string()) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// If this is a rate-limit error, returns how many seconds to wait.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) if e.retry_after() > 0 => Some(e.retry_after()),
            _                                   => None,
        }
    }
}

// ─── RegistrationError ────────────────────────────────────────────────────────

/// Programmer errors caught when a handler is registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    /// The same handler was already registered for this update type.
    Duplicate { update_type: String },
    /// `update_type` was empty.
    EmptyUpdateType,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { update_type } =>
                write!(f, "handler already registered for {update_type}"),
            Self::EmptyUpdateType => write!(f, "update type must not be empty"),
        }
    }
}

impl std::error::Error for RegistrationError {}

// ─── HandlerError ─────────────────────────────────────────────────────────────

/// Error type handler callbacks may return; logged by the dispatcher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
