//! What [`crate::Client::invoke`] does with a rate-limited request.
//!
//! The native library rejects requests sent too fast with an error object
//! whose message reads `"Too Many Requests: retry after N"`. A policy
//! inspects that error (see [`RpcError::retry_after`]) and either names a
//! delay after which the request is re-sent under a fresh correlation id,
//! or gives the error response back to the caller.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::RpcError;

/// Decides whether an error response is worth re-sending.
///
/// `Continue(delay)` sleeps `delay` and re-sends; `Break(())` returns the
/// error response as-is.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// The error response of the latest attempt, plus how the request fared so far.
pub struct RetryContext {
    /// Attempts that ended in an error response, including this one.
    pub fail_count:   NonZeroU32,
    /// Total delay already spent on retries of this request.
    pub slept_so_far: Duration,
    pub error:        RpcError,
}

/// Hand every error response straight back.
pub struct NoRetries;
impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Honour the library's requested wait once, if it is at most `threshold`.
///
/// A second rate-limit on the same request, a wait above the threshold, or
/// any error without a `retry after` delay goes back to the caller.
pub struct AutoSleep {
    pub threshold: Duration,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self { threshold: Duration::from_secs(60) }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        let wait = Duration::from_secs(ctx.error.retry_after());
        if wait.is_zero() || ctx.fail_count.get() > 1 || wait > self.threshold {
            return ControlFlow::Break(());
        }
        tracing::info!("[tdlayer] rate limited, re-sending in {wait:?}");
        ControlFlow::Continue(wait)
    }
}
