//! Error taxonomy for the alert lifecycle core.
//!
//! Each component-facing error implements the kind it belongs to so
//! callers can match on behavior (retry, surface to caller, drop with a
//! warning) without inspecting message text.

use thiserror::Error;

/// Network/HTTP-level failure reaching an Upstream or Destination.
/// Recovered locally with backoff in the Poller/DestinationFanout — never
/// surfaced as fatal.
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Malformed payload at the webhook ingress. Surfaced to the HTTP caller
/// as 400, never retried.
#[derive(Debug, Error)]
#[error("bad request: {0}")]
pub struct BadRequestError(pub String);

/// Raise an internal invariant violation.
///
/// These must never occur in a correct implementation: the breach is
/// logged as a structured event and the calling task aborts. This is the
/// only error kind that uses the host language's panic mechanism rather
/// than an explicit `Result`.
#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(event = "internal_invariant_violation", message = %message);
        panic!("internal invariant violation: {}", message);
    }};
}
