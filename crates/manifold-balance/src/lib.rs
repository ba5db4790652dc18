//! Load balancing and the fault substrate for Manifold
//!
//! Selects one binding per request from the category's eligible set and
//! keeps the availability bookkeeping: per-binding circuit breakers,
//! rate-limit-aware blacklisting, round-robin key rotation inside
//! multi-key groups, and weight redistribution when bindings go dark.

mod balancer;
mod blacklist;
mod breaker;
mod error;
mod metrics;
mod rotation;

pub use balancer::{BindingSnapshot, Candidate, Lease, LoadBalancer};
pub use blacklist::{Blacklist, BlacklistConfig, BlacklistReason};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, FailureClass};
pub use error::BalanceError;
pub use metrics::BindingMetrics;
pub use rotation::KeyGroup;

/// Terminal outcome of one proxied request, reported on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Request completed normally
    Success,
    /// Retriable failure that was not recovered
    TransientFailure,
    /// Upstream returned 429
    RateLimit,
    /// Upstream returned 401/403
    AuthFailure,
    /// Upstream returned 5xx
    ServerError,
    /// Transport-level failure
    NetworkError,
    /// Deadline expired
    Timeout,
    /// Client went away; not a fault of the binding
    Cancelled,
}
