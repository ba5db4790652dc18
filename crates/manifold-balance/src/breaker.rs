//! Per-binding circuit breaker
//!
//! Rejects selection after a failure threshold, probes recovery with a
//! single half-open request, and closes again on the first success.
//! Server-side (5xx) and network failures are counted separately so
//! network blips can recover on a shorter timeout.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker tuning shared by all bindings
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the monitoring period that open the circuit
    pub failure_threshold: u32,
    /// Window over which failures are counted
    pub monitoring_period: Duration,
    /// How long the circuit stays open after a server-error trip
    pub reset_timeout: Duration,
    /// How long the circuit stays open after a network trip
    pub network_reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            monitoring_period: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(60),
            network_reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Tripped; selection is rejected
    Open,
    /// Reset timeout elapsed; one probe request is allowed
    HalfOpen,
}

impl BreakerState {
    /// Wire label for health endpoints
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Which counter a failure lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Upstream 5xx
    Server,
    /// Transport failure or timeout
    Network,
}

#[derive(Debug)]
struct BreakerInner {
    server_failures: u32,
    network_failures: u32,
    window_start: Instant,
    /// When the circuit opened; `None` while closed
    opened_at: Option<Instant>,
    /// Class of the failure that tripped the circuit
    opened_by: FailureClass,
}

/// Circuit breaker for one binding
///
/// Transitions are monotone per window:
/// `closed -> open -> half-open -> {closed | open}`.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                server_failures: 0,
                network_failures: 0,
                window_start: Instant::now(),
                opened_at: None,
                opened_by: FailureClass::Server,
            }),
            config,
        }
    }

    /// Current state, accounting for elapsed reset timeouts
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().expect("breaker lock");
        let Some(opened_at) = inner.opened_at else {
            return BreakerState::Closed;
        };

        let reset = match inner.opened_by {
            FailureClass::Server => self.config.reset_timeout,
            FailureClass::Network => self.config.network_reset_timeout,
        };

        if opened_at.elapsed() >= reset {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Whether a request may be sent through this binding
    pub fn allows(&self) -> bool {
        self.state() != BreakerState::Open
    }

    /// Record a successful request; closes a half-open circuit and
    /// resets both failure counters
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.opened_at = None;
        inner.server_failures = 0;
        inner.network_failures = 0;
        inner.window_start = Instant::now();
    }

    /// Record a failed request; trips the circuit at the threshold, and
    /// immediately re-opens a half-open circuit
    pub fn record_failure(&self, class: FailureClass) {
        let mut inner = self.inner.lock().expect("breaker lock");
        let now = Instant::now();

        // A failure during the half-open probe re-opens immediately
        if let Some(opened_at) = inner.opened_at {
            let reset = match inner.opened_by {
                FailureClass::Server => self.config.reset_timeout,
                FailureClass::Network => self.config.network_reset_timeout,
            };
            if opened_at.elapsed() >= reset {
                inner.opened_at = Some(now);
                inner.opened_by = class;
            }
            return;
        }

        // Expired window starts a fresh count
        if now.duration_since(inner.window_start) >= self.config.monitoring_period {
            inner.server_failures = 0;
            inner.network_failures = 0;
            inner.window_start = now;
        }

        let count = match class {
            FailureClass::Server => {
                inner.server_failures += 1;
                inner.server_failures
            }
            FailureClass::Network => {
                inner.network_failures += 1;
                inner.network_failures
            }
        };

        if count >= self.config.failure_threshold {
            inner.opened_at = Some(now);
            inner.opened_by = class;
            drop(inner);
            tracing::warn!(failures = count, class = ?class, "circuit breaker opened");
        }
    }

    /// Consecutive failures recorded in the current window
    pub fn failure_count(&self) -> u32 {
        let inner = self.inner.lock().expect("breaker lock");
        inner.server_failures + inner.network_failures
    }
}
