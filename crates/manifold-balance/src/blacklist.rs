//! Rate-limit-aware blacklist
//!
//! Entries are ephemeral records keyed by binding (or `binding:model`
//! for rate limits) and expire lazily on read. Three consecutive 429s
//! create a rate-limit entry; a 401/403 creates an auth entry that only
//! an operator reset or credential refresh clears; any success clears
//! every non-auth entry for the binding.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Why a binding was blacklisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistReason {
    /// Three consecutive 429s
    RateLimit,
    /// Upstream rejected credentials
    AuthFailure,
    /// Repeated 5xx (written by health probes)
    ServerError,
    /// Repeated transport failures (written by health probes)
    NetworkError,
}

impl BlacklistReason {
    /// Wire label for health endpoints
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::AuthFailure => "auth_failure",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
        }
    }
}

/// One blacklist record
#[derive(Debug, Clone)]
struct Entry {
    reason: BlacklistReason,
    /// `None` means no automatic expiry (auth failures)
    until: Option<Instant>,
    error_count: u32,
}

/// Blacklist tuning
#[derive(Debug, Clone)]
pub struct BlacklistConfig {
    /// Consecutive 429s that trip a rate-limit entry
    pub rate_limit_trip: u32,
    /// How long a rate-limit entry lasts
    pub rate_limit_duration: Duration,
    /// How long probe-written server/network entries last
    pub probe_duration: Duration,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            rate_limit_trip: 3,
            rate_limit_duration: Duration::from_secs(60),
            probe_duration: Duration::from_secs(60),
        }
    }
}

/// Blacklist shared by the balancer and the health probes
#[derive(Debug)]
pub struct Blacklist {
    entries: DashMap<String, Entry>,
    consecutive_429: DashMap<String, u32>,
    config: BlacklistConfig,
}

impl Blacklist {
    /// Create an empty blacklist
    pub fn new(config: BlacklistConfig) -> Self {
        Self {
            entries: DashMap::new(),
            consecutive_429: DashMap::new(),
            config,
        }
    }

    /// Rate-limit entries are scoped to a binding+model pair
    fn rate_key(binding: &str, model: &str) -> String {
        format!("{binding}:{model}")
    }

    /// Whether the binding (for this model) is currently dark
    ///
    /// Expired entries are removed on the way through.
    pub fn contains(&self, binding: &str, model: &str) -> bool {
        self.check_key(&Self::rate_key(binding, model)) || self.check_key(binding)
    }

    fn check_key(&self, key: &str) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return false;
        };

        match entry.until {
            Some(until) if Instant::now() >= until => {
                drop(entry);
                self.entries.remove(key);
                false
            }
            _ => true,
        }
    }

    /// Reason the binding is dark, if it is
    pub fn reason(&self, binding: &str, model: &str) -> Option<BlacklistReason> {
        for key in [Self::rate_key(binding, model), binding.to_owned()] {
            if self.check_key(&key)
                && let Some(entry) = self.entries.get(&key)
            {
                return Some(entry.reason);
            }
        }
        None
    }

    /// Record a 429; returns true when the entry tripped
    pub fn record_rate_limit(&self, binding: &str, model: &str) -> bool {
        let key = Self::rate_key(binding, model);
        let mut count = self.consecutive_429.entry(key.clone()).or_insert(0);
        *count += 1;

        if *count >= self.config.rate_limit_trip {
            let tripped = *count;
            drop(count);
            self.consecutive_429.remove(&key);
            self.entries.insert(
                key,
                Entry {
                    reason: BlacklistReason::RateLimit,
                    until: Some(Instant::now() + self.config.rate_limit_duration),
                    error_count: tripped,
                },
            );
            tracing::warn!(binding, model, "binding blacklisted after consecutive rate limits");
            true
        } else {
            false
        }
    }

    /// Record a 401/403; the entry has no automatic expiry
    pub fn record_auth_failure(&self, binding: &str) {
        self.entries.insert(
            binding.to_owned(),
            Entry {
                reason: BlacklistReason::AuthFailure,
                until: None,
                error_count: 1,
            },
        );
        tracing::error!(binding, "binding blacklisted on auth failure; awaiting credential refresh");
    }

    /// Record a probe-observed fault against the whole binding
    pub fn record_probe_failure(&self, binding: &str, reason: BlacklistReason) {
        self.entries.insert(
            binding.to_owned(),
            Entry {
                reason,
                until: Some(Instant::now() + self.config.probe_duration),
                error_count: 1,
            },
        );
    }

    /// Record a success: clears the 429 streak and every non-auth entry
    pub fn record_success(&self, binding: &str, model: &str) {
        let key = Self::rate_key(binding, model);
        self.consecutive_429.remove(&key);

        for k in [key, binding.to_owned()] {
            if let Some(entry) = self.entries.get(&k) {
                if entry.reason == BlacklistReason::AuthFailure {
                    continue;
                }
                drop(entry);
                self.entries.remove(&k);
            }
        }
    }

    /// Operator reset or credential-refresh signal: clears everything
    /// for the binding, auth entries included
    pub fn reset(&self, binding: &str) {
        let prefix = format!("{binding}:");
        self.entries.retain(|k, _| k != binding && !k.starts_with(&prefix));
        self.consecutive_429.retain(|k, _| !k.starts_with(&prefix));
    }

    /// Current consecutive-429 count for a binding+model pair
    pub fn rate_limit_streak(&self, binding: &str, model: &str) -> u32 {
        self.consecutive_429
            .get(&Self::rate_key(binding, model))
            .map_or(0, |c| *c)
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new(BlacklistConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BlacklistConfig {
        BlacklistConfig {
            rate_limit_trip: 3,
            rate_limit_duration: Duration::from_millis(30),
            probe_duration: Duration::from_millis(30),
        }
    }

    #[test]
    fn exactly_three_429s_trip() {
        let bl = Blacklist::new(fast_config());
        assert!(!bl.record_rate_limit("x", "m"));
        assert!(!bl.record_rate_limit("x", "m"));
        assert!(!bl.contains("x", "m"));
        assert!(bl.record_rate_limit("x", "m"));
        assert!(bl.contains("x", "m"));
        assert_eq!(bl.reason("x", "m"), Some(BlacklistReason::RateLimit));
    }

    #[test]
    fn success_between_resets_the_streak() {
        let bl = Blacklist::new(fast_config());
        bl.record_rate_limit("x", "m");
        bl.record_rate_limit("x", "m");
        bl.record_success("x", "m");
        assert!(!bl.record_rate_limit("x", "m"));
        assert!(!bl.contains("x", "m"));
    }

    #[test]
    fn rate_limit_entries_expire_lazily() {
        let bl = Blacklist::new(fast_config());
        for _ in 0..3 {
            bl.record_rate_limit("x", "m");
        }
        assert!(bl.contains("x", "m"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!bl.contains("x", "m"));
    }

    #[test]
    fn rate_limit_is_scoped_to_the_model() {
        let bl = Blacklist::new(fast_config());
        for _ in 0..3 {
            bl.record_rate_limit("x", "m1");
        }
        assert!(bl.contains("x", "m1"));
        assert!(!bl.contains("x", "m2"));
    }

    #[test]
    fn auth_entries_do_not_expire_or_clear_on_success() {
        let bl = Blacklist::new(fast_config());
        bl.record_auth_failure("x");
        std::thread::sleep(Duration::from_millis(40));
        assert!(bl.contains("x", "m"));
        bl.record_success("x", "m");
        assert!(bl.contains("x", "m"));
        assert_eq!(bl.reason("x", "m"), Some(BlacklistReason::AuthFailure));
    }

    #[test]
    fn operator_reset_clears_auth() {
        let bl = Blacklist::new(fast_config());
        bl.record_auth_failure("x");
        bl.reset("x");
        assert!(!bl.contains("x", "m"));
    }

    #[test]
    fn success_clears_non_auth_entries() {
        let bl = Blacklist::new(fast_config());
        bl.record_probe_failure("x", BlacklistReason::ServerError);
        assert!(bl.contains("x", "m"));
        bl.record_success("x", "m");
        assert!(!bl.contains("x", "m"));
    }
}
