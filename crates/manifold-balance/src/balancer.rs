//! Binding selection over a category's candidate set
//!
//! The balancer never owns pipelines; it tracks bindings by id and the
//! registry maps a leased id back to its pipeline. A selection
//! increments the binding's in-flight counter and hands out a lease;
//! the caller must release the lease with a terminal outcome exactly
//! once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use manifold_config::Strategy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::blacklist::{Blacklist, BlacklistConfig, BlacklistReason};
use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker, FailureClass};
use crate::error::BalanceError;
use crate::metrics::BindingMetrics;
use crate::rotation::KeyGroup;
use crate::Outcome;

/// One selectable entry in a category's table
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Binding id, or group id when `key_group` is set
    pub binding: String,
    /// Model the request will carry
    pub model: String,
    /// Selection weight
    pub weight: u32,
    /// Concurrency cap; at the cap the binding is not selectable
    pub max_in_flight: u32,
    /// Set when this candidate is a multi-key group
    pub key_group: Option<String>,
}

/// A granted selection; must be released exactly once
#[derive(Debug, Clone)]
pub struct Lease {
    /// Binding actually pinned (a group member for multi-key candidates)
    pub binding: String,
    /// Model the request carries
    pub model: String,
}

/// Point-in-time view of one binding's availability
#[derive(Debug, Clone)]
pub struct BindingSnapshot {
    /// Circuit breaker state
    pub breaker: BreakerState,
    /// Whether any blacklist entry is live
    pub blacklisted: bool,
    /// Reason when blacklisted
    pub blacklist_reason: Option<BlacklistReason>,
    /// Requests currently pinned
    pub in_flight: u32,
    /// Smoothed latency in milliseconds
    pub avg_latency_ms: Option<f64>,
}

/// Weighted selection and fault bookkeeping over binding ids
pub struct LoadBalancer {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    blacklist: Blacklist,
    metrics: DashMap<String, Arc<BindingMetrics>>,
    groups: DashMap<String, Arc<KeyGroup>>,
    round_robin: DashMap<String, AtomicU64>,
    rng: Mutex<StdRng>,
    breaker_config: BreakerConfig,
}

impl LoadBalancer {
    /// Create a balancer seeded from OS entropy
    pub fn new(breaker_config: BreakerConfig, blacklist_config: BlacklistConfig) -> Self {
        Self::with_rng(breaker_config, blacklist_config, StdRng::from_os_rng())
    }

    /// Create a balancer with a fixed seed (deterministic selection)
    pub fn with_seed(breaker_config: BreakerConfig, blacklist_config: BlacklistConfig, seed: u64) -> Self {
        Self::with_rng(breaker_config, blacklist_config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(breaker_config: BreakerConfig, blacklist_config: BlacklistConfig, rng: StdRng) -> Self {
        Self {
            breakers: DashMap::new(),
            blacklist: Blacklist::new(blacklist_config),
            metrics: DashMap::new(),
            groups: DashMap::new(),
            round_robin: DashMap::new(),
            rng: Mutex::new(rng),
            breaker_config,
        }
    }

    /// Register a multi-key group so in-group rotation can run
    pub fn register_group(&self, group_id: &str, members: Vec<String>) {
        self.groups.insert(group_id.to_owned(), Arc::new(KeyGroup::new(members)));
    }

    /// The shared blacklist (health probes and operator resets write here)
    pub const fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Breaker for a binding, created closed on first touch
    pub fn breaker(&self, binding: &str) -> Arc<CircuitBreaker> {
        Arc::clone(
            &self
                .breakers
                .entry(binding.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone()))),
        )
    }

    fn binding_metrics(&self, binding: &str) -> Arc<BindingMetrics> {
        Arc::clone(
            &self
                .metrics
                .entry(binding.to_owned())
                .or_insert_with(|| Arc::new(BindingMetrics::new())),
        )
    }

    /// Whether a concrete binding id can take a request for `model`
    fn binding_eligible(&self, binding: &str, model: &str, cap: u32) -> bool {
        self.breaker(binding).allows()
            && !self.blacklist.contains(binding, model)
            && self.binding_metrics(binding).in_flight() < cap
    }

    /// Whether a candidate (binding or group) can take a request
    fn candidate_eligible(&self, candidate: &Candidate) -> bool {
        match &candidate.key_group {
            Some(group_id) => self.groups.get(group_id).is_some_and(|group| {
                group
                    .members()
                    .iter()
                    .any(|m| self.binding_eligible(m, &candidate.model, candidate.max_in_flight))
            }),
            None => self.binding_eligible(&candidate.binding, &candidate.model, candidate.max_in_flight),
        }
    }

    /// Select one binding from the category's candidates
    ///
    /// Increments the selected binding's in-flight counter; the caller
    /// must pair this with exactly one `release`.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::NoEligibleBinding` when every candidate is
    /// blacklisted, open-circuit, or at its concurrency cap. There is no
    /// silent fallback outside the category.
    pub fn acquire(
        &self,
        category: &str,
        strategy: Strategy,
        candidates: &[Candidate],
    ) -> Result<Lease, BalanceError> {
        let eligible: Vec<&Candidate> = candidates.iter().filter(|c| self.candidate_eligible(c)).collect();

        if eligible.is_empty() {
            return Err(BalanceError::NoEligibleBinding {
                category: category.to_owned(),
            });
        }

        let chosen = match strategy {
            Strategy::WeightedRandom => self.pick_weighted(candidates, &eligible),
            Strategy::RoundRobin => {
                let counter = self
                    .round_robin
                    .entry(category.to_owned())
                    .or_insert_with(|| AtomicU64::new(0));
                let slot = counter.fetch_add(1, Ordering::Relaxed) as usize % eligible.len();
                eligible[slot]
            }
            Strategy::LeastConnections => self.pick_least_connections(candidates, &eligible),
            Strategy::ResponseTime => self.pick_response_time(&eligible),
            Strategy::SingleWithFallback => eligible[0],
        };

        let binding = match &chosen.key_group {
            Some(group_id) => {
                // Eligibility was checked above, but a key can go dark
                // between the check and the rotation
                let member = self.groups.get(group_id).and_then(|group| {
                    group
                        .next(|member| self.binding_eligible(member, &chosen.model, chosen.max_in_flight))
                        .map(str::to_owned)
                });
                match member {
                    Some(member) => member,
                    None => {
                        return Err(BalanceError::NoEligibleBinding {
                            category: category.to_owned(),
                        });
                    }
                }
            }
            None => chosen.binding.clone(),
        };

        self.binding_metrics(&binding).acquire();

        Ok(Lease {
            binding,
            model: chosen.model.clone(),
        })
    }

    /// Weighted random over eligible candidates, with the weight of
    /// ineligible candidates redistributed proportionally
    fn pick_weighted<'a>(&self, all: &'a [Candidate], eligible: &[&'a Candidate]) -> &'a Candidate {
        let excluded: HashSet<&str> = all
            .iter()
            .filter(|c| !eligible.iter().any(|e| e.binding == c.binding))
            .map(|c| c.binding.as_str())
            .collect();

        let weights: Vec<(String, f64)> = all
            .iter()
            .map(|c| (c.binding.clone(), f64::from(c.weight)))
            .collect();
        let effective = redistribute_weights(&weights, &excluded);

        let total: f64 = effective.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return eligible[0];
        }

        let mut roll = {
            let mut rng = self.rng.lock().expect("balancer rng");
            rng.random_range(0.0..total)
        };

        for (binding, weight) in &effective {
            if *weight <= 0.0 {
                continue;
            }
            if roll < *weight {
                // Effective weight is only assigned to eligible candidates
                return eligible
                    .iter()
                    .find(|c| &c.binding == binding)
                    .copied()
                    .unwrap_or(eligible[0]);
            }
            roll -= weight;
        }

        eligible[eligible.len() - 1]
    }

    /// Smallest in-flight count; ties broken by weighted random
    fn pick_least_connections<'a>(&self, all: &'a [Candidate], eligible: &[&'a Candidate]) -> &'a Candidate {
        let load = |c: &Candidate| match &c.key_group {
            Some(group_id) => self.groups.get(group_id).map_or(u32::MAX, |g| {
                g.members()
                    .iter()
                    .map(|m| self.binding_metrics(m).in_flight())
                    .min()
                    .unwrap_or(u32::MAX)
            }),
            None => self.binding_metrics(&c.binding).in_flight(),
        };

        let minimum = eligible.iter().map(|c| load(c)).min().unwrap_or(0);
        let tied: Vec<&Candidate> = eligible.iter().filter(|c| load(c) == minimum).copied().collect();

        if tied.len() == 1 {
            tied[0]
        } else {
            self.pick_weighted(all, &tied)
        }
    }

    /// Smallest latency EWMA; bindings without samples sort first so new
    /// bindings receive traffic
    fn pick_response_time<'a>(&self, eligible: &[&'a Candidate]) -> &'a Candidate {
        eligible
            .iter()
            .min_by(|a, b| {
                let la = self.binding_metrics(&a.binding).avg_latency_ms().unwrap_or(0.0);
                let lb = self.binding_metrics(&b.binding).avg_latency_ms().unwrap_or(0.0);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
            .expect("eligible set is nonempty")
    }

    /// Report the terminal outcome of a leased request
    ///
    /// Decrements the in-flight counter and updates breaker and
    /// blacklist state per the outcome. `Cancelled` touches nothing but
    /// the counter.
    pub fn release(&self, lease: &Lease, outcome: Outcome, latency: Option<Duration>) {
        let metrics = self.binding_metrics(&lease.binding);
        metrics.release();

        match outcome {
            Outcome::Success => {
                self.breaker(&lease.binding).record_success();
                self.blacklist.record_success(&lease.binding, &lease.model);
                if let Some(latency) = latency {
                    metrics.record_latency(latency);
                }
            }
            Outcome::RateLimit => {
                self.blacklist.record_rate_limit(&lease.binding, &lease.model);
                metrics.record_failure();
            }
            Outcome::AuthFailure => {
                self.blacklist.record_auth_failure(&lease.binding);
                metrics.record_failure();
            }
            Outcome::ServerError | Outcome::TransientFailure => {
                self.breaker(&lease.binding).record_failure(FailureClass::Server);
                metrics.record_failure();
            }
            Outcome::NetworkError | Outcome::Timeout => {
                self.breaker(&lease.binding).record_failure(FailureClass::Network);
                metrics.record_failure();
            }
            Outcome::Cancelled => {}
        }
    }

    /// Availability snapshot for one binding (health endpoints)
    pub fn snapshot(&self, binding: &str, model: &str) -> BindingSnapshot {
        let metrics = self.binding_metrics(binding);
        BindingSnapshot {
            breaker: self.breaker(binding).state(),
            blacklisted: self.blacklist.contains(binding, model),
            blacklist_reason: self.blacklist.reason(binding, model),
            in_flight: metrics.in_flight(),
            avg_latency_ms: metrics.avg_latency_ms(),
        }
    }

    /// Requests currently pinned across all bindings
    pub fn total_in_flight(&self) -> u32 {
        self.metrics.iter().map(|entry| entry.value().in_flight()).sum()
    }
}

/// Redistribute excluded bindings' weight across the survivors
///
/// Each survivor receives a share of the lost weight proportional to its
/// own: `w'_i = w_i + w_excluded * (w_i / sum of surviving weights)`.
/// The total is preserved up to floating-point epsilon; excluded
/// bindings end at zero.
pub fn redistribute_weights(weights: &[(String, f64)], excluded: &HashSet<&str>) -> Vec<(String, f64)> {
    let lost: f64 = weights
        .iter()
        .filter(|(id, _)| excluded.contains(id.as_str()))
        .map(|(_, w)| w)
        .sum();
    let surviving: f64 = weights
        .iter()
        .filter(|(id, _)| !excluded.contains(id.as_str()))
        .map(|(_, w)| w)
        .sum();

    weights
        .iter()
        .map(|(id, w)| {
            if excluded.contains(id.as_str()) {
                (id.clone(), 0.0)
            } else if surviving > 0.0 {
                (id.clone(), w + lost * (w / surviving))
            } else {
                (id.clone(), *w)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn candidate(binding: &str, weight: u32) -> Candidate {
        Candidate {
            binding: binding.to_owned(),
            model: "test-model".to_owned(),
            weight,
            max_in_flight: 100,
            key_group: None,
        }
    }

    fn balancer() -> LoadBalancer {
        LoadBalancer::with_seed(BreakerConfig::default(), BlacklistConfig::default(), 42)
    }

    fn draw(lb: &LoadBalancer, candidates: &[Candidate], n: usize) -> HashMap<String, u32> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..n {
            let lease = lb.acquire("default", Strategy::WeightedRandom, candidates).unwrap();
            *counts.entry(lease.binding.clone()).or_default() += 1;
            lb.release(&lease, Outcome::Success, None);
        }
        counts
    }

    #[test]
    fn weighted_selection_converges_to_weights() {
        let lb = balancer();
        let candidates = vec![candidate("a", 40), candidate("b", 30), candidate("c", 30)];

        let counts = draw(&lb, &candidates, 1000);

        // Expect 400/300/300 within +-5% of the total
        assert!((counts["a"] as i64 - 400).unsigned_abs() < 50, "{counts:?}");
        assert!((counts["b"] as i64 - 300).unsigned_abs() < 50, "{counts:?}");
        assert!((counts["c"] as i64 - 300).unsigned_abs() < 50, "{counts:?}");
    }

    #[test]
    fn blacklisted_weight_flows_to_survivors() {
        let lb = balancer();
        let candidates = vec![candidate("a", 50), candidate("b", 30), candidate("c", 20)];

        lb.blacklist().record_auth_failure("a");

        let counts = draw(&lb, &candidates, 300);

        assert_eq!(counts.get("a"), None);
        // b should get ~60%, c ~40%
        let b = f64::from(counts["b"]);
        let c = f64::from(counts["c"]);
        assert!((b / 300.0 - 0.6).abs() < 0.08, "b={b} c={c}");
        assert!((c / 300.0 - 0.4).abs() < 0.08, "b={b} c={c}");
    }

    #[test]
    fn redistribution_preserves_total_weight() {
        let weights = vec![
            ("a".to_owned(), 50.0),
            ("b".to_owned(), 30.0),
            ("c".to_owned(), 20.0),
        ];
        let excluded: HashSet<&str> = ["a"].into();

        let effective = redistribute_weights(&weights, &excluded);
        let total: f64 = effective.iter().map(|(_, w)| w).sum();

        assert!((total - 100.0).abs() < 1e-9);
        assert!(effective.iter().all(|(_, w)| *w >= 0.0));
        assert!((effective[1].1 - 60.0).abs() < 1e-9);
        assert!((effective[2].1 - 40.0).abs() < 1e-9);
    }

    #[test]
    fn round_robin_cycles_the_eligible_set() {
        let lb = balancer();
        let candidates = vec![candidate("a", 1), candidate("b", 1), candidate("c", 1)];

        let mut order = Vec::new();
        for _ in 0..6 {
            let lease = lb.acquire("default", Strategy::RoundRobin, &candidates).unwrap();
            order.push(lease.binding.clone());
            lb.release(&lease, Outcome::Success, None);
        }

        assert_eq!(order, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn least_connections_prefers_idle() {
        let lb = balancer();
        let candidates = vec![candidate("a", 1), candidate("b", 1)];

        // Pin a request to "a"
        let held = lb.acquire("default", Strategy::SingleWithFallback, &candidates).unwrap();
        assert_eq!(held.binding, "a");

        let lease = lb.acquire("default", Strategy::LeastConnections, &candidates).unwrap();
        assert_eq!(lease.binding, "b");
        lb.release(&lease, Outcome::Success, None);
        lb.release(&held, Outcome::Success, None);
    }

    #[test]
    fn response_time_prefers_fast_bindings() {
        let lb = balancer();
        let candidates = vec![candidate("slow", 1), candidate("fast", 1)];

        for (binding, ms) in [("slow", 900), ("fast", 40)] {
            let lease = Lease {
                binding: binding.to_owned(),
                model: "test-model".to_owned(),
            };
            lb.binding_metrics(binding).acquire();
            lb.release(&lease, Outcome::Success, Some(Duration::from_millis(ms)));
        }

        let lease = lb.acquire("default", Strategy::ResponseTime, &candidates).unwrap();
        assert_eq!(lease.binding, "fast");
        lb.release(&lease, Outcome::Success, None);
    }

    #[test]
    fn single_with_fallback_skips_dark_head() {
        let lb = balancer();
        let candidates = vec![candidate("head", 1), candidate("backup", 1)];

        lb.blacklist().record_auth_failure("head");

        let lease = lb.acquire("default", Strategy::SingleWithFallback, &candidates).unwrap();
        assert_eq!(lease.binding, "backup");
        lb.release(&lease, Outcome::Success, None);
    }

    #[test]
    fn all_dark_is_a_hard_error() {
        let lb = balancer();
        let candidates = vec![candidate("a", 1), candidate("b", 1)];
        lb.blacklist().record_auth_failure("a");
        lb.blacklist().record_auth_failure("b");

        let err = lb.acquire("default", Strategy::WeightedRandom, &candidates).unwrap_err();
        assert!(matches!(err, BalanceError::NoEligibleBinding { .. }));
    }

    #[test]
    fn concurrency_cap_excludes_binding() {
        let lb = balancer();
        let mut tight = candidate("a", 1);
        tight.max_in_flight = 1;
        let candidates = vec![tight, candidate("b", 1)];

        let held = lb.acquire("default", Strategy::SingleWithFallback, &candidates).unwrap();
        assert_eq!(held.binding, "a");

        // "a" is at its cap; selection must move on
        let lease = lb.acquire("default", Strategy::SingleWithFallback, &candidates).unwrap();
        assert_eq!(lease.binding, "b");

        lb.release(&held, Outcome::Success, None);
        lb.release(&lease, Outcome::Success, None);
    }

    #[test]
    fn in_flight_returns_to_zero_for_every_outcome() {
        let lb = balancer();
        let candidates = vec![candidate("a", 1)];

        for outcome in [
            Outcome::Success,
            Outcome::TransientFailure,
            Outcome::RateLimit,
            Outcome::AuthFailure,
            Outcome::ServerError,
            Outcome::NetworkError,
            Outcome::Timeout,
            Outcome::Cancelled,
        ] {
            lb.blacklist().reset("a");
            lb.breaker("a").record_success();
            let lease = lb.acquire("default", Strategy::WeightedRandom, &candidates).unwrap();
            lb.release(&lease, outcome, None);
            assert_eq!(lb.total_in_flight(), 0, "outcome {outcome:?} leaked in-flight");
        }
    }

    #[test]
    fn cancelled_leaves_breaker_and_blacklist_alone() {
        let lb = balancer();
        let candidates = vec![candidate("a", 1)];

        for _ in 0..10 {
            let lease = lb.acquire("default", Strategy::WeightedRandom, &candidates).unwrap();
            lb.release(&lease, Outcome::Cancelled, None);
        }

        assert_eq!(lb.breaker("a").state(), BreakerState::Closed);
        assert!(!lb.blacklist().contains("a", "test-model"));
    }

    #[test]
    fn three_rate_limits_blacklist_the_binding() {
        let lb = balancer();
        let candidates = vec![candidate("x", 1), candidate("y", 1)];

        for _ in 0..3 {
            let lease = lb.acquire("default", Strategy::SingleWithFallback, &candidates).unwrap();
            assert_eq!(lease.binding, "x");
            lb.release(&lease, Outcome::RateLimit, None);
        }

        // x is dark; selection moves to y
        let lease = lb.acquire("default", Strategy::SingleWithFallback, &candidates).unwrap();
        assert_eq!(lease.binding, "y");
        lb.release(&lease, Outcome::Success, None);
    }

    #[test]
    fn success_between_rate_limits_resets_the_streak() {
        let lb = balancer();
        let candidates = vec![candidate("x", 1)];

        for outcome in [Outcome::RateLimit, Outcome::RateLimit, Outcome::Success, Outcome::RateLimit] {
            let lease = lb.acquire("default", Strategy::WeightedRandom, &candidates).unwrap();
            lb.release(&lease, outcome, None);
        }

        // Streak was broken; binding is still eligible
        assert!(lb.acquire("default", Strategy::WeightedRandom, &candidates).is_ok());
    }

    #[test]
    fn key_rotation_is_fair_and_skips_dark_keys() {
        let lb = balancer();
        lb.register_group(
            "p",
            vec!["p-key0".to_owned(), "p-key1".to_owned(), "p-key2".to_owned(), "p-key3".to_owned()],
        );
        let candidates = vec![Candidate {
            binding: "p".to_owned(),
            model: "test-model".to_owned(),
            weight: 1,
            max_in_flight: 100,
            key_group: Some("p".to_owned()),
        }];

        let counts = draw(&lb, &candidates, 20);
        assert!(counts.values().all(|&c| c == 5), "{counts:?}");

        // Blacklist key 0 with three consecutive rate limits
        for _ in 0..3 {
            lb.blacklist().record_rate_limit("p-key0", "test-model");
        }

        let counts = draw(&lb, &candidates, 20);
        assert_eq!(counts.get("p-key0"), None, "{counts:?}");
        let (min, max) = counts
            .values()
            .fold((u32::MAX, 0), |(lo, hi), &c| (lo.min(c), hi.max(c)));
        assert!(max - min <= 1, "{counts:?}");
    }

    #[test]
    fn group_with_all_keys_dark_is_ineligible() {
        let lb = balancer();
        lb.register_group("p", vec!["p-key0".to_owned(), "p-key1".to_owned()]);
        let candidates = vec![Candidate {
            binding: "p".to_owned(),
            model: "test-model".to_owned(),
            weight: 1,
            max_in_flight: 100,
            key_group: Some("p".to_owned()),
        }];

        lb.blacklist().record_auth_failure("p-key0");
        lb.blacklist().record_auth_failure("p-key1");

        let err = lb.acquire("default", Strategy::WeightedRandom, &candidates).unwrap_err();
        assert!(matches!(err, BalanceError::NoEligibleBinding { .. }));
    }
}
