use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Routing category a request is classified into
///
/// The set is closed; classification is deterministic given a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    /// Everything that matches no other rule
    #[default]
    Default,
    /// Lightweight background models
    Background,
    /// Explicit deep-reasoning requests
    Thinking,
    /// Prompts above the long-context threshold
    Longcontext,
    /// Requests advertising a search-capable tool
    Search,
}

/// Category routing table plus classifier knobs
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    /// Per-category binding lists and balancing strategy
    #[serde(default)]
    pub categories: IndexMap<Category, CategoryConfig>,
    /// Classifier thresholds and markers
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Table-wide settings
    #[serde(default, rename = "globalSettings", alias = "global_settings")]
    pub global_settings: GlobalSettings,
}

/// Binding list and balancing policy for one category
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryConfig {
    /// Preferred target
    pub primary: RouteTarget,
    /// Ordered fallback targets
    #[serde(default)]
    pub backups: Vec<RouteTarget>,
    /// How to pick among eligible bindings
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
    /// When true, an empty category is a hard error instead of a
    /// fall-through to `default`
    #[serde(default)]
    pub required: bool,
}

/// One provider+model target within a category
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteTarget {
    /// Provider id (key in the `providers` table)
    pub provider: String,
    /// Model to request from that provider
    pub model: String,
    /// Weight override; defaults to the provider's declared weight
    #[serde(default)]
    pub weight: Option<u32>,
}

/// Balancing policy for one category
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadBalancingConfig {
    /// Selection strategy
    #[serde(default)]
    pub strategy: Strategy,
    /// Retry the request on another binding when the selected one fails
    #[serde(default = "default_true")]
    pub enable_failover: bool,
    /// Bindings tried at most per request when failover is on
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Cool-down before a failed-over binding is preferred again
    #[serde(default = "default_failover_cooldown_ms")]
    pub failover_cooldown_ms: u64,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            enable_failover: default_true(),
            max_failures: default_max_failures(),
            failover_cooldown_ms: default_failover_cooldown_ms(),
        }
    }
}

/// Selection strategy over the eligible binding set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Probability proportional to weight
    #[default]
    WeightedRandom,
    /// Monotone counter modulo eligible set size
    RoundRobin,
    /// Smallest in-flight count, weighted-random tie break
    LeastConnections,
    /// Smallest latency EWMA
    ResponseTime,
    /// Always the head; first eligible backup when the head is out
    SingleWithFallback,
}

/// Classifier thresholds and markers
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Prompt token estimate above which a request is `longcontext`
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: usize,
    /// Models routed to `background` when requested directly
    #[serde(default)]
    pub background_models: Vec<String>,
    /// Model-name markers that opt a request into `thinking`
    #[serde(default)]
    pub thinking_markers: Vec<String>,
    /// Substrings marking a tool as search-capable
    #[serde(default = "default_search_markers")]
    pub search_tool_markers: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            long_context_threshold: default_long_context_threshold(),
            background_models: Vec::new(),
            thinking_markers: Vec::new(),
            search_tool_markers: default_search_markers(),
        }
    }
}

/// Table-wide routing settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Expand providers declared with K>1 credentials into K bindings
    #[serde(default = "default_true")]
    pub enable_multi_key_expansion: bool,
    /// Category used when classification falls through
    #[serde(default)]
    pub default_category: Category,
    /// Provider of last resort for categories with no table entry
    #[serde(default)]
    pub fallback_provider: Option<String>,
    /// Client-side rate limiting (enforced by the listener)
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            enable_multi_key_expansion: default_true(),
            default_category: Category::Default,
            fallback_provider: None,
            rate_limiting: RateLimitSettings::default(),
        }
    }
}

/// Client-side rate limiting knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Whether the listener throttles clients
    #[serde(default)]
    pub enabled: bool,
    /// Sustained request budget
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    /// Burst allowance
    #[serde(default = "default_burst")]
    pub burst_limit: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: default_rpm(),
            burst_limit: default_burst(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_max_failures() -> u32 {
    3
}

const fn default_failover_cooldown_ms() -> u64 {
    60_000
}

const fn default_long_context_threshold() -> usize {
    60_000
}

fn default_search_markers() -> Vec<String> {
    vec!["search".to_owned(), "web_search".to_owned()]
}

const fn default_rpm() -> u32 {
    600
}

const fn default_burst() -> u32 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parses_lowercase() {
        let cat: Category = serde_json::from_str("\"longcontext\"").unwrap();
        assert_eq!(cat, Category::Longcontext);
        assert_eq!(cat.to_string(), "longcontext");
    }

    #[test]
    fn strategy_defaults_to_weighted_random() {
        let lb = LoadBalancingConfig::default();
        assert_eq!(lb.strategy, Strategy::WeightedRandom);
        assert!(lb.enable_failover);
    }

    #[test]
    fn classifier_defaults() {
        let c = ClassifierConfig::default();
        assert_eq!(c.long_context_threshold, 60_000);
        assert!(c.search_tool_markers.contains(&"web_search".to_owned()));
    }
}
