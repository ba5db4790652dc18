use std::collections::HashMap;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Configuration for a single backend provider
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Wire protocol family the provider speaks
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Base endpoint URL
    pub endpoint: Url,
    /// Credentials and how to present them
    pub authentication: AuthConfig,
    /// Models this provider serves
    pub models: Vec<String>,
    /// Per-model max_tokens caps forwarded upstream
    #[serde(default)]
    pub max_tokens: HashMap<String, u32>,
    /// Server-stage network timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Overall per-request deadline in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry policy for transient upstream failures
    #[serde(default)]
    pub retry: RetryConfig,
    /// Health probe settings
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Selection weight among bindings of a category
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Tie-break priority (lower wins)
    #[serde(default)]
    pub priority: u32,
    /// Concurrency cap; at the cap the binding is not selectable
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: u32,
    /// Models never to route to this provider
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Endpoint-peculiar behaviors handled by the compat stage
    #[serde(default)]
    pub quirks: CompatQuirks,
}

/// Supported provider wire protocols
///
/// The set is closed; unknown values are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI chat-completions API
    Openai,
    /// Google Gemini generateContent API
    Gemini,
    /// AWS CodeWhisperer conversation API
    Codewhisperer,
    /// Local OpenAI-compatible server (LM Studio, Ollama, vLLM, ...)
    OpenaiCompat,
}

/// How to authenticate against the provider
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Credential presentation scheme
    #[serde(rename = "type", default)]
    pub kind: AuthKind,
    /// One of `api_key`, `api_keys`, or `tokens` must be present
    /// unless the scheme is `none`
    #[serde(default)]
    pub credentials: Credentials,
}

/// Credential presentation scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// `Authorization: Bearer <key>`
    #[default]
    Bearer,
    /// `x-api-key: <key>`
    ApiKey,
    /// No credentials (local servers)
    None,
}

/// Raw credential material
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    /// Single API key
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Multiple API keys; triggers multi-key expansion
    #[serde(default)]
    pub api_keys: Option<Vec<SecretString>>,
    /// Long-lived tokens (CodeWhisperer)
    #[serde(default)]
    pub tokens: Option<Vec<SecretString>>,
}

impl AuthConfig {
    /// Flatten the declared credentials into an ordered list
    ///
    /// Providers declared with more than one entry are expanded into one
    /// binding per credential by the registry.
    pub fn credential_list(&self) -> Vec<SecretString> {
        if self.kind == AuthKind::None {
            return Vec::new();
        }
        if let Some(keys) = &self.credentials.api_keys {
            return keys.clone();
        }
        if let Some(tokens) = &self.credentials.tokens {
            return tokens.clone();
        }
        self.credentials.api_key.clone().into_iter().collect()
    }
}

/// Retry policy for transient upstream failures
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before the first retry
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    /// Multiplier applied per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap on the delay between attempts
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (1-based), exponential and capped
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1).try_into().unwrap_or(i32::MAX));
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = (self.delay_ms as f64 * factor) as u64;
        delay.min(self.max_delay_ms)
    }
}

/// Health probe settings for a provider
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// Whether the background probe loop runs for this provider
    #[serde(default)]
    pub enabled: bool,
    /// Model used for the probe request (defaults to the first declared model)
    #[serde(default)]
    pub model: Option<String>,
    /// Probe deadline in milliseconds
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Interval between probes in milliseconds
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive probe failures before the binding is marked unhealthy
    #[serde(default = "default_health_retry_count")]
    pub retry_count: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: None,
            timeout_ms: default_health_timeout_ms(),
            interval_ms: default_health_interval_ms(),
            retry_count: default_health_retry_count(),
        }
    }
}

/// Endpoint-peculiar behaviors applied by the server-compat stage
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompatQuirks {
    /// Family tag for servers with known reply defects
    /// (e.g. "qwen" or "modelscope" for missing finish_reason handling)
    #[serde(default)]
    pub model_family: Option<String>,
    /// Extra literal framings the textual tool-call detector should match
    #[serde(default)]
    pub tool_call_literals: Vec<String>,
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_request_timeout_ms() -> u64 {
    120_000
}

const fn default_weight() -> u32 {
    1
}

const fn default_max_concurrent() -> u32 {
    16
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    2_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

const fn default_health_timeout_ms() -> u64 {
    5_000
}

const fn default_health_interval_ms() -> u64 {
    60_000
}

const fn default_health_retry_count() -> u32 {
    3
}
