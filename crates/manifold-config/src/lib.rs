//! Configuration for the Manifold proxy
//!
//! The configuration document is TOML with `{{ env.VAR }}` placeholders,
//! deserialized with `deny_unknown_fields` and cross-validated after
//! parse. Validation is strict: a routing target must name an existing
//! provider whose model list contains the referenced model, required
//! categories must resolve to at least one binding, and unknown provider
//! types are rejected at parse time.

mod env;
mod loader;
mod preprocessing;
mod provider;
mod routing;
mod server;

use indexmap::IndexMap;
use serde::Deserialize;

pub use env::expand_env;
pub use preprocessing::{PreprocessingConfig, ProcessorConfig};
pub use provider::{
    AuthConfig, AuthKind, CompatQuirks, Credentials, HealthCheckConfig, ProviderConfig, ProviderKind, RetryConfig,
};
pub use routing::{
    Category, CategoryConfig, ClassifierConfig, GlobalSettings, LoadBalancingConfig, RateLimitSettings, RouteTarget,
    RoutingConfig, Strategy,
};
pub use server::ServerConfig;

/// Root configuration document
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Provider declarations keyed by provider id
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,
    /// Category routing table and classifier knobs
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Response preprocessing toggles
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
}
