//! Shared proxy state, constructed once at startup
//!
//! No global singletons: everything a request task needs travels in this
//! state value (registry, balancer, classifier, event sink).

use std::sync::Arc;
use std::time::{Duration, Instant};

use manifold_balance::{BlacklistConfig, BreakerConfig, LoadBalancer};
use manifold_config::{Category, Config};
use manifold_core::{EventSink, ProxyError};

use crate::preprocess::Preprocessor;
use crate::registry::{CategoryRoute, PipelineRegistry};
use crate::router::Classifier;

/// Shared state for the proxy's route handlers
#[derive(Clone)]
pub struct ProxyState {
    inner: Arc<ProxyStateInner>,
}

struct ProxyStateInner {
    registry: PipelineRegistry,
    balancer: LoadBalancer,
    classifier: Classifier,
    default_category: Category,
    drain_timeout: Duration,
    sink: EventSink,
    started_at: Instant,
}

impl ProxyState {
    /// Build the full proxy core from validated configuration
    ///
    /// # Errors
    ///
    /// Returns an error when the registry cannot be built from the
    /// routing table.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::from_config_with_sink(config, EventSink::disabled())
    }

    /// Build with an explicit capture sink
    ///
    /// # Errors
    ///
    /// As `from_config`.
    pub fn from_config_with_sink(config: &Config, sink: EventSink) -> anyhow::Result<Self> {
        let preprocessor = Arc::new(Preprocessor::new(&config.preprocessing));
        let registry = PipelineRegistry::from_config(config, &preprocessor)?;
        let balancer = LoadBalancer::new(BreakerConfig::default(), BlacklistConfig::default());

        registry.register_groups(&balancer);
        registry.initialize_all();

        Ok(Self {
            inner: Arc::new(ProxyStateInner {
                registry,
                balancer,
                classifier: Classifier::new(config.routing.classifier.clone()),
                default_category: config.routing.global_settings.default_category,
                drain_timeout: Duration::from_millis(config.server.drain_timeout_ms),
                sink,
                started_at: Instant::now(),
            }),
        })
    }

    /// The pipeline registry
    pub fn registry(&self) -> &PipelineRegistry {
        &self.inner.registry
    }

    /// The load balancer and fault substrate
    pub fn balancer(&self) -> &LoadBalancer {
        &self.inner.balancer
    }

    /// The category classifier
    pub fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }

    /// The stage event sink
    pub fn sink(&self) -> &EventSink {
        &self.inner.sink
    }

    /// Uptime since state construction
    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Resolve the routing entry for a classified category
    ///
    /// A category with no table entry falls through to the default
    /// category, logged, never silent. Only when the default is missing
    /// too does resolution fail.
    ///
    /// # Errors
    ///
    /// `ProxyError::NoEligibleBinding` when neither the category nor the
    /// default category has any bindings.
    pub fn resolve_route(&self, category: Category) -> Result<(Category, &CategoryRoute), ProxyError> {
        if let Some(route) = self.inner.registry.route(category) {
            return Ok((category, route));
        }

        let fallback = self.inner.default_category;
        if fallback != category
            && let Some(route) = self.inner.registry.route(fallback)
        {
            tracing::warn!(
                category = %category,
                fallback = %fallback,
                "category has no routing entry, falling through"
            );
            return Ok((fallback, route));
        }

        Err(ProxyError::NoEligibleBinding {
            category: category.to_string(),
        })
    }

    /// Ordered shutdown: stop intake, drain bounded, destroy stages
    pub async fn shutdown(&self) {
        self.inner
            .registry
            .shutdown_all(&self.inner.balancer, self.inner.drain_timeout)
            .await;
    }
}
