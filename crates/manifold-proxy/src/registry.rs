//! Pipeline registry: owns every provider binding's pipeline
//!
//! Bindings are created at startup from configuration. A provider
//! declared with K>1 credentials expands into K bindings named
//! `{provider}-key{i}` sharing the endpoint and model; the group keeps
//! the aggregate weight and rotates keys round-robin inside the
//! balancer. The registry never exposes a partially initialized
//! pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use manifold_balance::{Candidate, LoadBalancer};
use manifold_config::{Category, Config, Strategy};

use crate::pipeline::{Pipeline, PipelineSpec, PipelineState};
use crate::preprocess::Preprocessor;

/// Routing entry for one category
#[derive(Debug, Clone)]
pub struct CategoryRoute {
    /// Selectable bindings, primary first
    pub candidates: Vec<Candidate>,
    /// Selection strategy
    pub strategy: Strategy,
    /// Whether a failed binding is retried on another candidate
    pub enable_failover: bool,
    /// Bindings tried at most per request
    pub max_failures: u32,
}

/// Owns all pipelines and the category routing table
pub struct PipelineRegistry {
    pipelines: IndexMap<(String, String), Arc<Pipeline>>,
    routes: HashMap<Category, CategoryRoute>,
    key_groups: HashMap<String, Vec<String>>,
}

impl PipelineRegistry {
    /// Build every binding and the routing table from configuration
    ///
    /// # Errors
    ///
    /// Returns an error when a category references an unknown provider
    /// or model (configuration validation catches this earlier, but the
    /// registry still refuses to build an inconsistent table) or when a
    /// required category resolves to zero bindings.
    pub fn from_config(config: &Config, preprocessor: &Arc<Preprocessor>) -> anyhow::Result<Self> {
        let mut registry = Self {
            pipelines: IndexMap::new(),
            routes: HashMap::new(),
            key_groups: HashMap::new(),
        };

        for (category, entry) in &config.routing.categories {
            let mut candidates: Vec<(u32, Candidate)> = Vec::new();

            for target in std::iter::once(&entry.primary).chain(entry.backups.iter()) {
                let provider = config
                    .providers
                    .get(&target.provider)
                    .ok_or_else(|| anyhow::anyhow!("category '{category}' references unknown provider"))?;

                if !provider.models.contains(&target.model) {
                    anyhow::bail!(
                        "category '{category}' references model '{}' not served by '{}'",
                        target.model,
                        target.provider
                    );
                }

                let credentials = provider.authentication.credential_list();
                let expand = credentials.len() > 1 && config.routing.global_settings.enable_multi_key_expansion;
                let weight = target.weight.unwrap_or(provider.weight);

                if expand {
                    let members: Vec<String> = (0..credentials.len())
                        .map(|i| format!("{}-key{i}", target.provider))
                        .collect();

                    for (member, credential) in members.iter().zip(credentials.iter()) {
                        registry.ensure_pipeline(member, provider, target, Some(credential.clone()), preprocessor);
                    }

                    registry
                        .key_groups
                        .entry(target.provider.clone())
                        .or_insert_with(|| members.clone());

                    candidates.push((
                        provider.priority,
                        Candidate {
                            binding: target.provider.clone(),
                            model: target.model.clone(),
                            weight,
                            max_in_flight: provider.max_concurrent_requests,
                            key_group: Some(target.provider.clone()),
                        },
                    ));
                } else {
                    registry.ensure_pipeline(
                        &target.provider,
                        provider,
                        target,
                        credentials.first().cloned(),
                        preprocessor,
                    );

                    candidates.push((
                        provider.priority,
                        Candidate {
                            binding: target.provider.clone(),
                            model: target.model.clone(),
                            weight,
                            max_in_flight: provider.max_concurrent_requests,
                            key_group: None,
                        },
                    ));
                }
            }

            if entry.required && candidates.is_empty() {
                anyhow::bail!("required category '{category}' has no bindings");
            }

            // Lower priority wins; the stable sort keeps declaration
            // order (primary first) among equal priorities
            candidates.sort_by_key(|(priority, _)| *priority);

            registry.routes.insert(
                *category,
                CategoryRoute {
                    candidates: candidates.into_iter().map(|(_, candidate)| candidate).collect(),
                    strategy: entry.load_balancing.strategy,
                    enable_failover: entry.load_balancing.enable_failover,
                    max_failures: entry.load_balancing.max_failures,
                },
            );
        }

        Ok(registry)
    }

    /// Create the pipeline for a binding+model pair if absent
    fn ensure_pipeline(
        &mut self,
        binding: &str,
        provider: &manifold_config::ProviderConfig,
        target: &manifold_config::RouteTarget,
        credential: Option<secrecy::SecretString>,
        preprocessor: &Arc<Preprocessor>,
    ) {
        let key = (binding.to_owned(), target.model.clone());
        if self.pipelines.contains_key(&key) {
            return;
        }

        let spec = PipelineSpec {
            binding: binding.to_owned(),
            provider: target.provider.clone(),
            kind: provider.kind,
            model: target.model.clone(),
            endpoint: provider.endpoint.clone(),
            auth_kind: provider.authentication.kind,
            credential,
            quirks: provider.quirks.clone(),
            retry: provider.retry.clone(),
            timeout: Duration::from_millis(provider.timeout_ms),
            request_timeout: Duration::from_millis(provider.request_timeout_ms),
            max_tokens_cap: provider.max_tokens.get(&target.model).copied(),
        };

        self.pipelines
            .insert(key, Arc::new(Pipeline::new(spec, Arc::clone(preprocessor))));
    }

    /// Register the expanded key groups with the balancer
    pub fn register_groups(&self, balancer: &LoadBalancer) {
        for (group, members) in &self.key_groups {
            balancer.register_group(group, members.clone());
        }
    }

    /// Routing entry for a category
    pub fn route(&self, category: Category) -> Option<&CategoryRoute> {
        self.routes.get(&category)
    }

    /// Pipeline pinned to a binding+model pair
    pub fn pipeline(&self, binding: &str, model: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .get(&(binding.to_owned(), model.to_owned()))
            .map(Arc::clone)
    }

    /// All pipelines, in registration order
    pub fn pipelines(&self) -> impl Iterator<Item = &Arc<Pipeline>> {
        self.pipelines.values()
    }

    /// Bring every pipeline to `Running`
    pub fn initialize_all(&self) {
        for pipeline in self.pipelines.values() {
            pipeline.set_state(PipelineState::Initialized);
            pipeline.set_state(PipelineState::Connected);
            pipeline.set_state(PipelineState::Running);
        }
        tracing::info!(pipelines = self.pipelines.len(), "registry initialized");
    }

    /// Ordered shutdown: stop intake, drain bounded, destroy
    pub async fn shutdown_all(&self, balancer: &LoadBalancer, drain_timeout: Duration) {
        for pipeline in self.pipelines.values() {
            pipeline.set_state(PipelineState::Disconnected);
        }

        let deadline = tokio::time::Instant::now() + drain_timeout;
        while balancer.total_in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let leaked = balancer.total_in_flight();
        if leaked > 0 {
            tracing::warn!(in_flight = leaked, "drain timeout expired with requests in flight");
        }

        for pipeline in self.pipelines.values() {
            pipeline.set_state(PipelineState::Destroyed);
        }
        tracing::info!("registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(raw: &str) -> Config {
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        config
    }

    const MULTI_KEY: &str = r#"
        [providers.pool]
        type = "openai"
        endpoint = "https://api.pool.dev/v1"
        models = ["gpt-4o"]
        weight = 40
        [providers.pool.authentication]
        type = "bearer"
        credentials = { api_keys = ["k0", "k1", "k2", "k3"] }

        [providers.solo]
        type = "openai_compat"
        endpoint = "http://localhost:1234/v1"
        models = ["qwen2.5"]
        [providers.solo.authentication]
        type = "none"

        [routing.categories.default]
        primary = { provider = "pool", model = "gpt-4o" }
        backups = [{ provider = "solo", model = "qwen2.5" }]
    "#;

    #[test]
    fn multi_key_provider_expands_to_member_pipelines() {
        let config = config(MULTI_KEY);
        let registry = PipelineRegistry::from_config(&config, &Arc::new(Preprocessor::all_enabled())).unwrap();

        for i in 0..4 {
            assert!(
                registry.pipeline(&format!("pool-key{i}"), "gpt-4o").is_some(),
                "missing pool-key{i}"
            );
        }
        // The group candidate keeps the aggregate weight
        let route = registry.route(Category::Default).unwrap();
        assert_eq!(route.candidates[0].weight, 40);
        assert_eq!(route.candidates[0].key_group.as_deref(), Some("pool"));
        assert_eq!(route.candidates[1].key_group, None);
    }

    #[test]
    fn expansion_respects_the_global_switch() {
        let raw = format!("{MULTI_KEY}\n[routing.globalSettings]\nenable_multi_key_expansion = false\n");
        let config = config(&raw);
        let registry = PipelineRegistry::from_config(&config, &Arc::new(Preprocessor::all_enabled())).unwrap();

        assert!(registry.pipeline("pool", "gpt-4o").is_some());
        assert!(registry.pipeline("pool-key0", "gpt-4o").is_none());
    }

    #[test]
    fn lifecycle_reaches_running() {
        let config = config(MULTI_KEY);
        let registry = PipelineRegistry::from_config(&config, &Arc::new(Preprocessor::all_enabled())).unwrap();

        registry.initialize_all();
        for pipeline in registry.pipelines() {
            assert_eq!(pipeline.state(), PipelineState::Running);
        }
    }
}
