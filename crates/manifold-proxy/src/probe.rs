//! Background health probes
//!
//! Optional per-provider probe loops. A probe is synthetic traffic, so
//! failures blacklist the binding for the probe interval instead of
//! feeding the circuit breaker; a success clears the entry like any
//! other success.

use std::time::Duration;

use manifold_balance::BlacklistReason;
use manifold_config::Config;
use manifold_core::ProxyError;
use tokio_util::sync::CancellationToken;

use crate::state::ProxyState;

/// Spawn one probe loop per provider with health checks enabled
pub fn spawn_probes(state: &ProxyState, config: &Config, shutdown: &CancellationToken) {
    for (provider_id, provider) in &config.providers {
        if !provider.health_check.enabled {
            continue;
        }

        let model = provider
            .health_check
            .model
            .clone()
            .or_else(|| provider.models.first().cloned());
        let Some(model) = model else {
            continue;
        };

        let pipelines: Vec<_> = state
            .registry()
            .pipelines()
            .filter(|p| p.provider() == provider_id)
            .cloned()
            .collect();
        if pipelines.is_empty() {
            continue;
        }

        let state = state.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_millis(provider.health_check.interval_ms);
        let timeout = Duration::from_millis(provider.health_check.timeout_ms);
        let retry_count = provider.health_check.retry_count.max(1);
        let provider_id = provider_id.clone();

        tokio::spawn(async move {
            let mut failures: Vec<u32> = vec![0; pipelines.len()];

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                for (i, pipeline) in pipelines.iter().enumerate() {
                    match pipeline.probe(&model, timeout).await {
                        Ok(()) => {
                            failures[i] = 0;
                            state.balancer().blacklist().record_success(pipeline.binding(), &model);
                        }
                        Err(e) => {
                            failures[i] += 1;
                            tracing::warn!(
                                provider = %provider_id,
                                binding = %pipeline.binding(),
                                consecutive = failures[i],
                                error = %e,
                                "health probe failed"
                            );

                            if failures[i] >= retry_count {
                                let reason = match e {
                                    ProxyError::Network(_) | ProxyError::Timeout(_) => BlacklistReason::NetworkError,
                                    _ => BlacklistReason::ServerError,
                                };
                                state
                                    .balancer()
                                    .blacklist()
                                    .record_probe_failure(pipeline.binding(), reason);
                            }
                        }
                    }
                }
            }

            tracing::debug!(provider = %provider_id, "probe loop stopped");
        });
    }
}
