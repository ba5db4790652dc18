use std::path::Path;

use crate::{Category, Config, RouteTarget};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, variable expansion
    /// fails, TOML parsing fails, or validation fails.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        let expanded =
            crate::env::expand_env(&raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error when a routing target names an unknown provider
    /// or model, a provider declares no usable credentials or models, or
    /// a required category has no targets.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_providers()?;
        self.validate_routing()?;
        Ok(())
    }

    fn validate_providers(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("at least one provider must be configured");
        }

        for (name, provider) in &self.providers {
            if provider.models.is_empty() {
                anyhow::bail!("provider '{name}' declares no models");
            }
            if provider.weight == 0 {
                anyhow::bail!("provider '{name}' has zero weight; weights must be positive");
            }
            if provider.authentication.kind != crate::AuthKind::None
                && provider.authentication.credential_list().is_empty()
            {
                anyhow::bail!("provider '{name}' requires credentials but declares none");
            }
            for model in &provider.blacklist {
                if provider.models.contains(model) {
                    anyhow::bail!("provider '{name}' both serves and blacklists model '{model}'");
                }
            }
        }

        Ok(())
    }

    fn validate_routing(&self) -> anyhow::Result<()> {
        for (category, entry) in &self.routing.categories {
            self.validate_target(*category, &entry.primary)?;
            for backup in &entry.backups {
                self.validate_target(*category, backup)?;
            }
        }

        if let Some(fallback) = &self.routing.global_settings.fallback_provider
            && !self.providers.contains_key(fallback)
        {
            anyhow::bail!("fallback provider '{fallback}' is not configured");
        }

        Ok(())
    }

    fn validate_target(&self, category: Category, target: &RouteTarget) -> anyhow::Result<()> {
        let Some(provider) = self.providers.get(&target.provider) else {
            anyhow::bail!(
                "category '{category}' references unknown provider '{}'",
                target.provider
            );
        };

        if !provider.models.contains(&target.model) {
            anyhow::bail!(
                "category '{category}' references model '{}' which provider '{}' does not serve",
                target.model,
                target.provider
            );
        }

        if provider.blacklist.contains(&target.model) {
            anyhow::bail!(
                "category '{category}' references blacklisted model '{}' on provider '{}'",
                target.model,
                target.provider
            );
        }

        if let Some(0) = target.weight {
            anyhow::bail!("category '{category}' target '{}' has zero weight", target.provider);
        }

        Ok(())
    }
}
