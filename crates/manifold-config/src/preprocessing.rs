use indexmap::IndexMap;
use serde::Deserialize;

/// Response preprocessing toggles
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreprocessingConfig {
    /// Master switch for the response preprocessor
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-processor toggles keyed by processor name
    /// (`tool_call_repair`, `termination_normalize`, `abnormal_classify`)
    #[serde(default)]
    pub processors: IndexMap<String, ProcessorConfig>,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            processors: IndexMap::new(),
        }
    }
}

impl PreprocessingConfig {
    /// Whether a named processor is active
    ///
    /// Processors default to enabled when the master switch is on and the
    /// processor has no explicit entry.
    pub fn processor_enabled(&self, name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.processors.get(name).is_none_or(|p| p.enabled)
    }
}

/// Toggle and free-form options for one processor
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Whether this processor runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Processor-specific options, passed through opaquely
    #[serde(default)]
    pub options: IndexMap<String, serde_json::Value>,
}

const fn default_true() -> bool {
    true
}
