//! Experiment configuration: strategy definitions, model registry, and the
//! global compaction threshold, loaded from YAML.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Human-readable name for this run. Informational only.
    #[serde(default)]
    pub experiment_name: String,
    /// Token count above which compaction engages (ACE ignores it).
    pub compact_threshold: usize,
    /// Model used when a session does not pick one explicitly.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Strategy used when a session does not pick one explicitly.
    #[serde(default)]
    pub default_strategy: Option<String>,
    /// Strategy key → settings. Keys are what callers pass to
    /// `apply_strategy`.
    pub strategies: HashMap<String, StrategySettings>,
    /// Model key → definition (context window, endpoint, credentials).
    #[serde(default)]
    pub models: HashMap<String, ModelDef>,
}

/// Per-strategy settings, discriminated by the `type` field in YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategySettings {
    Truncation {
        /// Token budget for the truncated trace. Defaults to the global
        /// `compact_threshold`.
        #[serde(default)]
        max_tokens: Option<usize>,
    },
    MemoryBank {
        #[serde(default = "default_top_k")]
        top_k: usize,
        /// Embedding model passed to the embedder boundary.
        #[serde(default)]
        embedding_model: Option<String>,
    },
    ProgressiveSummarization {
        /// Model used for the summarization call.
        #[serde(default)]
        summarizer_model: Option<String>,
    },
    Ace {
        /// Base model for all three agents.
        #[serde(default)]
        model: Option<String>,
        /// Per-agent overrides.
        #[serde(default)]
        generator_model: Option<String>,
        #[serde(default)]
        reflector_model: Option<String>,
        #[serde(default)]
        curator_model: Option<String>,
        /// Curator runs every this many steps (and on step 1).
        #[serde(default = "default_curator_frequency")]
        curator_frequency: usize,
        /// Target size ceiling the curator is told to keep the playbook
        /// under, in tokens.
        #[serde(default = "default_playbook_token_budget")]
        playbook_token_budget: usize,
    },
}

fn default_top_k() -> usize {
    3
}

fn default_curator_frequency() -> usize {
    3
}

fn default_playbook_token_budget() -> usize {
    4096
}

impl StrategySettings {
    /// The `type` discriminator as it appears in YAML, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StrategySettings::Truncation { .. } => "truncation",
            StrategySettings::MemoryBank { .. } => "memory_bank",
            StrategySettings::ProgressiveSummarization { .. } => "progressive_summarization",
            StrategySettings::Ace { .. } => "ace",
        }
    }
}

/// A model the engine can route requests to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelDef {
    /// Context window size in tokens, used for utilization metrics.
    pub context_window: usize,
    /// OpenAI-compatible base URL (e.g. `https://api.openai.com/v1`).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// API key, either literal or an env reference like `$OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Config {
    /// Read, parse, and validate a YAML configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> anyhow::Result<Config> {
        let mut config: Config =
            serde_yaml::from_str(contents).context("failed to parse config YAML")?;
        config.validate()?;
        config.resolve_env_keys();
        tracing::debug!(
            strategies = config.strategies.len(),
            models = config.models.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.compact_threshold == 0 {
            anyhow::bail!("config: compact_threshold must be greater than zero");
        }
        if self.strategies.is_empty() {
            anyhow::bail!("config: at least one strategy must be defined");
        }
        if let Some(ref model) = self.default_model {
            if !self.models.contains_key(model) {
                anyhow::bail!("config: default_model '{model}' not found in models");
            }
        }
        if let Some(ref strategy) = self.default_strategy {
            if !self.strategies.contains_key(strategy) {
                anyhow::bail!("config: default_strategy '{strategy}' not found in strategies");
            }
        }
        for (key, settings) in &self.strategies {
            match settings {
                StrategySettings::MemoryBank { top_k, .. } if *top_k == 0 => {
                    anyhow::bail!("config: strategy '{key}' has top_k=0");
                }
                StrategySettings::Ace { curator_frequency, .. } if *curator_frequency == 0 => {
                    anyhow::bail!("config: strategy '{key}' has curator_frequency=0");
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Replace `$VAR` / `${VAR}` api_key values with the environment value.
    /// Unresolvable references become empty strings (no auth) with a warning.
    fn resolve_env_keys(&mut self) {
        for (name, def) in self.models.iter_mut() {
            let Some(key) = def.api_key.as_mut() else { continue };
            let Some(var) = key
                .strip_prefix("${")
                .and_then(|v| v.strip_suffix('}'))
                .or_else(|| key.strip_prefix('$'))
            else {
                continue;
            };
            match std::env::var(var) {
                Ok(value) => *key = value,
                Err(_) => {
                    warn!(model = %name, var, "api_key env var not set, using empty key");
                    key.clear();
                }
            }
        }
    }

    /// Settings for a strategy key, when configured.
    pub fn strategy(&self, key: &str) -> Option<&StrategySettings> {
        self.strategies.get(key)
    }

    /// Context window for a model key, when registered.
    pub fn context_window(&self, model_key: &str) -> Option<usize> {
        self.models.get(model_key).map(|m| m.context_window)
    }
}
