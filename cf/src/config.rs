//! ClawFlow configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main ClawFlow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Pipeline defaults
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .clawflow.yml
        let local_config = PathBuf::from(".clawflow.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/clawflow/clawflow.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("clawflow").join("clawflow.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Default model identifier; stages may override
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Context window size reported to the token meter
    #[serde(rename = "context-max")]
    pub context_max: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
            context_max: 200_000,
        }
    }
}

/// Pipeline defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-stage timeout in milliseconds
    #[serde(rename = "stage-timeout-ms")]
    pub stage_timeout_ms: u64,

    /// Rejections in a phase before the circuit breaker trips
    #[serde(rename = "circuit-breaker-threshold")]
    pub circuit_breaker_threshold: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 15 * 60 * 1000,
            circuit_breaker_threshold: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.pipeline.stage_timeout_ms, 900_000);
        assert_eq!(config.pipeline.circuit_breaker_threshold, 3);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
llm:
  model: claude-opus-4
  api-key-env: MY_API_KEY
  max-tokens: 8192

pipeline:
  stage-timeout-ms: 600000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.model, "claude-opus-4");
        assert_eq!(config.llm.api_key_env, "MY_API_KEY");
        assert_eq!(config.pipeline.stage_timeout_ms, 600_000);
        // Defaults fill unspecified fields
        assert_eq!(config.llm.base_url, "https://api.anthropic.com");
        assert_eq!(config.pipeline.circuit_breaker_threshold, 3);
    }
}
