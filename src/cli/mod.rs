use crate::models::{ModelCapabilities, ModelSpec};
use crate::providers::error::ProviderError;
use crate::providers::transport::TransportConfig;
use crate::providers::{ProviderConfig, ProviderKind};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment overrides, e.g. `LLM_RELAY_SERVER__PORT=9000`
const ENV_PREFIX: &str = "LLM_RELAY";
const ENV_SEPARATOR: &str = "__";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub usage: UsageSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    13500
}

/// Outbound call timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_low_speed_limit")]
    pub low_speed_limit_bytes: u64,
    #[serde(default = "default_low_speed_window")]
    pub low_speed_window_secs: u64,
    #[serde(default = "default_buffered_timeout")]
    pub buffered_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            low_speed_limit_bytes: default_low_speed_limit(),
            low_speed_window_secs: default_low_speed_window(),
            buffered_timeout_secs: default_buffered_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_low_speed_limit() -> u64 {
    1
}

fn default_low_speed_window() -> u64 {
    120
}

fn default_buffered_timeout() -> u64 {
    300
}

impl TransportSettings {
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            low_speed_limit_bytes: self.low_speed_limit_bytes,
            low_speed_window: Duration::from_secs(self.low_speed_window_secs),
            buffered_timeout: Duration::from_secs(self.buffered_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSettings {
    /// Append-only JSONL usage log, `~/` is expanded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

/// A model id callers can request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    /// Id sent to the backend, defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_model: Option<String>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelConfig {
    pub fn spec(&self) -> ModelSpec {
        ModelSpec {
            upstream_model: self
                .upstream_model
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            capabilities: self.capabilities,
            system_role: self.system_role.clone(),
            max_tokens: self.max_tokens,
        }
    }
}

impl AppConfig {
    /// `~/.llm-relay/config.toml`
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".llm-relay").join("config.toml"))
    }

    /// Load a TOML file layered with `LLM_RELAY_*` environment overrides
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Config file not found: {} (run `llm-relay init` to create one)",
                path.display()
            );
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let config: AppConfig = settings
            .try_deserialize()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-reference checks that serde cannot express
    pub fn validate(&self) -> Result<(), ProviderError> {
        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if !provider_names.insert(provider.name.as_str()) {
                return Err(ProviderError::ConfigError(format!(
                    "Duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.provider_type == ProviderKind::Passthrough && provider.base_url.is_none() {
                return Err(ProviderError::ConfigError(format!(
                    "Provider '{}' (passthrough) requires base_url",
                    provider.name
                )));
            }
        }

        let mut model_names = HashSet::new();
        for model in &self.models {
            if !model_names.insert(model.name.as_str()) {
                return Err(ProviderError::ConfigError(format!(
                    "Duplicate model name '{}'",
                    model.name
                )));
            }
            if !provider_names.contains(model.provider.as_str()) {
                return Err(ProviderError::ConfigError(format!(
                    "Model '{}' references unknown provider '{}'",
                    model.name, model.provider
                )));
            }
        }

        Ok(())
    }

    /// Example configuration written by `llm-relay init`
    pub fn starter() -> Self {
        let mut openai = ProviderConfig::new("openai", ProviderKind::OpenAi);
        openai.api_key_env = Some("OPENAI_API_KEY".to_string());
        let mut anthropic = ProviderConfig::new("anthropic", ProviderKind::Anthropic);
        anthropic.api_key_env = Some("ANTHROPIC_API_KEY".to_string());
        let ollama = ProviderConfig::new("ollama", ProviderKind::Ollama);

        Self {
            server: ServerConfig::default(),
            transport: TransportSettings::default(),
            usage: UsageSettings::default(),
            providers: vec![openai, anthropic, ollama],
            models: vec![
                ModelConfig {
                    name: "gpt-4o".to_string(),
                    provider: "openai".to_string(),
                    upstream_model: None,
                    capabilities: ModelCapabilities {
                        web_search: true,
                        tools: true,
                        ..ModelCapabilities::default()
                    },
                    system_role: None,
                    max_tokens: None,
                },
                ModelConfig {
                    name: "claude-sonnet".to_string(),
                    provider: "anthropic".to_string(),
                    upstream_model: Some("claude-sonnet-4-5".to_string()),
                    capabilities: ModelCapabilities {
                        streaming: true,
                        web_search: true,
                        reasoning: true,
                        tools: false,
                    },
                    system_role: None,
                    max_tokens: Some(8192),
                },
                ModelConfig {
                    name: "llama".to_string(),
                    provider: "ollama".to_string(),
                    upstream_model: Some("llama3.1:8b".to_string()),
                    capabilities: ModelCapabilities::default(),
                    system_role: None,
                    max_tokens: None,
                },
            ],
        }
    }

    /// Render the starter configuration to `path`, refusing to overwrite
    pub fn write_starter(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let rendered = toml::to_string_pretty(&Self::starter())?;
        std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(models: Vec<ModelConfig>) -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            transport: TransportSettings::default(),
            usage: UsageSettings::default(),
            providers: vec![ProviderConfig::new("p", ProviderKind::OpenAi)],
            models,
        }
    }

    fn model(name: &str, provider: &str) -> ModelConfig {
        ModelConfig {
            name: name.to_string(),
            provider: provider.to_string(),
            upstream_model: None,
            capabilities: ModelCapabilities::default(),
            system_role: None,
            max_tokens: None,
        }
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [[providers]]
            name = "openai"
            provider_type = "openai"
            api_key = "sk-test"

            [[models]]
            name = "gpt-4o"
            provider = "openai"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 13500);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.transport.low_speed_window_secs, 120);
        assert!(config.models[0].capabilities.streaming);
        assert!(!config.models[0].capabilities.web_search);
        assert_eq!(config.models[0].spec().upstream_model, "gpt-4o");
        config.validate().unwrap();
    }

    #[test]
    fn test_transport_settings_conversion() {
        let transport = TransportSettings {
            connect_timeout_secs: 2,
            ..TransportSettings::default()
        }
        .to_transport_config();
        assert_eq!(transport.connect_timeout, Duration::from_secs(2));
        assert_eq!(transport.buffered_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_unknown_provider() {
        let err = minimal(vec![model("m", "missing")]).validate().unwrap_err();
        assert!(err.to_string().contains("unknown provider 'missing'"));
    }

    #[test]
    fn test_validate_rejects_duplicate_models() {
        let err = minimal(vec![model("m", "p"), model("m", "p")])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate model name"));
    }

    #[test]
    fn test_validate_passthrough_needs_base_url() {
        let mut config = minimal(vec![]);
        config
            .providers
            .push(ProviderConfig::new("rag", ProviderKind::Passthrough));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_starter_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&AppConfig::starter()).unwrap();
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.models.len(), 3);
        assert_eq!(
            parsed.providers[1].api_key_env.as_deref(),
            Some("ANTHROPIC_API_KEY")
        );
    }
}
