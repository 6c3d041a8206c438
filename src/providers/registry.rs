use super::error::ProviderError;
use super::{
    AnthropicProvider, ChatProvider, GoogleProvider, OllamaProvider, OpenAIProvider,
    OpenAIResponsesProvider, PassthroughProvider, ProviderConfig, ProviderKind, ProviderSettings,
};
use crate::cli::ModelConfig;
use crate::models::{ModelCapabilities, ModelSpec};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A model id resolved to its adapter and backend-facing description
#[derive(Clone)]
pub struct ResolvedModel {
    pub name: String,
    pub provider: Arc<dyn ChatProvider>,
    pub spec: ModelSpec,
}

/// Public listing entry for a configured model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub provider_type: ProviderKind,
    pub upstream_model: String,
    pub capabilities: ModelCapabilities,
}

struct ModelEntry {
    provider: String,
    spec: ModelSpec,
}

/// Provider registry that manages all configured providers and models
pub struct ProviderRegistry {
    /// Map of provider name -> provider instance
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    /// Map of model name -> provider name and model description
    models: HashMap<String, ModelEntry>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            models: HashMap::new(),
        }
    }

    /// Build every enabled provider and map the configured models onto them
    pub fn from_configs_with_models(
        configs: &[ProviderConfig],
        models: &[ModelConfig],
    ) -> Result<Self, ProviderError> {
        let mut registry = Self::new();

        for config in configs {
            // Skip disabled providers
            if !config.is_enabled() {
                continue;
            }
            registry.register_provider(build_provider(config)?);
        }

        for model in models {
            if !registry.providers.contains_key(&model.provider) {
                warn!(
                    "Model '{}' references unavailable provider '{}', skipping",
                    model.name, model.provider
                );
                continue;
            }
            registry.register_model(&model.name, &model.provider, model.spec());
        }

        Ok(registry)
    }

    pub fn register_provider(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn register_model(&mut self, name: &str, provider: &str, spec: ModelSpec) {
        self.models.insert(
            name.to_string(),
            ModelEntry {
                provider: provider.to_string(),
                spec,
            },
        );
    }

    /// Get a provider by name
    pub fn get_provider(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(name).cloned()
    }

    /// Resolve a caller-facing model id
    pub fn resolve(&self, model: &str) -> Result<ResolvedModel, ProviderError> {
        let entry = self
            .models
            .get(model)
            .ok_or_else(|| ProviderError::ModelNotSupported(model.to_string()))?;
        let provider = self
            .providers
            .get(&entry.provider)
            .cloned()
            .ok_or_else(|| ProviderError::ModelNotSupported(model.to_string()))?;

        Ok(ResolvedModel {
            name: model.to_string(),
            provider,
            spec: entry.spec.clone(),
        })
    }

    /// List all available models, sorted by name
    pub fn list_models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = self
            .models
            .iter()
            .filter_map(|(name, entry)| {
                let provider = self.providers.get(&entry.provider)?;
                Some(ModelInfo {
                    name: name.clone(),
                    provider: entry.provider.clone(),
                    provider_type: provider.kind(),
                    upstream_model: entry.spec.upstream_model.clone(),
                    capabilities: entry.spec.capabilities,
                })
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    /// List all providers, sorted by name
    pub fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the adapter for one provider entry
fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let settings = ProviderSettings::from_config(config)?;
    if settings.api_key.is_none() && requires_key(config.provider_type) {
        warn!(
            "Provider '{}' has no API key configured, requests will likely be rejected",
            config.name
        );
    }

    let provider: Arc<dyn ChatProvider> = match config.provider_type {
        ProviderKind::OpenAi => Arc::new(OpenAIProvider::new(settings)),
        ProviderKind::OpenAiResponses => Arc::new(OpenAIResponsesProvider::new(
            settings,
            config.store.unwrap_or(true),
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(settings)),
        ProviderKind::Google => Arc::new(GoogleProvider::new(settings)),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(settings)),
        ProviderKind::Passthrough => Arc::new(PassthroughProvider::new(settings)),
    };
    Ok(provider)
}

fn requires_key(kind: ProviderKind) -> bool {
    !matches!(kind, ProviderKind::Ollama | ProviderKind::Passthrough)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn provider_config(name: &str, kind: ProviderKind) -> ProviderConfig {
        let mut config = ProviderConfig::new(name, kind);
        config.api_key = Some(SecretString::new("test-key".to_string()));
        config
    }

    fn model_config(name: &str, provider: &str) -> ModelConfig {
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
    fn test_empty_registry() {
        let registry = ProviderRegistry::new();
        assert!(registry.list_models().is_empty());
        assert!(registry.list_providers().is_empty());
    }

    #[test]
    fn test_resolve_unknown_model() {
        let registry = ProviderRegistry::new();
        let result = registry.resolve("gpt-4");
        assert!(matches!(result, Err(ProviderError::ModelNotSupported(_))));
    }

    #[test]
    fn test_models_map_onto_providers() {
        let providers = vec![
            provider_config("openai", ProviderKind::OpenAi),
            provider_config("claude", ProviderKind::Anthropic),
            provider_config("gemini", ProviderKind::Google),
        ];
        let mut fast = model_config("fast", "gemini");
        fast.upstream_model = Some("gemini-2.5-flash".to_string());
        let models = vec![model_config("gpt-4o", "openai"), model_config("sonnet", "claude"), fast];

        let registry = ProviderRegistry::from_configs_with_models(&providers, &models).unwrap();

        assert_eq!(registry.list_providers(), vec!["claude", "gemini", "openai"]);
        let names: Vec<_> = registry.list_models().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["fast", "gpt-4o", "sonnet"]);

        let resolved = registry.resolve("fast").unwrap();
        assert_eq!(resolved.provider.name(), "gemini");
        assert_eq!(resolved.provider.kind(), ProviderKind::Google);
        assert_eq!(resolved.spec.upstream_model, "gemini-2.5-flash");

        let resolved = registry.resolve("sonnet").unwrap();
        assert_eq!(resolved.spec.upstream_model, "sonnet");
    }

    #[test]
    fn test_disabled_provider_drops_its_models() {
        let mut disabled = provider_config("off", ProviderKind::OpenAi);
        disabled.enabled = Some(false);
        let providers = vec![disabled, provider_config("on", ProviderKind::Ollama)];
        let models = vec![model_config("a", "off"), model_config("b", "on")];

        let registry = ProviderRegistry::from_configs_with_models(&providers, &models).unwrap();
        assert_eq!(registry.list_providers(), vec!["on"]);
        assert!(registry.resolve("a").is_err());
        assert!(registry.resolve("b").is_ok());
    }

    #[test]
    fn test_invalid_provider_fails_to_build() {
        let providers = vec![provider_config("rag", ProviderKind::Passthrough)];
        let result = ProviderRegistry::from_configs_with_models(&providers, &[]);
        assert!(matches!(result, Err(ProviderError::ConfigError(_))));
    }
}
