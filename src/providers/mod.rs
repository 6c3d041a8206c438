pub mod anthropic;
pub mod citations;
pub mod error;
pub mod google;
pub mod ollama;
pub mod openai;
pub mod openai_responses;
pub mod passthrough;
pub mod registry;
pub mod streaming;
pub mod tools;
pub mod transport;

use crate::models::{ChatRequest, ModelSpec, ResponseFragment};
use error::ProviderError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use streaming::{Frame, Framing};
use transport::HttpRequest;
use url::Url;

/// Closed set of backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "passthrough")]
    Passthrough,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenAiResponses => "openai-responses",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Passthrough => "passthrough",
        }
    }

    /// Stream framing used by this family
    pub fn framing(&self) -> Framing {
        match self {
            ProviderKind::Google => Framing::ConcatenatedJson,
            ProviderKind::Ollama => Framing::DirectObject,
            _ => Framing::EventStream,
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi | ProviderKind::OpenAiResponses => Some("https://api.openai.com/v1"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com"),
            ProviderKind::Google => Some("https://generativelanguage.googleapis.com/v1beta"),
            ProviderKind::Ollama => Some("http://localhost:11434"),
            ProviderKind::Passthrough => None,
        }
    }

    pub fn default_auth(&self) -> AuthStyle {
        match self {
            ProviderKind::Anthropic => AuthStyle::XApiKey,
            ProviderKind::Google => AuthStyle::QueryKey,
            _ => AuthStyle::Bearer,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the credential is attached to outbound requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-api-key: <key>`
    XApiKey,
    /// `?key=<key>`
    QueryKey,
    None,
}

fn serialize_secret<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match secret {
        Some(_) => serializer.serialize_str("********"),
        None => serializer.serialize_none(),
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(SecretString::new))
}

/// Provider configuration from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub provider_type: ProviderKind,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub api_key: Option<SecretString>,
    /// Environment variable holding the key, read when `api_key` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Buffered endpoint path; `{model}` is replaced by the upstream model id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Streaming endpoint path, defaults to `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthStyle>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Responses API: keep responses server-side so they can be continued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, provider_type: ProviderKind) -> Self {
        Self {
            name: name.into(),
            provider_type,
            api_key: None,
            api_key_env: None,
            base_url: None,
            path: None,
            stream_path: None,
            auth: None,
            headers: BTreeMap::new(),
            enabled: None,
            store: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// The configured key, falling back to `api_key_env`
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
            .map(SecretString::new)
    }
}

/// Resolved connection settings shared by every adapter
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub auth: AuthStyle,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub path: Option<String>,
    pub stream_path: Option<String>,
}

impl ProviderSettings {
    /// Resolve a provider entry against its family defaults
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let kind = config.provider_type;
        let base_url = config
            .base_url
            .clone()
            .or_else(|| kind.default_base_url().map(str::to_string))
            .ok_or_else(|| {
                ProviderError::ConfigError(format!(
                    "Provider '{}' ({}) requires base_url",
                    config.name, kind
                ))
            })?;
        Url::parse(&base_url).map_err(|e| {
            ProviderError::ConfigError(format!(
                "Provider '{}' has invalid base_url '{}': {}",
                config.name, base_url, e
            ))
        })?;

        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    ProviderError::ConfigError(format!("Invalid header name '{}': {}", name, e))
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    ProviderError::ConfigError(format!("Invalid header value for '{}': {}", name, e))
                })?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        Ok(Self {
            name: config.name.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.resolve_api_key(),
            auth: config.auth.unwrap_or_else(|| kind.default_auth()),
            headers,
            path: config.path.clone(),
            stream_path: config.stream_path.clone(),
        })
    }

    /// Build the outbound request. `default_path` / `default_stream_path`
    /// apply when the configuration does not override them.
    pub fn request(
        &self,
        default_path: &str,
        default_stream_path: &str,
        model: &str,
        stream: bool,
        body: Value,
    ) -> Result<HttpRequest, ProviderError> {
        let path = if stream {
            self.stream_path
                .as_deref()
                .or(self.path.as_deref())
                .unwrap_or(default_stream_path)
        } else {
            self.path.as_deref().unwrap_or(default_path)
        };
        let path = path.replace("{model}", model);

        let mut url = Url::parse(&format!("{}{}", self.base_url, path)).map_err(|e| {
            ProviderError::ConfigError(format!("Invalid endpoint for '{}': {}", self.name, e))
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }

        if let Some(key) = &self.api_key {
            let key = key.expose_secret();
            match self.auth {
                AuthStyle::Bearer => {
                    headers.insert(AUTHORIZATION, sensitive(&format!("Bearer {}", key))?);
                }
                AuthStyle::XApiKey => {
                    headers.insert(HeaderName::from_static("x-api-key"), sensitive(key)?);
                }
                AuthStyle::QueryKey => {
                    url.query_pairs_mut().append_pair("key", key);
                }
                AuthStyle::None => {}
            }
        }

        Ok(HttpRequest {
            method: Method::POST,
            url,
            headers,
            body,
        })
    }
}

fn sensitive(value: &str) -> Result<HeaderValue, ProviderError> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| ProviderError::ConfigError(format!("Invalid credential header: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Backend-native request body, plus where the continuation reference
/// lives in it (if the family supports one)
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPayload {
    pub body: Value,
    pub continuation_key: Option<&'static str>,
}

impl ProviderPayload {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            continuation_key: None,
        }
    }

    pub fn with_continuation_key(mut self, key: &'static str) -> Self {
        self.continuation_key = Some(key);
        self
    }

    /// Whether the body carries a continuation reference
    pub fn has_continuation(&self) -> bool {
        self.continuation_key
            .and_then(|key| self.body.get(key))
            .is_some_and(|v| !v.is_null())
    }

    /// Same payload with the continuation reference removed
    pub fn without_continuation(mut self) -> Self {
        if let (Some(key), Some(map)) = (self.continuation_key, self.body.as_object_mut()) {
            map.remove(key);
        }
        self
    }
}

/// Decodes one logical unit of a streamed response. Instances are created
/// per request and may keep state across units.
pub trait StreamDecoder: Send {
    fn decode(&mut self, frame: &Frame) -> Result<ResponseFragment, ProviderError>;
}

/// One backend family
pub trait ChatProvider: Send + Sync {
    /// Configured provider name
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn framing(&self) -> Framing {
        self.kind().framing()
    }

    /// Translate the unified request into the backend's payload
    fn format_payload(
        &self,
        request: &ChatRequest,
        model: &ModelSpec,
        stream: bool,
    ) -> Result<ProviderPayload, ProviderError>;

    /// Endpoint, headers and auth for a formatted payload
    fn build_request(
        &self,
        model: &ModelSpec,
        payload: &ProviderPayload,
        stream: bool,
    ) -> Result<HttpRequest, ProviderError>;

    /// Fresh decoder for one streamed response
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    /// Decode a complete non-streamed response body
    fn decode_buffered(&self, body: &[u8]) -> Result<ResponseFragment, ProviderError>;
}

/// Read a non-negative token counter
pub(crate) fn token_count(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Insert `value` under `key` only when the caller supplied it
pub(crate) fn insert_opt<T: Serialize>(body: &mut Value, key: &str, value: Option<T>) {
    if let (Some(value), Some(map)) = (value, body.as_object_mut()) {
        if let Ok(value) = serde_json::to_value(value) {
            map.insert(key.to_string(), value);
        }
    }
}

/// Parse a buffered body, mapping failures to protocol errors
pub(crate) fn parse_body(body: &[u8]) -> Result<Value, ProviderError> {
    serde_json::from_slice(body).map_err(|e| {
        let preview: String = String::from_utf8_lossy(body).chars().take(120).collect();
        ProviderError::Protocol(format!("{} (body: {})", e, preview))
    })
}

/// Extract a backend error message from `{"error": ...}` shaped units
pub(crate) fn error_message(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    Some(
        error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
            .unwrap_or_else(|| error.to_string()),
    )
}

// Re-export provider implementations
pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;
pub use openai_responses::OpenAIResponsesProvider;
pub use passthrough::PassthroughProvider;
pub use registry::ProviderRegistry;
