use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Backend messages that mean "the continuation reference you sent is unknown"
static STALE_CONTINUATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)previous[ _]response(?:[ _]id)?\b.*\bnot[ _]found").expect("valid regex")
});

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Model not supported: {0}")]
    ModelNotSupported(String),

    #[error("Provider API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Stream stalled: less than the minimum throughput for {}s", .window.as_secs())]
    Stalled { window: Duration },

    #[error("Malformed backend unit: {0}")]
    Protocol(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Returns true if this is a 4xx client error
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProviderError::ApiError { status, .. } if (400..500).contains(status))
    }

    /// Failure category used in caller-facing error messages
    pub fn category(&self) -> &'static str {
        match self {
            ProviderError::HttpError(_) | ProviderError::Stalled { .. } => "transport",
            ProviderError::ApiError { .. } => "backend",
            ProviderError::SerializationError(_) | ProviderError::Protocol(_) => "protocol",
            ProviderError::ConfigError(_) | ProviderError::ModelNotSupported(_) => "configuration",
            ProviderError::InvalidRequest(_) => "request",
        }
    }

    /// Whether the backend rejected a stale continuation reference
    pub fn is_stale_continuation(&self) -> bool {
        match self {
            ProviderError::ApiError { message, .. } => {
                self.is_client_error() && is_stale_continuation_message(message)
            }
            _ => false,
        }
    }

    /// Human-readable message naming the backend and the failure category
    pub fn describe(&self, provider: &str) -> String {
        format!("{} {} error: {}", provider, self.category(), self)
    }
}

/// Match a backend error text against the stale-continuation pattern
pub fn is_stale_continuation_message(message: &str) -> bool {
    STALE_CONTINUATION.is_match(message)
}
