//! Generic pass-through backend (retrieval-augmented services that speak a
//! reduced OpenAI dialect).
//!
//! Their `ragStatus` units ("Searching", "Reading 3 documents") carry no
//! answer text and are surfaced as `{"status": ...}` auxiliary fragments.

use super::error::ProviderError;
use super::openai::{decode_chat_completion, ChatCompletionsDecoder};
use super::streaming::Frame;
use super::transport::HttpRequest;
use super::{
    error_message, parse_body, ChatProvider, ProviderKind, ProviderPayload, ProviderSettings,
    StreamDecoder,
};
use crate::models::{ChatRequest, ModelSpec, ResponseFragment, Role};
use serde_json::{json, Value};
use tracing::debug;

/// Status units these services interleave with answer chunks
const STATUS_UNIT_TYPE: &str = "ragStatus";

pub struct PassthroughProvider {
    settings: ProviderSettings,
}

impl PassthroughProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

impl ChatProvider for PassthroughProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Passthrough
    }

    fn format_payload(
        &self,
        request: &ChatRequest,
        _model: &ModelSpec,
        stream: bool,
    ) -> Result<ProviderPayload, ProviderError> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| json!({"role": m.role.to_string(), "content": m.content.text}))
            .collect();

        Ok(ProviderPayload::new(json!({
            "messages": messages,
            "stream": stream,
        })))
    }

    fn build_request(
        &self,
        model: &ModelSpec,
        payload: &ProviderPayload,
        stream: bool,
    ) -> Result<HttpRequest, ProviderError> {
        self.settings
            .request("", "", &model.upstream_model, stream, payload.body.clone())
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(PassthroughDecoder {
            inner: ChatCompletionsDecoder::new(self.settings.name.clone()),
        })
    }

    fn decode_buffered(&self, body: &[u8]) -> Result<ResponseFragment, ProviderError> {
        let value = parse_body(body)?;
        if error_message(&value).is_none() {
            if let Some(text) = value.get("chat_response").and_then(Value::as_str) {
                let mut fragment = ResponseFragment::done();
                fragment.text = text.to_string();
                return Ok(fragment);
            }
        }
        decode_chat_completion(&self.settings.name, value)
    }
}

struct PassthroughDecoder {
    inner: ChatCompletionsDecoder,
}

impl StreamDecoder for PassthroughDecoder {
    fn decode(&mut self, frame: &Frame) -> Result<ResponseFragment, ProviderError> {
        let value = frame.json()?;
        if value.get("type").and_then(Value::as_str) == Some(STATUS_UNIT_TYPE) {
            debug!("Pass-through status unit: {}", frame.data);
            let status = value
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mut fragment = ResponseFragment::empty();
            fragment.auxiliary = Some(json!({ "status": status }));
            return Ok(fragment);
        }
        self.inner.decode_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, ModelCapabilities};
    use crate::providers::ProviderConfig;
    use secrecy::SecretString;

    fn provider() -> PassthroughProvider {
        let mut config = ProviderConfig::new("rag", ProviderKind::Passthrough);
        config.base_url = Some("https://rag.internal/api/chat".to_string());
        config.api_key = Some(SecretString::new("t".to_string()));
        PassthroughProvider::new(ProviderSettings::from_config(&config).unwrap())
    }

    #[test]
    fn test_payload_strips_system_and_extras() {
        let mut request = ChatRequest::new(
            "rag",
            vec![ChatMessage::system("sys"), ChatMessage::user("q")],
        );
        request.sampling.temperature = Some(0.3);
        let model = ModelSpec::new("rag", ModelCapabilities::default());
        let payload = provider().format_payload(&request, &model, true).unwrap();

        assert_eq!(
            payload.body,
            json!({"messages": [{"role": "user", "content": "q"}], "stream": true})
        );
    }

    #[test]
    fn test_request_uses_base_url_as_endpoint() {
        let model = ModelSpec::new("rag", ModelCapabilities::default());
        let payload = ProviderPayload::new(json!({}));
        let request = provider().build_request(&model, &payload, true).unwrap();
        assert_eq!(request.url.as_str(), "https://rag.internal/api/chat");
        assert_eq!(request.headers.get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn test_status_units_become_progress() {
        let mut decoder = provider().stream_decoder();
        let status = decoder
            .decode(&Frame::data(r#"{"type":"ragStatus","choices":[{"delta":{"content":"Searching"}}]}"#))
            .unwrap();
        assert!(!status.is_noop());
        assert!(!status.is_done);
        assert!(status.text.is_empty());
        assert_eq!(status.auxiliary, Some(json!({"status": "Searching"})));

        let text = decoder
            .decode(&Frame::data(r#"{"choices":[{"delta":{"content":"Answer"}}]}"#))
            .unwrap();
        assert_eq!(text.text, "Answer");
    }

    #[test]
    fn test_buffered_chat_response_field() {
        let fragment = provider()
            .decode_buffered(br#"{"chat_response":"from docs"}"#)
            .unwrap();
        assert_eq!(fragment.text, "from docs");
        assert!(fragment.is_done);

        let fragment = provider()
            .decode_buffered(br#"{"choices":[{"message":{"content":"openai shape"}}]}"#)
            .unwrap();
        assert_eq!(fragment.text, "openai shape");
    }
}
