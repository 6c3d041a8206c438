//! Local Ollama backend (`/api/chat`), newline-delimited JSON objects.

use super::error::ProviderError;
use super::streaming::Frame;
use super::transport::HttpRequest;
use super::{
    error_message, insert_opt, parse_body, token_count, ChatProvider, ProviderKind,
    ProviderPayload, ProviderSettings, StreamDecoder,
};
use crate::models::{ChatRequest, ModelSpec, ResponseFragment, Usage};
use serde_json::{json, Map, Value};

const CHAT_PATH: &str = "/api/chat";

pub struct OllamaProvider {
    settings: ProviderSettings,
}

impl OllamaProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

impl ChatProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn format_payload(
        &self,
        request: &ChatRequest,
        model: &ModelSpec,
        stream: bool,
    ) -> Result<ProviderPayload, ProviderError> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content.text}))
            .collect();

        let mut body = json!({
            "model": model.upstream_model,
            "messages": messages,
            "stream": stream,
        });

        let sampling = &request.sampling;
        let mut options = Value::Object(Map::new());
        insert_opt(&mut options, "temperature", sampling.temperature);
        insert_opt(&mut options, "top_p", sampling.top_p);
        insert_opt(&mut options, "num_predict", sampling.max_tokens.or(model.max_tokens));
        if options.as_object().is_some_and(|o| !o.is_empty()) {
            insert_opt(&mut body, "options", Some(options));
        }

        if request.reasoning_for(&model.capabilities).is_some() {
            insert_opt(&mut body, "think", Some(true));
        }

        Ok(ProviderPayload::new(body))
    }

    fn build_request(
        &self,
        model: &ModelSpec,
        payload: &ProviderPayload,
        stream: bool,
    ) -> Result<HttpRequest, ProviderError> {
        self.settings.request(
            CHAT_PATH,
            CHAT_PATH,
            &model.upstream_model,
            stream,
            payload.body.clone(),
        )
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OllamaDecoder {
            provider: self.settings.name.clone(),
        })
    }

    fn decode_buffered(&self, body: &[u8]) -> Result<ResponseFragment, ProviderError> {
        let value = parse_body(body)?;
        let mut fragment = decode_unit(&self.settings.name, &value);
        // Non-streamed replies always carry the whole answer
        fragment.is_done = true;
        if fragment.usage.is_none() {
            fragment.usage = usage_of(&value);
        }
        Ok(fragment)
    }
}

/// Usage from Ollama's counters: completion is the eval counter minus the
/// prompt counter, never below zero.
fn usage_of(value: &Value) -> Option<Usage> {
    let eval = token_count(value, "eval_count")?;
    let prompt = token_count(value, "prompt_eval_count")?;
    Some(Usage::new(prompt, eval.saturating_sub(prompt)))
}

fn decode_unit(provider: &str, value: &Value) -> ResponseFragment {
    if let Some(message) = error_message(value) {
        return ResponseFragment::failure(format!("{} backend error: {}", provider, message));
    }

    let text = value
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut fragment = ResponseFragment::delta(text);

    if value.get("done").and_then(Value::as_bool) == Some(true) {
        fragment.is_done = true;
        fragment.usage = usage_of(value);
    }
    fragment
}

struct OllamaDecoder {
    provider: String,
}

impl StreamDecoder for OllamaDecoder {
    fn decode(&mut self, frame: &Frame) -> Result<ResponseFragment, ProviderError> {
        let value = frame.json()?;
        Ok(decode_unit(&self.provider, &value))
    }
}
