use super::citations::{from_google_grounding, Citations};
use super::error::ProviderError;
use super::streaming::Frame;
use super::transport::HttpRequest;
use super::{
    error_message, parse_body, token_count, ChatProvider, ProviderKind, ProviderPayload,
    ProviderSettings, StreamDecoder,
};
use crate::models::{ChatRequest, ModelSpec, ResponseFragment, Role, Usage};
use serde_json::{json, Map, Value};

const GENERATE_PATH: &str = "/models/{model}:generateContent";
const STREAM_PATH: &str = "/models/{model}:streamGenerateContent";

/// Sentinel Google reports until a candidate has actually finished
const UNSPECIFIED_FINISH: &str = "FINISH_REASON_UNSPECIFIED";
/// Usage is repeated on every chunk; it is only final on a clean stop
const USAGE_FINISH: &str = "STOP";

/// Google Generative Language backend
pub struct GoogleProvider {
    settings: ProviderSettings,
}

impl GoogleProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

impl ChatProvider for GoogleProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn format_payload(
        &self,
        request: &ChatRequest,
        model: &ModelSpec,
        _stream: bool,
    ) -> Result<ProviderPayload, ProviderError> {
        let caps = &model.capabilities;
        let contents: Vec<Value> = request
            .conversation()
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": m.content.text}]})
            })
            .collect();

        let mut body = Map::new();
        body.insert("contents".into(), Value::Array(contents));

        if let Some(system) = request.system_prompt() {
            body.insert(
                "system_instruction".into(),
                json!({"parts": [{"text": system}]}),
            );
        }

        let mut generation = Map::new();
        let sampling = &request.sampling;
        if let Some(t) = sampling.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(p) = sampling.top_p {
            generation.insert("topP".into(), json!(p));
        }
        if let Some(max) = sampling.max_tokens.or(model.max_tokens) {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(effort) = request.reasoning_for(caps) {
            generation.insert(
                "thinkingConfig".into(),
                json!({"thinkingBudget": effort.budget_tokens()}),
            );
        }
        if !generation.is_empty() {
            body.insert("generationConfig".into(), Value::Object(generation));
        }

        if request.web_search_for(caps) {
            body.insert("tools".into(), json!([{"google_search": {}}]));
        }

        Ok(ProviderPayload::new(Value::Object(body)))
    }

    fn build_request(
        &self,
        model: &ModelSpec,
        payload: &ProviderPayload,
        stream: bool,
    ) -> Result<HttpRequest, ProviderError> {
        self.settings.request(
            GENERATE_PATH,
            STREAM_PATH,
            &model.upstream_model,
            stream,
            payload.body.clone(),
        )
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GoogleDecoder {
            provider: self.settings.name.clone(),
            usage_emitted: false,
            citations: None,
        })
    }

    fn decode_buffered(&self, body: &[u8]) -> Result<ResponseFragment, ProviderError> {
        let value = parse_body(body)?;
        if let Some(failure) = failure_of(&self.settings.name, &value) {
            return Ok(failure);
        }

        let candidate = value.pointer("/candidates/0");
        let mut fragment = ResponseFragment::done().with_usage(usage_of(&value));
        fragment.text = candidate.map(candidate_text).unwrap_or_default();
        fragment.citations = candidate
            .and_then(|c| c.get("groundingMetadata"))
            .and_then(from_google_grounding);
        Ok(fragment)
    }
}

/// Answer text of a candidate, skipping thought parts
fn candidate_text(candidate: &Value) -> String {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

fn usage_of(value: &Value) -> Option<Usage> {
    let metadata = value.get("usageMetadata")?;
    let prompt = token_count(metadata, "promptTokenCount")?;
    Some(Usage::new(
        prompt,
        token_count(metadata, "candidatesTokenCount").unwrap_or(0),
    ))
}

/// Error or blocked-prompt units
fn failure_of(provider: &str, value: &Value) -> Option<ResponseFragment> {
    if let Some(message) = error_message(value) {
        return Some(ResponseFragment::failure(format!(
            "{} backend error: {}",
            provider, message
        )));
    }
    let reason = value
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)?;
    Some(ResponseFragment::failure(format!(
        "{} backend error: prompt blocked ({})",
        provider, reason
    )))
}

struct GoogleDecoder {
    provider: String,
    usage_emitted: bool,
    citations: Option<Citations>,
}

impl StreamDecoder for GoogleDecoder {
    fn decode(&mut self, frame: &Frame) -> Result<ResponseFragment, ProviderError> {
        let value = frame.json()?;
        if let Some(failure) = failure_of(&self.provider, &value) {
            return Ok(failure);
        }

        let Some(candidate) = value.pointer("/candidates/0") else {
            return Ok(ResponseFragment::empty());
        };

        let mut fragment = ResponseFragment::delta(candidate_text(candidate));

        if let Some(citations) = candidate
            .get("groundingMetadata")
            .and_then(from_google_grounding)
        {
            self.citations = Some(citations);
        }

        let finish = candidate.get("finishReason").and_then(Value::as_str);
        if finish.is_some_and(|reason| reason != UNSPECIFIED_FINISH) {
            fragment.is_done = true;
            fragment.citations = self.citations.take();
        }

        if finish == Some(USAGE_FINISH) && !self.usage_emitted {
            fragment.usage = usage_of(&value);
            self.usage_emitted = fragment.usage.is_some();
        }

        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, ModelCapabilities, ReasoningEffort};
    use crate::providers::streaming::{Framing, Reassembler};
    use crate::providers::ProviderConfig;

    fn provider() -> GoogleProvider {
        let config = ProviderConfig::new("gemini", ProviderKind::Google);
        GoogleProvider::new(ProviderSettings::from_config(&config).unwrap())
    }

    fn model(caps: ModelCapabilities) -> ModelSpec {
        ModelSpec::new("gemini-2.5-flash", caps)
    }

    #[test]
    fn test_payload_roles_and_system_instruction() {
        let request = ChatRequest::new(
            "m",
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("q"),
                ChatMessage::assistant("a"),
                ChatMessage::user("q2"),
            ],
        );
        let payload = provider()
            .format_payload(&request, &model(ModelCapabilities::default()), true)
            .unwrap();

        assert_eq!(payload.body["system_instruction"]["parts"][0]["text"], "sys");
        let contents = payload.body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "q2");
        assert!(payload.body.get("generationConfig").is_none());
        assert!(payload.body.get("tools").is_none());
    }

    #[test]
    fn test_payload_sampling_and_gated_features() {
        let mut request = ChatRequest::new("m", vec![ChatMessage::user("q")]);
        request.sampling.temperature = Some(0.7);
        request.sampling.max_tokens = Some(200);
        request.web_search = true;
        request.reasoning_effort = Some(ReasoningEffort::High);

        let caps = ModelCapabilities {
            streaming: true,
            web_search: true,
            reasoning: false,
            tools: false,
        };
        let payload = provider().format_payload(&request, &model(caps), false).unwrap();

        assert_eq!(payload.body["generationConfig"]["maxOutputTokens"], 200);
        assert!(payload.body["generationConfig"].get("topP").is_none());
        assert!(payload.body["generationConfig"].get("thinkingConfig").is_none());
        assert_eq!(payload.body["tools"], json!([{"google_search": {}}]));
    }

    #[test]
    fn test_streaming_endpoint() {
        let payload = ProviderPayload::new(json!({}));
        let request = provider()
            .build_request(&model(ModelCapabilities::default()), &payload, true)
            .unwrap();
        assert!(request
            .url
            .path()
            .ends_with("/models/gemini-2.5-flash:streamGenerateContent"));
    }

    #[test]
    fn test_stream_array_with_repeated_usage() {
        let body = concat!(
            "[{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}],\"role\":\"model\"},\"finishReason\":\"FINISH_REASON_UNSPECIFIED\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":1}}\n,",
            "{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo {x}\"}],\"role\":\"model\"}}],",
            "\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":2}}\n,",
            "{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"\"}],\"role\":\"model\"},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":3}}\n]"
        );

        let mut reassembler = Reassembler::new(Framing::ConcatenatedJson);
        let mut decoder = provider().stream_decoder();
        let mut fragments = Vec::new();
        for piece in body.as_bytes().chunks(7) {
            for frame in reassembler.feed(piece) {
                fragments.push(decoder.decode(&frame).unwrap());
            }
        }
        for frame in reassembler.finish() {
            fragments.push(decoder.decode(&frame).unwrap());
        }

        let text: String = fragments.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(text, "Hello {x}");
        assert_eq!(fragments.len(), 3);
        assert!(!fragments[0].is_done);
        assert!(fragments[2].is_done);
        let usages: Vec<_> = fragments.iter().filter_map(|f| f.usage).collect();
        assert_eq!(usages, vec![Usage::new(4, 3)]);
    }

    #[test]
    fn test_stream_thought_parts_hidden_and_grounding() {
        let mut decoder = provider().stream_decoder();
        let fragment = decoder
            .decode(&Frame::data(
                json!({
                    "candidates": [{
                        "content": {"parts": [{"text": "thinking", "thought": true}, {"text": "Answer"}]},
                        "finishReason": "STOP",
                        "groundingMetadata": {"groundingChunks": [{"web": {"uri": "https://g", "title": "G"}}]}
                    }]
                })
                .to_string(),
            ))
            .unwrap();

        assert_eq!(fragment.text, "Answer");
        assert!(fragment.is_done);
        assert_eq!(fragment.citations.unwrap().citations[0].url, "https://g");
        assert!(fragment.usage.is_none());
    }

    #[test]
    fn test_stream_blocked_prompt_is_error() {
        let mut decoder = provider().stream_decoder();
        let fragment = decoder
            .decode(&Frame::data(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#))
            .unwrap();
        assert!(fragment.is_done);
        assert!(fragment.error.unwrap().contains("SAFETY"));
    }

    #[test]
    fn test_decode_buffered() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "Hi"}, {"text": " there"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 2, "totalTokenCount": 4}
        });
        let fragment = provider().decode_buffered(body.to_string().as_bytes()).unwrap();
        assert_eq!(fragment.text, "Hi there");
        assert_eq!(fragment.usage, Some(Usage::new(2, 2)));

        let error = provider()
            .decode_buffered(br#"{"error":{"code":400,"message":"API key not valid"}}"#)
            .unwrap();
        assert_eq!(error.error.as_deref(), Some("gemini backend error: API key not valid"));
    }
}
