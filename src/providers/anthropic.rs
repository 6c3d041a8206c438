use super::citations::CitationCollector;
use super::error::ProviderError;
use super::streaming::Frame;
use super::transport::HttpRequest;
use super::{
    error_message, parse_body, token_count, ChatProvider, ProviderKind, ProviderPayload,
    ProviderSettings, StreamDecoder,
};
use crate::models::{ChatRequest, ModelSpec, ResponseFragment, Usage};
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::debug;

const MESSAGES_PATH: &str = "/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const WEB_SEARCH_MAX_USES: u32 = 5;

/// Anthropic Messages API backend
pub struct AnthropicProvider {
    settings: ProviderSettings,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn format_payload(
        &self,
        request: &ChatRequest,
        model: &ModelSpec,
        stream: bool,
    ) -> Result<ProviderPayload, ProviderError> {
        let caps = &model.capabilities;
        let mut max_tokens = request
            .sampling
            .max_tokens
            .or(model.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let messages: Vec<Value> = request
            .conversation()
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content.text}))
            .collect();

        let mut body = Map::new();
        body.insert("model".into(), json!(model.upstream_model));
        body.insert("messages".into(), Value::Array(messages));
        body.insert("stream".into(), json!(stream));

        if let Some(system) = request.system_prompt() {
            body.insert("system".into(), json!(system));
        }

        match request.reasoning_for(caps) {
            Some(effort) => {
                // Thinking needs room above its budget and fixed sampling
                let budget = effort.budget_tokens();
                max_tokens = max_tokens.max(budget + DEFAULT_MAX_TOKENS);
                body.insert(
                    "thinking".into(),
                    json!({"type": "enabled", "budget_tokens": budget}),
                );
                if request.sampling.temperature.is_some() || request.sampling.top_p.is_some() {
                    debug!("Dropping sampling parameters for extended thinking request");
                }
            }
            None => {
                if let Some(t) = request.sampling.temperature {
                    body.insert("temperature".into(), json!(t));
                }
                if let Some(p) = request.sampling.top_p {
                    body.insert("top_p".into(), json!(p));
                }
            }
        }
        body.insert("max_tokens".into(), json!(max_tokens));

        if request.web_search_for(caps) {
            body.insert(
                "tools".into(),
                json!([{
                    "type": "web_search_20250305",
                    "name": "web_search",
                    "max_uses": WEB_SEARCH_MAX_USES
                }]),
            );
        }

        Ok(ProviderPayload::new(Value::Object(body)))
    }

    fn build_request(
        &self,
        model: &ModelSpec,
        payload: &ProviderPayload,
        stream: bool,
    ) -> Result<HttpRequest, ProviderError> {
        let mut request = self.settings.request(
            MESSAGES_PATH,
            MESSAGES_PATH,
            &model.upstream_model,
            stream,
            payload.body.clone(),
        )?;
        let version = HeaderName::from_static("anthropic-version");
        if !request.headers.contains_key(&version) {
            request
                .headers
                .insert(version, HeaderValue::from_static(API_VERSION));
        }
        Ok(request)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicDecoder::new(self.settings.name.clone()))
    }

    fn decode_buffered(&self, body: &[u8]) -> Result<ResponseFragment, ProviderError> {
        let value = parse_body(body)?;
        if let Some(message) = error_message(&value) {
            return Ok(ResponseFragment::failure(format!(
                "{} backend error: {}",
                self.settings.name, message
            )));
        }

        let mut citations = CitationCollector::new();
        let mut text = String::new();
        let blocks = value.get("content").and_then(Value::as_array);

        // Sources first so citation ids follow search-result order
        for block in blocks.into_iter().flatten() {
            if block.get("type").and_then(Value::as_str) == Some("web_search_tool_result") {
                add_search_sources(&mut citations, block);
            }
        }

        for block in blocks.into_iter().flatten() {
            if block.get("type").and_then(Value::as_str) != Some("text") {
                continue;
            }
            text.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default());

            let mut ids = Vec::new();
            for citation in block.get("citations").and_then(Value::as_array).into_iter().flatten() {
                if let Some(id) = add_location(&mut citations, citation) {
                    citations.add_segment(citation.get("cited_text").and_then(Value::as_str), vec![id]);
                    ids.push(id);
                }
            }
            text.push_str(&citation_marker(&ids));
        }

        let usage = value.get("usage").and_then(|u| {
            let prompt = token_count(u, "input_tokens")?;
            Some(Usage::new(prompt, token_count(u, "output_tokens").unwrap_or(0)))
        });

        let mut fragment = ResponseFragment::done().with_usage(usage);
        fragment.text = text;
        fragment.citations = citations.finish();
        Ok(fragment)
    }
}

fn add_search_sources(citations: &mut CitationCollector, block: &Value) {
    for result in block.get("content").and_then(Value::as_array).into_iter().flatten() {
        if result.get("type").and_then(Value::as_str) != Some("web_search_result") {
            continue;
        }
        let url = result.get("url").and_then(Value::as_str).unwrap_or_default();
        let title = result.get("title").and_then(Value::as_str).unwrap_or(url);
        citations.add_source(title, url, None);
    }
}

/// Register a `web_search_result_location` citation, returning its source id
fn add_location(citations: &mut CitationCollector, citation: &Value) -> Option<usize> {
    if citation.get("type").and_then(Value::as_str) != Some("web_search_result_location") {
        return None;
    }
    let url = citation.get("url").and_then(Value::as_str)?;
    let title = citation.get("title").and_then(Value::as_str).unwrap_or(url);
    Some(citations.add_source(title, url, None))
}

/// Inline ` [n,m]` marker for the sources a text block cites
fn citation_marker(ids: &[usize]) -> String {
    let mut unique: Vec<usize> = Vec::new();
    for id in ids {
        if !unique.contains(id) {
            unique.push(*id);
        }
    }
    if unique.is_empty() {
        return String::new();
    }
    let list: Vec<String> = unique.iter().map(|id| id.to_string()).collect();
    format!(" [{}]", list.join(","))
}

/// Per-request state for the event-typed Anthropic stream
struct AnthropicDecoder {
    provider: String,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    usage_emitted: bool,
    citations: CitationCollector,
    seen_locations: HashSet<(String, String)>,
    block_citations: Vec<usize>,
}

impl AnthropicDecoder {
    fn new(provider: String) -> Self {
        Self {
            provider,
            input_tokens: None,
            output_tokens: None,
            usage_emitted: false,
            citations: CitationCollector::new(),
            seen_locations: HashSet::new(),
            block_citations: Vec::new(),
        }
    }

    fn record_usage(&mut self, usage: Option<&Value>) {
        let Some(usage) = usage else { return };
        if let Some(input) = token_count(usage, "input_tokens") {
            self.input_tokens = Some(input);
        }
        if let Some(output) = token_count(usage, "output_tokens") {
            self.output_tokens = Some(output);
        }
    }

    fn record_citation(&mut self, citation: &Value) {
        let cited = citation
            .get("cited_text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let url = citation
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !self.seen_locations.insert((url, cited.clone())) {
            return;
        }
        if let Some(id) = add_location(&mut self.citations, citation) {
            self.citations.add_segment(Some(&cited), vec![id]);
            self.block_citations.push(id);
        }
    }

    fn finish(&mut self) -> ResponseFragment {
        let mut fragment = ResponseFragment::done();
        if !self.usage_emitted && (self.input_tokens.is_some() || self.output_tokens.is_some()) {
            self.usage_emitted = true;
            fragment.usage = Some(Usage::new(
                self.input_tokens.unwrap_or(0),
                self.output_tokens.unwrap_or(0),
            ));
        }
        fragment.citations = std::mem::take(&mut self.citations).finish();
        fragment
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: &Frame) -> Result<ResponseFragment, ProviderError> {
        let value = frame.json()?;
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .or(frame.event.as_deref())
            .unwrap_or_default();

        let fragment = match event_type {
            "message_start" => {
                self.record_usage(value.pointer("/message/usage"));
                ResponseFragment::empty()
            }
            "content_block_start" => {
                let block = value.get("content_block");
                match block.and_then(|b| b.get("type")).and_then(Value::as_str) {
                    Some("web_search_tool_result") => {
                        if let Some(block) = block {
                            add_search_sources(&mut self.citations, block);
                        }
                    }
                    Some("text") => {
                        let citations = block
                            .and_then(|b| b.get("citations"))
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        for citation in &citations {
                            self.record_citation(citation);
                        }
                    }
                    _ => {}
                }
                ResponseFragment::empty()
            }
            "content_block_delta" => {
                let delta = value.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                    Some("text_delta") => ResponseFragment::delta(
                        delta
                            .and_then(|d| d.get("text"))
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                    ),
                    Some("citations_delta") => {
                        if let Some(citation) = delta.and_then(|d| d.get("citation")) {
                            self.record_citation(citation);
                        }
                        ResponseFragment::empty()
                    }
                    _ => ResponseFragment::empty(),
                }
            }
            "content_block_stop" => {
                let marker = citation_marker(&self.block_citations);
                self.block_citations.clear();
                ResponseFragment::delta(marker)
            }
            "message_delta" => {
                self.record_usage(value.get("usage"));
                ResponseFragment::empty()
            }
            "message_stop" => self.finish(),
            "error" => {
                let detail = error_message(&value).unwrap_or_else(|| "stream error".to_string());
                ResponseFragment::failure(format!("{} backend error: {}", self.provider, detail))
            }
            "ping" => ResponseFragment::empty(),
            other => {
                debug!("Anthropic event ignored: {}", other);
                ResponseFragment::empty()
            }
        };

        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, ModelCapabilities, ReasoningEffort};
    use crate::providers::ProviderConfig;
    use secrecy::SecretString;

    fn provider() -> AnthropicProvider {
        let mut config = ProviderConfig::new("claude", ProviderKind::Anthropic);
        config.api_key = Some(SecretString::new("sk-ant".to_string()));
        AnthropicProvider::new(ProviderSettings::from_config(&config).unwrap())
    }

    fn caps(web_search: bool, reasoning: bool) -> ModelCapabilities {
        ModelCapabilities {
            streaming: true,
            web_search,
            reasoning,
            tools: false,
        }
    }

    fn decode_all(decoder: &mut Box<dyn StreamDecoder>, units: &[&str]) -> Vec<ResponseFragment> {
        units
            .iter()
            .map(|u| decoder.decode(&Frame::data(*u)).unwrap())
            .collect()
    }

    #[test]
    fn test_payload_system_and_default_max_tokens() {
        let mut request = ChatRequest::new(
            "m",
            vec![ChatMessage::system("be kind"), ChatMessage::user("hi")],
        );
        request.sampling.temperature = Some(0.5);
        let model = ModelSpec::new("claude-sonnet", caps(false, false));
        let payload = provider().format_payload(&request, &model, true).unwrap();

        assert_eq!(payload.body["system"], "be kind");
        assert_eq!(payload.body["max_tokens"], 4096);
        assert_eq!(payload.body["temperature"], 0.5);
        assert_eq!(payload.body["messages"].as_array().unwrap().len(), 1);
        assert!(payload.body.get("tools").is_none());
    }

    #[test]
    fn test_payload_tools_and_thinking_when_both_sides_opt_in() {
        let mut request = ChatRequest::new("m", vec![ChatMessage::user("hi")]);
        request.web_search = true;
        request.reasoning_effort = Some(ReasoningEffort::Low);
        request.sampling.temperature = Some(0.5);
        let model = ModelSpec::new("claude-sonnet", caps(true, true));
        let payload = provider().format_payload(&request, &model, false).unwrap();

        assert_eq!(payload.body["tools"][0]["type"], "web_search_20250305");
        assert_eq!(payload.body["tools"][0]["max_uses"], 5);
        assert_eq!(payload.body["thinking"]["budget_tokens"], 1024);
        assert_eq!(payload.body["max_tokens"], 1024 + 4096);
        assert!(payload.body.get("temperature").is_none());
    }

    #[test]
    fn test_request_headers() {
        let model = ModelSpec::new("claude-sonnet", caps(false, false));
        let payload = ProviderPayload::new(json!({}));
        let request = provider().build_request(&model, &payload, true).unwrap();

        assert_eq!(request.url.as_str(), "https://api.anthropic.com/v1/messages");
        assert_eq!(request.headers.get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(request.headers.get("anthropic-version").unwrap(), API_VERSION);
    }

    #[test]
    fn test_stream_usage_split_across_events() {
        let mut decoder = provider().stream_decoder();
        let fragments = decode_all(
            &mut decoder,
            &[
                r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                r#"{"type":"ping"}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        assert_eq!(fragments[3].text, "Hi");
        assert!(fragments[4].is_noop());
        assert!(fragments[5].usage.is_none());
        let done = &fragments[6];
        assert!(done.is_done);
        assert_eq!(done.usage, Some(Usage::new(12, 9)));
        assert_eq!(fragments.iter().filter(|f| f.usage.is_some()).count(), 1);
    }

    #[test]
    fn test_stream_citations_and_markers() {
        let mut decoder = provider().stream_decoder();
        let fragments = decode_all(
            &mut decoder,
            &[
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"web_search_tool_result","content":[{"type":"web_search_result","url":"https://a","title":"A"},{"type":"web_search_result","url":"https://b","title":"B"}]}}"#,
                r#"{"type":"content_block_delta","index":2,"delta":{"type":"citations_delta","citation":{"type":"web_search_result_location","url":"https://b","title":"B","cited_text":"bee"}}}"#,
                r#"{"type":"content_block_delta","index":2,"delta":{"type":"citations_delta","citation":{"type":"web_search_result_location","url":"https://b","title":"B","cited_text":"bee"}}}"#,
                r#"{"type":"content_block_delta","index":2,"delta":{"type":"text_delta","text":"Bees"}}"#,
                r#"{"type":"content_block_stop","index":2}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        assert_eq!(fragments[4].text, " [2]");
        let citations = fragments[5].citations.clone().unwrap();
        assert_eq!(citations.citations.len(), 2);
        assert_eq!(citations.text_segments.len(), 1);
        assert_eq!(citations.text_segments[0].text.as_deref(), Some("bee"));
        assert!(fragments[5].usage.is_none());
    }

    #[test]
    fn test_stream_error_event() {
        let mut decoder = provider().stream_decoder();
        let fragment = decoder
            .decode(&Frame::data(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#))
            .unwrap();
        assert!(fragment.is_done);
        assert_eq!(fragment.error.as_deref(), Some("claude backend error: Overloaded"));
    }

    #[test]
    fn test_decode_buffered_with_citations() {
        let body = json!({
            "type": "message",
            "content": [
                {"type": "web_search_tool_result", "content": [
                    {"type": "web_search_result", "url": "https://a", "title": "A"}
                ]},
                {"type": "text", "text": "Fact", "citations": [
                    {"type": "web_search_result_location", "url": "https://a", "title": "A", "cited_text": "f"}
                ]}
            ],
            "usage": {"input_tokens": 8, "output_tokens": 3}
        });
        let fragment = provider().decode_buffered(body.to_string().as_bytes()).unwrap();

        assert_eq!(fragment.text, "Fact [1]");
        assert_eq!(fragment.usage, Some(Usage::new(8, 3)));
        assert_eq!(fragment.citations.unwrap().citations[0].title, "A");
    }
}
