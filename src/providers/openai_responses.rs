//! OpenAI Responses API (stateful, continuation-capable).
//!
//! # Request shape
//!
//! The leading system turn becomes `instructions`; the remaining turns go to
//! `input`. A lone user turn is sent as a plain string. Reasoning items
//! returned by an earlier response travel in the assistant turn's auxiliary
//! blob (`{"reasoning": [...]}`) and are replayed into `input` right after
//! that turn.
//!
//! # Continuation
//!
//! A caller-supplied continuation token is sent as `previous_response_id`.
//! The response id of every completed response is surfaced as the terminal
//! fragment's continuation token.
//!
//! # Function calls
//!
//! `function_call` output items are assembled from their argument deltas
//! (keyed by `output_index`) and reported on the terminal fragment.

use super::citations::CitationCollector;
use super::error::ProviderError;
use super::streaming::Frame;
use super::tools::{parse_arguments, responses_tool, ToolCallAccumulator};
use super::transport::HttpRequest;
use super::{
    error_message, parse_body, token_count, ChatProvider, ProviderKind, ProviderPayload,
    ProviderSettings, StreamDecoder,
};
use crate::models::{ChatRequest, ModelSpec, ResponseFragment, Role, ToolCall, Usage};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

const RESPONSES_PATH: &str = "/responses";
const CONTINUATION_KEY: &str = "previous_response_id";

pub struct OpenAIResponsesProvider {
    settings: ProviderSettings,
    store: bool,
}

impl OpenAIResponsesProvider {
    pub fn new(settings: ProviderSettings, store: bool) -> Self {
        Self { settings, store }
    }

    fn build_input(request: &ChatRequest) -> Value {
        let turns = request.conversation();

        if let [only] = turns {
            if only.role == Role::User && only.content.auxiliary.is_none() {
                return Value::String(only.content.text.clone());
            }
        }

        let mut input = Vec::new();
        for message in turns {
            input.push(json!({
                "role": message.role.to_string(),
                "content": message.content.text,
            }));
            if let Some(items) = message
                .content
                .auxiliary
                .as_ref()
                .and_then(|aux| aux.get("reasoning"))
                .and_then(Value::as_array)
            {
                input.extend(items.iter().cloned());
            }
        }
        Value::Array(input)
    }
}

impl ChatProvider for OpenAIResponsesProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiResponses
    }

    fn format_payload(
        &self,
        request: &ChatRequest,
        model: &ModelSpec,
        stream: bool,
    ) -> Result<ProviderPayload, ProviderError> {
        let caps = &model.capabilities;
        let mut body = Map::new();
        body.insert("model".into(), json!(model.upstream_model));
        body.insert("input".into(), Self::build_input(request));
        body.insert("stream".into(), json!(stream));
        body.insert("store".into(), json!(self.store));

        if let Some(system) = request.system_prompt() {
            body.insert("instructions".into(), json!(system));
        }

        let mut include = Vec::new();
        let mut tools: Vec<Value> = request.tools_for(caps).iter().map(responses_tool).collect();
        if let Some(effort) = request.reasoning_for(caps) {
            body.insert("reasoning".into(), json!({"effort": effort.as_str()}));
            include.push("reasoning.encrypted_content");
        }
        if request.web_search_for(caps) {
            tools.push(json!({"type": "web_search"}));
            include.push("web_search_call.action.sources");
        }
        if !tools.is_empty() {
            body.insert("tools".into(), Value::Array(tools));
        }
        if !include.is_empty() {
            body.insert("include".into(), json!(include));
        }

        if let Some(token) = &request.continuation {
            body.insert(CONTINUATION_KEY.into(), json!(token));
        }

        let sampling = &request.sampling;
        if let Some(t) = sampling.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(p) = sampling.top_p {
            body.insert("top_p".into(), json!(p));
        }
        if let Some(max) = sampling.max_tokens.or(model.max_tokens) {
            body.insert("max_output_tokens".into(), json!(max));
        }

        Ok(ProviderPayload::new(Value::Object(body)).with_continuation_key(CONTINUATION_KEY))
    }

    fn build_request(
        &self,
        model: &ModelSpec,
        payload: &ProviderPayload,
        stream: bool,
    ) -> Result<HttpRequest, ProviderError> {
        self.settings.request(
            RESPONSES_PATH,
            RESPONSES_PATH,
            &model.upstream_model,
            stream,
            payload.body.clone(),
        )
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ResponsesDecoder {
            provider: self.settings.name.clone(),
            response_id: None,
            usage_emitted: false,
            reasoning: Vec::new(),
            citations: CitationCollector::new(),
            tool_calls: ToolCallAccumulator::new(),
        })
    }

    fn decode_buffered(&self, body: &[u8]) -> Result<ResponseFragment, ProviderError> {
        let value = parse_body(body)?;
        if let Some(message) = error_message(&value) {
            return Ok(ResponseFragment::failure(format!(
                "{} backend error: {}",
                self.settings.name, message
            )));
        }

        let mut text = String::new();
        let mut reasoning = Vec::new();
        let mut citations = CitationCollector::new();
        let mut tool_calls = Vec::new();
        for item in value.get("output").and_then(Value::as_array).into_iter().flatten() {
            collect_output_item(item, &mut text, &mut reasoning, &mut citations);
            tool_calls.extend(function_call_of(item));
        }

        let mut fragment = ResponseFragment::done().with_usage(value.get("usage").and_then(extract_usage));
        fragment.text = text;
        fragment.citations = citations.finish();
        fragment.continuation_token = value.get("id").and_then(Value::as_str).map(str::to_string);
        fragment.auxiliary = reasoning_auxiliary(reasoning);
        fragment.tool_calls = Some(tool_calls).filter(|calls| !calls.is_empty());
        Ok(fragment)
    }
}

/// A finished `function_call` output item
fn function_call_of(item: &Value) -> Option<ToolCall> {
    if item.get("type").and_then(Value::as_str) != Some("function_call") {
        return None;
    }
    // Items still in progress carry partial arguments
    if item
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|status| status != "completed")
    {
        return None;
    }
    let name = item.get("name").and_then(Value::as_str).unwrap_or("unknown");
    let id = item
        .get("call_id")
        .or_else(|| item.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let arguments = item.get("arguments").and_then(Value::as_str).unwrap_or_default();
    Some(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: parse_arguments(name, arguments),
    })
}

/// `usage` object of a completed response
fn extract_usage(usage: &Value) -> Option<Usage> {
    let prompt = token_count(usage, "input_tokens")?;
    let completion = token_count(usage, "output_tokens").unwrap_or(0);
    Some(Usage::new(prompt, completion))
}

fn reasoning_auxiliary(items: Vec<Value>) -> Option<Value> {
    if items.is_empty() {
        None
    } else {
        Some(json!({ "reasoning": items }))
    }
}

fn collect_output_item(
    item: &Value,
    text: &mut String,
    reasoning: &mut Vec<Value>,
    citations: &mut CitationCollector,
) {
    match item.get("type").and_then(Value::as_str) {
        Some("message") => {
            for part in item.get("content").and_then(Value::as_array).into_iter().flatten() {
                if part.get("type").and_then(Value::as_str) == Some("output_text") {
                    if let Some(t) = part.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                    for annotation in part.get("annotations").and_then(Value::as_array).into_iter().flatten() {
                        citations.add_url_citation(annotation);
                    }
                }
            }
        }
        Some("reasoning") => reasoning.push(item.clone()),
        Some("web_search_call") => {
            if let Some(query) = item.pointer("/action/query").and_then(Value::as_str) {
                citations.add_query(query);
            }
        }
        _ => {}
    }
}

struct ResponsesDecoder {
    provider: String,
    response_id: Option<String>,
    usage_emitted: bool,
    reasoning: Vec<Value>,
    citations: CitationCollector,
    tool_calls: ToolCallAccumulator,
}

impl ResponsesDecoder {
    /// Start or finish a `function_call` item at its output position
    fn track_function_call(&mut self, value: &Value, finished: bool) {
        let Some(item) = value.get("item") else {
            return;
        };
        if item.get("type").and_then(Value::as_str) != Some("function_call") {
            return;
        }
        let index = value.get("output_index").and_then(Value::as_u64).unwrap_or(0);
        self.tool_calls.register(
            index,
            item.get("call_id").or_else(|| item.get("id")).and_then(Value::as_str),
            item.get("name").and_then(Value::as_str),
        );
        if finished {
            if let Some(arguments) = item.get("arguments").and_then(Value::as_str) {
                self.tool_calls.set_arguments(index, arguments);
            }
        }
    }

    fn remember_id(&mut self, response: Option<&Value>) {
        if let Some(id) = response.and_then(|r| r.get("id")).and_then(Value::as_str) {
            self.response_id = Some(id.to_string());
        }
    }

    fn failure(&self, detail: &str) -> ResponseFragment {
        ResponseFragment::failure(format!("{} backend error: {}", self.provider, detail))
    }

    fn complete(&mut self, response: Option<&Value>) -> ResponseFragment {
        self.remember_id(response);

        // Reasoning items are also listed in the final output
        if self.reasoning.is_empty() {
            for item in response
                .and_then(|r| r.get("output"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if item.get("type").and_then(Value::as_str) == Some("reasoning") {
                    self.reasoning.push(item.clone());
                }
            }
        }

        let mut fragment = ResponseFragment::done();
        if !self.usage_emitted {
            fragment.usage = response.and_then(|r| r.get("usage")).and_then(extract_usage);
            self.usage_emitted = fragment.usage.is_some();
        }
        fragment.continuation_token = self.response_id.clone();
        fragment.citations = std::mem::take(&mut self.citations).finish();
        fragment.auxiliary = reasoning_auxiliary(std::mem::take(&mut self.reasoning));
        fragment.tool_calls = if self.tool_calls.is_empty() {
            // Function calls are also listed in the final output
            let calls: Vec<ToolCall> = response
                .and_then(|r| r.get("output"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(function_call_of)
                .collect();
            Some(calls).filter(|calls| !calls.is_empty())
        } else {
            self.tool_calls.finish()
        };
        fragment
    }
}

impl StreamDecoder for ResponsesDecoder {
    fn decode(&mut self, frame: &Frame) -> Result<ResponseFragment, ProviderError> {
        let value = frame.json()?;
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .or(frame.event.as_deref())
            .unwrap_or_default();
        let response = value.get("response");

        let fragment = match event_type {
            "response.output_text.delta" => ResponseFragment::delta(
                value.get("delta").and_then(Value::as_str).unwrap_or_default(),
            ),
            "response.created" | "response.in_progress" => {
                self.remember_id(response);
                ResponseFragment::empty()
            }
            "response.output_text.annotation.added" => {
                if let Some(annotation) = value.get("annotation") {
                    self.citations.add_url_citation(annotation);
                }
                ResponseFragment::empty()
            }
            "response.output_item.added" => {
                self.track_function_call(&value, false);
                ResponseFragment::empty()
            }
            "response.function_call_arguments.delta" => {
                let index = value.get("output_index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(piece) = value.get("delta").and_then(Value::as_str) {
                    self.tool_calls.append_arguments(index, piece);
                }
                ResponseFragment::empty()
            }
            "response.output_item.done" => {
                self.track_function_call(&value, true);
                // Text and annotations already arrived as their own events
                if let Some(item) = value.get("item") {
                    match item.get("type").and_then(Value::as_str) {
                        Some("reasoning") => self.reasoning.push(item.clone()),
                        Some("web_search_call") => {
                            if let Some(query) = item.pointer("/action/query").and_then(Value::as_str) {
                                self.citations.add_query(query);
                            }
                        }
                        _ => {}
                    }
                }
                ResponseFragment::empty()
            }
            "response.completed" => self.complete(response),
            "response.incomplete" => {
                let reason = response
                    .and_then(|r| r.pointer("/incomplete_details/reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                warn!("⚠️ {} response incomplete: {}", self.provider, reason);
                self.complete(response)
            }
            "response.failed" => {
                let detail = response
                    .and_then(|r| r.pointer("/error/message"))
                    .and_then(Value::as_str)
                    .unwrap_or("response failed");
                self.failure(detail)
            }
            "error" => {
                let detail = value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| error_message(&value))
                    .unwrap_or_else(|| "unknown stream error".to_string());
                self.failure(&detail)
            }
            other => {
                debug!("Responses event ignored: {}", other);
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

    fn provider() -> OpenAIResponsesProvider {
        let config = ProviderConfig::new("responses", ProviderKind::OpenAiResponses);
        OpenAIResponsesProvider::new(ProviderSettings::from_config(&config).unwrap(), true)
    }

    fn model() -> ModelSpec {
        ModelSpec::new(
            "gpt-5",
            ModelCapabilities {
                streaming: true,
                web_search: true,
                reasoning: true,
                tools: true,
            },
        )
    }

    #[test]
    fn test_single_user_turn_is_string_input() {
        let request = ChatRequest::new("m", vec![ChatMessage::system("rules"), ChatMessage::user("hi")]);
        let payload = provider().format_payload(&request, &model(), true).unwrap();

        assert_eq!(payload.body["input"], "hi");
        assert_eq!(payload.body["instructions"], "rules");
        assert_eq!(payload.body["store"], true);
        assert!(payload.body.get("tools").is_none());
        assert!(payload.body.get("reasoning").is_none());
    }

    #[test]
    fn test_conversation_replays_reasoning_items() {
        let mut assistant = ChatMessage::assistant("earlier answer");
        assistant.content.auxiliary = Some(json!({"reasoning": [{"type": "reasoning", "id": "rs_1"}]}));
        let request = ChatRequest::new(
            "m",
            vec![ChatMessage::user("q1"), assistant, ChatMessage::user("q2")],
        );
        let payload = provider().format_payload(&request, &model(), false).unwrap();

        let input = payload.body["input"].as_array().unwrap();
        assert_eq!(input.len(), 4);
        assert_eq!(input[1]["role"], "assistant");
        assert_eq!(input[2]["id"], "rs_1");
        assert_eq!(input[3]["content"], "q2");
    }

    #[test]
    fn test_continuation_and_tools() {
        let mut request = ChatRequest::new("m", vec![ChatMessage::user("hi")]).with_continuation("resp_9");
        request.web_search = true;
        request.reasoning_effort = Some(ReasoningEffort::Medium);
        let payload = provider().format_payload(&request, &model(), true).unwrap();

        assert!(payload.has_continuation());
        assert_eq!(payload.body["previous_response_id"], "resp_9");
        assert_eq!(payload.body["tools"], json!([{"type": "web_search"}]));
        assert_eq!(payload.body["reasoning"], json!({"effort": "medium"}));
        assert_eq!(
            payload.body["include"],
            json!(["reasoning.encrypted_content", "web_search_call.action.sources"])
        );

        let stripped = payload.without_continuation();
        assert!(stripped.body.get("previous_response_id").is_none());
    }

    #[test]
    fn test_stream_events() {
        let mut decoder = provider().stream_decoder();
        let created = decoder
            .decode(&Frame::data(r#"{"type":"response.created","response":{"id":"resp_1"}}"#))
            .unwrap();
        assert!(created.is_noop());

        let delta = decoder
            .decode(&Frame::data(r#"{"type":"response.output_text.delta","delta":"Hi"}"#))
            .unwrap();
        assert_eq!(delta.text, "Hi");

        decoder
            .decode(&Frame::data(
                r#"{"type":"response.output_text.annotation.added","annotation":{"type":"url_citation","url":"https://x","title":"X"}}"#,
            ))
            .unwrap();

        let done = decoder
            .decode(&Frame::data(
                r#"{"type":"response.completed","response":{"id":"resp_1","usage":{"input_tokens":10,"output_tokens":2},"output":[{"type":"reasoning","id":"rs_1"}]}}"#,
            ))
            .unwrap();
        assert!(done.is_done);
        assert_eq!(done.usage, Some(Usage::new(10, 2)));
        assert_eq!(done.continuation_token.as_deref(), Some("resp_1"));
        assert_eq!(done.citations.unwrap().citations[0].url, "https://x");
        assert_eq!(done.auxiliary.unwrap()["reasoning"][0]["id"], "rs_1");
    }

    #[test]
    fn test_function_tools_join_web_search() {
        let mut request = ChatRequest::new("m", vec![ChatMessage::user("hi")]);
        request.web_search = true;
        request.tools = vec![serde_json::from_value(json!({"name": "lookup", "description": "Find a record"})).unwrap()];
        let payload = provider().format_payload(&request, &model(), true).unwrap();

        let tools = payload.body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["name"], "lookup");
        assert_eq!(tools[1]["type"], "web_search");
    }

    #[test]
    fn test_stream_function_call_arguments_accumulate() {
        let mut decoder = provider().stream_decoder();
        let units = [
            r#"{"type":"response.created","response":{"id":"resp_7"}}"#,
            r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","output_index":0,"delta":"{\"id\":"}"#,
            r#"{"type":"response.function_call_arguments.delta","output_index":0,"delta":"42}"}"#,
        ];
        for unit in units {
            assert!(decoder.decode(&Frame::data(unit)).unwrap().is_noop());
        }

        let done = decoder
            .decode(&Frame::data(
                r#"{"type":"response.completed","response":{"id":"resp_7","output":[{"type":"function_call","call_id":"call_1","name":"lookup","arguments":"{\"id\":42}","status":"completed"}]}}"#,
            ))
            .unwrap();
        let calls = done.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "lookup");
        assert_eq!(calls[0].arguments, json!({"id": 42}));
        assert_eq!(done.continuation_token.as_deref(), Some("resp_7"));
    }

    #[test]
    fn test_stream_function_call_from_completed_output() {
        let mut decoder = provider().stream_decoder();
        let done = decoder
            .decode(&Frame::data(
                r#"{"type":"response.completed","response":{"id":"resp_8","output":[{"type":"function_call","call_id":"call_2","name":"lookup","arguments":"{}","status":"completed"}]}}"#,
            ))
            .unwrap();
        let calls = done.tool_calls.unwrap();
        assert_eq!(calls[0].id, "call_2");
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn test_decode_buffered_function_calls() {
        let body = json!({
            "id": "resp_5",
            "output": [
                {"type": "function_call", "call_id": "call_a", "name": "lookup", "arguments": "{\"id\":1}", "status": "completed"},
                {"type": "function_call", "call_id": "call_b", "name": "lookup", "arguments": "{\"id", "status": "in_progress"}
            ]
        });
        let fragment = provider().decode_buffered(body.to_string().as_bytes()).unwrap();
        let calls = fragment.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].arguments["id"], 1);
    }

    #[test]
    fn test_stream_error_event_is_terminal() {
        let mut decoder = provider().stream_decoder();
        let fragment = decoder
            .decode(&Frame::data(
                r#"{"type":"error","message":"Previous response with id 'resp_old' not found."}"#,
            ))
            .unwrap();
        assert!(fragment.is_done);
        assert!(fragment.error.unwrap().contains("not found"));
    }

    #[test]
    fn test_stream_failed_event() {
        let mut decoder = provider().stream_decoder();
        let fragment = decoder
            .decode(&Frame::data(
                r#"{"type":"response.failed","response":{"error":{"message":"server_error"}}}"#,
            ))
            .unwrap();
        assert_eq!(fragment.error.as_deref(), Some("responses backend error: server_error"));
    }

    #[test]
    fn test_decode_buffered() {
        let body = json!({
            "id": "resp_42",
            "output": [
                {"type": "reasoning", "id": "rs_1", "encrypted_content": "abc"},
                {"type": "web_search_call", "action": {"query": "weather"}},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "Sunny", "annotations": [
                        {"type": "url_citation", "url": "https://w", "title": "W"}
                    ]}
                ]}
            ],
            "usage": {"input_tokens": 4, "output_tokens": 1}
        });
        let fragment = provider().decode_buffered(body.to_string().as_bytes()).unwrap();

        assert_eq!(fragment.text, "Sunny");
        assert_eq!(fragment.continuation_token.as_deref(), Some("resp_42"));
        assert_eq!(fragment.usage, Some(Usage::new(4, 1)));
        let citations = fragment.citations.unwrap();
        assert_eq!(citations.search_metadata.unwrap().queries, vec!["weather"]);
        assert_eq!(fragment.auxiliary.unwrap()["reasoning"][0]["encrypted_content"], "abc");
    }
}
