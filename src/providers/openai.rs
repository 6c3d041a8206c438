use super::citations::CitationCollector;
use super::error::ProviderError;
use super::streaming::Frame;
use super::tools::{chat_tool, parse_arguments, ToolCallAccumulator};
use super::transport::HttpRequest;
use super::{
    error_message, parse_body, ChatProvider, ProviderKind, ProviderPayload, ProviderSettings,
    StreamDecoder,
};
use crate::models::{ChatRequest, ModelSpec, ResponseFragment, Role, ToolCall, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CHAT_PATH: &str = "/chat/completions";

/// OpenAI Chat Completions request format
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_search_options: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<OpenAIUsage> for Usage {
    fn from(usage: OpenAIUsage) -> Self {
        Usage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

/// OpenAI Chat Completions response format
#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIResponse {
    #[serde(default)]
    pub(crate) choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIChoice {
    pub(crate) message: OpenAIResponseMessage,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OpenAIResponseMessage {
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default)]
    annotations: Vec<Value>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCall>>,
}

/// Complete tool call in a buffered response
#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    id: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// OpenAI streaming chunk
#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    annotations: Vec<Value>,
    /// Partial calls keyed by `index`
    #[serde(default)]
    tool_calls: Option<Vec<Value>>,
}

/// OpenAI-style chat completions backend
pub struct OpenAIProvider {
    settings: ProviderSettings,
}

impl OpenAIProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }

    fn role_name(role: Role, model: &ModelSpec) -> String {
        match role {
            Role::System => model
                .system_role
                .clone()
                .unwrap_or_else(|| "system".to_string()),
            other => other.to_string(),
        }
    }
}

impl ChatProvider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn format_payload(
        &self,
        request: &ChatRequest,
        model: &ModelSpec,
        stream: bool,
    ) -> Result<ProviderPayload, ProviderError> {
        let caps = &model.capabilities;
        let reasoning = request.reasoning_for(caps);
        let max_tokens = request.sampling.max_tokens.or(model.max_tokens);

        let body = OpenAIRequest {
            model: model.upstream_model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| OpenAIMessage {
                    role: Self::role_name(m.role, model),
                    content: m.content.text.clone(),
                })
                .collect(),
            stream,
            // Reasoning models only accept the newer output budget field
            max_tokens: max_tokens.filter(|_| reasoning.is_none()),
            max_completion_tokens: max_tokens.filter(|_| reasoning.is_some()),
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            frequency_penalty: request.sampling.frequency_penalty,
            presence_penalty: request.sampling.presence_penalty,
            stream_options: (stream && request.report_usage).then_some(StreamOptions {
                include_usage: true,
            }),
            reasoning_effort: reasoning.map(|e| e.as_str()),
            web_search_options: request
                .web_search_for(caps)
                .then(|| Value::Object(Default::default())),
            tools: Some(request.tools_for(caps))
                .filter(|tools| !tools.is_empty())
                .map(|tools| tools.iter().map(chat_tool).collect()),
        };

        Ok(ProviderPayload::new(serde_json::to_value(body)?))
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
        Box::new(ChatCompletionsDecoder::new(self.settings.name.clone()))
    }

    fn decode_buffered(&self, body: &[u8]) -> Result<ResponseFragment, ProviderError> {
        decode_chat_completion(&self.settings.name, parse_body(body)?)
    }
}

/// Decode a buffered chat completion body
pub(crate) fn decode_chat_completion(
    provider: &str,
    value: Value,
) -> Result<ResponseFragment, ProviderError> {
    if let Some(message) = error_message(&value) {
        return Ok(ResponseFragment::failure(format!(
            "{} backend error: {}",
            provider, message
        )));
    }

    let response: OpenAIResponse = serde_json::from_value(value)?;
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .unwrap_or_default();

    let mut collector = CitationCollector::new();
    for annotation in &message.annotations {
        collector.add_url_citation(annotation);
    }

    let tool_calls: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall {
            arguments: parse_arguments(&call.function.name, &call.function.arguments),
            id: call.id,
            name: call.function.name,
        })
        .collect();

    let mut fragment = ResponseFragment::done().with_usage(response.usage.map(Usage::from));
    fragment.text = message.content.unwrap_or_default();
    fragment.citations = collector.finish();
    fragment.tool_calls = Some(tool_calls).filter(|calls| !calls.is_empty());
    Ok(fragment)
}

/// Stream decoder for OpenAI-shaped chunks
pub(crate) struct ChatCompletionsDecoder {
    provider: String,
    usage_emitted: bool,
    citations: CitationCollector,
    tool_calls: ToolCallAccumulator,
}

impl ChatCompletionsDecoder {
    pub(crate) fn new(provider: String) -> Self {
        Self {
            provider,
            usage_emitted: false,
            citations: CitationCollector::new(),
            tool_calls: ToolCallAccumulator::new(),
        }
    }

    pub(crate) fn decode_value(&mut self, value: Value) -> Result<ResponseFragment, ProviderError> {
        if let Some(message) = error_message(&value) {
            return Ok(ResponseFragment::failure(format!(
                "{} backend error: {}",
                self.provider, message
            )));
        }

        let chunk: OpenAIStreamChunk = serde_json::from_value(value)?;
        let mut fragment = ResponseFragment::empty();

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(delta) = choice.delta {
                fragment.text = delta.content.unwrap_or_default();
                for annotation in &delta.annotations {
                    self.citations.add_url_citation(annotation);
                }
                for call in delta.tool_calls.iter().flatten() {
                    self.tool_calls.add_chat_delta(call);
                }
            }
            // `stop`, `length` and `tool_calls` all end the answer
            if choice.finish_reason.is_some_and(|r| !r.is_empty()) {
                fragment.is_done = true;
                fragment.citations = std::mem::take(&mut self.citations).finish();
                fragment.tool_calls = self.tool_calls.finish();
            }
        }

        if let Some(usage) = chunk.usage {
            if !self.usage_emitted {
                self.usage_emitted = true;
                fragment.usage = Some(usage.into());
            }
        }

        Ok(fragment)
    }
}

impl StreamDecoder for ChatCompletionsDecoder {
    fn decode(&mut self, frame: &Frame) -> Result<ResponseFragment, ProviderError> {
        let value = frame.json()?;
        self.decode_value(value)
    }
}
