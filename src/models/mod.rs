use serde::{Deserialize, Serialize};
use std::fmt;

use crate::providers::citations::Citations;

/// Conversation role of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Message content: text is always present, the auxiliary blob is
/// provider-specific state carried between turns (e.g. reasoning items).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MessageContent {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<serde_json::Value>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            auxiliary: None,
        }
    }
}

/// A single turn in the conversation
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::text(text),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Optional sampling parameters. Only the ones the caller supplied are
/// forwarded to a backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

/// Requested reasoning depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Token budget for backends that size reasoning in tokens
    pub fn budget_tokens(&self) -> u32 {
        match self {
            ReasoningEffort::Low => 1024,
            ReasoningEffort::Medium => 4096,
            ReasoningEffort::High => 16384,
        }
    }
}

/// A function the caller lets the model call
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments object
    #[serde(default = "empty_schema")]
    pub parameters: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed arguments object
    pub arguments: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// Provider-agnostic chat request.
///
/// Built once per call and never mutated afterwards; adapters only read it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    /// Opaque continuation token returned by a previous response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
    /// Caller wants the web search tool (still gated by model capability)
    #[serde(default)]
    pub web_search: bool,
    /// Caller wants reasoning (still gated by model capability)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Caller wants token usage reported where the backend needs opt-in
    #[serde(default = "default_true")]
    pub report_usage: bool,
    /// Functions the model may call (still gated by model capability)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            sampling: SamplingParams::default(),
            continuation: None,
            web_search: false,
            reasoning_effort: None,
            report_usage: true,
            tools: Vec::new(),
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation = Some(token.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Check structural invariants before dispatch
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model must not be empty".to_string());
        }
        if self.messages.is_empty() {
            return Err("at least one message is required".to_string());
        }
        if let Some(pos) = self
            .messages
            .iter()
            .skip(1)
            .position(|m| m.role == Role::System)
        {
            return Err(format!(
                "system message only allowed as the first message (found at index {})",
                pos + 1
            ));
        }
        Ok(())
    }

    /// The leading system message, if any
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.text.as_str())
    }

    /// All messages after the leading system message
    pub fn conversation(&self) -> &[ChatMessage] {
        match self.messages.first() {
            Some(first) if first.role == Role::System => &self.messages[1..],
            _ => &self.messages,
        }
    }

    /// The reasoning effort to apply if the model supports it
    pub fn reasoning_for(&self, caps: &ModelCapabilities) -> Option<ReasoningEffort> {
        if caps.reasoning {
            self.reasoning_effort
        } else {
            None
        }
    }

    /// Whether the search tool should be attached for this model
    pub fn web_search_for(&self, caps: &ModelCapabilities) -> bool {
        caps.web_search && self.web_search
    }

    /// Function tools to send, empty unless the model supports them
    pub fn tools_for(&self, caps: &ModelCapabilities) -> &[ToolDefinition] {
        if caps.tools {
            &self.tools
        } else {
            &[]
        }
    }
}

/// Per-model capability flags resolved from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModelCapabilities {
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub reasoning: bool,
    /// Function calling
    #[serde(default)]
    pub tools: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            web_search: false,
            reasoning: false,
            tools: false,
        }
    }
}

/// Everything an adapter needs to know about the target model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// Model id as the backend knows it
    pub upstream_model: String,
    pub capabilities: ModelCapabilities,
    /// Role name used for the leading system turn on chat-completions backends
    pub system_role: Option<String>,
    /// Default output budget when the caller gave none
    pub max_tokens: Option<u32>,
}

impl ModelSpec {
    pub fn new(upstream_model: impl Into<String>, capabilities: ModelCapabilities) -> Self {
        Self {
            upstream_model: upstream_model.into(),
            capabilities,
            system_role: None,
            max_tokens: None,
        }
    }
}

/// Token usage disclosed by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// One event delivered to the caller.
///
/// A request yields a finite sequence of fragments; exactly the last one has
/// `is_done` set. A fragment with `error` set is always terminal.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFragment {
    pub text: String,
    pub is_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Citations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<serde_json::Value>,
    /// Function calls, complete, on the terminal fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFragment {
    /// Keep-alive / no-content fragment
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            is_done: true,
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            is_done: true,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    /// True when forwarding this fragment would tell the caller nothing
    pub fn is_noop(&self) -> bool {
        !self.is_done
            && self.text.is_empty()
            && self.usage.is_none()
            && self.citations.is_none()
            && self.continuation_token.is_none()
            && self.auxiliary.is_none()
            && self.tool_calls.is_none()
            && self.error.is_none()
    }

    /// Fold metadata from a later fragment into this (held) terminal one
    pub fn absorb_metadata(&mut self, later: ResponseFragment) {
        if later.usage.is_some() {
            self.usage = later.usage;
        }
        if later.citations.is_some() {
            self.citations = later.citations;
        }
        if later.continuation_token.is_some() {
            self.continuation_token = later.continuation_token;
        }
        if later.auxiliary.is_some() {
            self.auxiliary = later.auxiliary;
        }
        if later.tool_calls.is_some() {
            self.tool_calls = later.tool_calls;
        }
        if later.error.is_some() {
            self.error = later.error;
        }
    }
}

/// Aggregated result of a buffered call
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCompletion {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Citations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatCompletion {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl From<ResponseFragment> for ChatCompletion {
    fn from(fragment: ResponseFragment) -> Self {
        Self {
            text: fragment.text,
            usage: fragment.usage,
            citations: fragment.citations,
            continuation_token: fragment.continuation_token,
            auxiliary: fragment.auxiliary,
            tool_calls: fragment.tool_calls,
            error: fragment.error,
        }
    }
}

impl From<ChatCompletion> for ResponseFragment {
    fn from(completion: ChatCompletion) -> Self {
        Self {
            text: completion.text,
            is_done: true,
            usage: completion.usage,
            citations: completion.citations,
            continuation_token: completion.continuation_token,
            auxiliary: completion.auxiliary,
            tool_calls: completion.tool_calls,
            error: completion.error,
        }
    }
}
