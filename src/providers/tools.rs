//! Function calling: tool definitions in each wire dialect and
//! reassembly of calls that arrive in pieces.

use crate::models::{ToolCall, ToolDefinition};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// `tools` entry for chat-completions backends
pub(crate) fn chat_tool(tool: &ToolDefinition) -> Value {
    let mut function = json!({
        "name": tool.name,
        "parameters": tool.parameters,
    });
    if let Some(description) = &tool.description {
        function["description"] = json!(description);
    }
    json!({"type": "function", "function": function})
}

/// `tools` entry for the Responses API (flat function shape)
pub(crate) fn responses_tool(tool: &ToolDefinition) -> Value {
    let mut entry = json!({
        "type": "function",
        "name": tool.name,
        "parameters": tool.parameters,
    });
    if let Some(description) = &tool.description {
        entry["description"] = json!(description);
    }
    entry
}

/// Arguments arrive as a JSON string; an empty string means no arguments
pub(crate) fn parse_arguments(name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("⚠️ Unparseable arguments for tool '{}': {}", name, e);
        json!({})
    })
}

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Collects streamed tool-call pieces keyed by their position in the
/// response, in the order the backend numbered them
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    calls: BTreeMap<u64, PendingCall>,
}

impl ToolCallAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record an id and a name fragment. Chat-completions streams may split
    /// the name, so it is appended.
    pub(crate) fn start(&mut self, index: u64, id: Option<&str>, name: Option<&str>) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            call.id = Some(id.to_string());
        }
        if let Some(name) = name {
            call.name.push_str(name);
        }
    }

    /// Record id and name of a call announced whole, keeping the first seen
    pub(crate) fn register(&mut self, index: u64, id: Option<&str>, name: Option<&str>) {
        let call = self.calls.entry(index).or_default();
        if call.id.is_none() {
            call.id = id.filter(|id| !id.is_empty()).map(str::to_string);
        }
        if call.name.is_empty() {
            if let Some(name) = name {
                call.name = name.to_string();
            }
        }
    }

    pub(crate) fn append_arguments(&mut self, index: u64, piece: &str) {
        self.calls.entry(index).or_default().arguments.push_str(piece);
    }

    /// Replace whatever was streamed with the backend's final arguments
    pub(crate) fn set_arguments(&mut self, index: u64, arguments: &str) {
        self.calls.entry(index).or_default().arguments = arguments.to_string();
    }

    /// One `tool_calls[]` delta of a chat-completions chunk
    pub(crate) fn add_chat_delta(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0);
        let function = delta.get("function");
        self.start(
            index,
            delta.get("id").and_then(Value::as_str),
            function.and_then(|f| f.get("name")).and_then(Value::as_str),
        );
        if let Some(piece) = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
        {
            self.append_arguments(index, piece);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed calls, or `None` when the model requested none
    pub(crate) fn finish(&mut self) -> Option<Vec<ToolCall>> {
        if self.calls.is_empty() {
            return None;
        }
        let calls = std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, call)| {
                debug!("🔧 Tool call {} '{}'", index, call.name);
                ToolCall {
                    id: call.id.unwrap_or_else(|| format!("tool-{}", index)),
                    arguments: parse_arguments(&call.name, &call.arguments),
                    name: call.name,
                }
            })
            .collect();
        Some(calls)
    }
}
