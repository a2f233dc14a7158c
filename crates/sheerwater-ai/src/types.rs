//! Core types for model interactions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl Usage {
    /// Create usage from input and output counts
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }

    /// Add another request's usage to this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.total = self.input + self.output;
    }
}

/// Provider rate-limit state for input tokens, as of the most recent response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    /// Input tokens still available in the current window
    pub remaining: u64,
    /// Total input tokens allowed per window
    pub limit: u64,
    /// When the window resets
    pub reset: DateTime<Utc>,
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of response
    Stop,
    /// Maximum tokens reached
    Length,
    /// Tool use requested
    ToolUse,
}

/// Outcome of a tool call: a result payload or a failure, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { result: serde_json::Value },
    Failure { reason: String },
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Failure { .. })
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match self {
            ToolOutcome::Success { result } => Some(result),
            ToolOutcome::Failure { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failure { reason } => Some(reason),
        }
    }

    /// Plain rendering of the outcome for the model
    pub fn model_text(&self) -> String {
        match self {
            ToolOutcome::Success {
                result: serde_json::Value::String(s),
            } => s.clone(),
            ToolOutcome::Success { result } => result.to_string(),
            ToolOutcome::Failure { reason } => format!("Error: {}", reason),
        }
    }
}

/// A tool invocation recorded on an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the matching tool result
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

/// A tool invocation the model asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolRequest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Attach the outcome, producing the recorded call
    pub fn complete(self, outcome: ToolOutcome) -> ToolCall {
        ToolCall {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
            outcome,
        }
    }
}

/// Tool output as shown to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultContent {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Conversation messages, tagged by role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    /// User message
    #[serde(rename = "user")]
    User { content: String, timestamp: i64 },
    /// Assistant response, with any tool calls it made
    #[serde(rename = "assistant")]
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        timestamp: i64,
    },
    /// Outcomes of the preceding assistant message's tool calls
    #[serde(rename = "tool-result")]
    ToolResult {
        results: Vec<ToolResultContent>,
        timestamp: i64,
    },
}

impl Message {
    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: text.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create an assistant message
    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: text.into(),
            tool_calls,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create a tool result message
    pub fn tool_results(results: Vec<ToolResultContent>) -> Self {
        Self::ToolResult {
            results,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Replace the creation timestamp (before the message is stored)
    pub fn with_timestamp(mut self, ts: i64) -> Self {
        match &mut self {
            Self::User { timestamp, .. }
            | Self::Assistant { timestamp, .. }
            | Self::ToolResult { timestamp, .. } => *timestamp = ts,
        }
        self
    }

    /// Get the role as a string
    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool-result",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::User { timestamp, .. }
            | Self::Assistant { timestamp, .. }
            | Self::ToolResult { timestamp, .. } => *timestamp,
        }
    }

    /// Text content; empty for tool results
    pub fn text(&self) -> &str {
        match self {
            Self::User { content, .. } | Self::Assistant { content, .. } => content,
            Self::ToolResult { .. } => "",
        }
    }

    /// Tool calls attached to an assistant message
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// Tool definition for function calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

impl Tool {
    /// Create a new tool definition
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Context for a model request
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Conversation messages
    pub messages: Vec<Message>,
    /// Available tools
    pub tools: Vec<Tool>,
}

impl Context {
    /// Create a new context with a system prompt
    pub fn with_system(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(system_prompt.into()),
            messages: vec![],
            tools: vec![],
        }
    }

    /// Add a message to the context
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Add a tool to the context
    pub fn add_tool(&mut self, tool: Tool) {
        self.tools.push(tool);
    }
}

/// Per-request options
#[derive(Debug, Clone)]
pub struct CompleteOptions {
    /// Model identifier (e.g., "claude-sonnet-4-20250514")
    pub model: String,
    /// Maximum tokens to generate
    pub max_tokens: u32,
}

impl CompleteOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// What the model produced
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// A final answer, no tools requested
    FinalText(String),
    /// One or more tool invocations, with any text the model wrote alongside
    ToolRequests {
        text: String,
        requests: Vec<ToolRequest>,
    },
}

/// A single model response with its accounting
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub outcome: CompletionOutcome,
    pub usage: Usage,
    pub rate_limit: Option<RateLimitSnapshot>,
}

impl Completion {
    /// Final-text completion without rate-limit data
    pub fn text(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            outcome: CompletionOutcome::FinalText(text.into()),
            usage,
            rate_limit: None,
        }
    }

    /// Tool-request completion without rate-limit data
    pub fn tools(requests: Vec<ToolRequest>, usage: Usage) -> Self {
        Self {
            outcome: CompletionOutcome::ToolRequests {
                text: String::new(),
                requests,
            },
            usage,
            rate_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_usage_accumulate() {
        let mut total = Usage::default();
        total.accumulate(&Usage::new(5, 3));
        total.accumulate(&Usage::new(10, 2));
        assert_eq!(total, Usage { input: 15, output: 5, total: 20 });
    }

    #[test]
    fn test_message_role_tags() {
        let user = serde_json::to_value(Message::user("hi").with_timestamp(1)).unwrap();
        assert_eq!(user, json!({"role": "user", "content": "hi", "timestamp": 1}));

        let results = Message::tool_results(vec![]).with_timestamp(2);
        assert_eq!(results.role(), "tool-result");
        let value = serde_json::to_value(&results).unwrap();
        assert_eq!(value["role"], "tool-result");
    }

    #[test]
    fn test_tool_call_outcome_is_flattened() {
        let call = ToolRequest::new("toolu_1", "lookup", json!({"q": "x"}))
            .complete(ToolOutcome::Failure { reason: "timeout".into() });
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["reason"], "timeout");
        assert!(value.get("result").is_none());

        let back: ToolCall = serde_json::from_value(value).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn test_assistant_without_tool_calls_omits_field() {
        let msg = Message::assistant("done", vec![]).with_timestamp(3);
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("tool_calls").is_none());
        let back: Message = serde_json::from_value(value).unwrap();
        assert!(back.tool_calls().is_empty());
    }

    #[test]
    fn test_outcome_accessors() {
        let ok = ToolOutcome::Success { result: json!({"value": "42"}) };
        assert!(!ok.is_error());
        assert_eq!(ok.result(), Some(&json!({"value": "42"})));
        assert_eq!(ok.failure_reason(), None);

        let failed = ToolOutcome::Failure { reason: "unavailable".into() };
        assert!(failed.is_error());
        assert_eq!(failed.failure_reason(), Some("unavailable"));
    }
}
