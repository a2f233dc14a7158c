//! Anthropic Messages API provider

use std::sync::LazyLock;
use std::time::Duration;

use crate::{
    error::{Error, Result},
    providers::{ModelGateway, RetryPolicy},
    types::{
        CompleteOptions, Completion, CompletionOutcome, Context, Message, RateLimitSnapshot,
        StopReason, Tool, ToolRequest, Usage,
    },
};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

const RATELIMIT_LIMIT: &str = "anthropic-ratelimit-input-tokens-limit";
const RATELIMIT_REMAINING: &str = "anthropic-ratelimit-input-tokens-remaining";
const RATELIMIT_RESET: &str = "anthropic-ratelimit-input-tokens-reset";

/// Inline base64 chart images left over in older transcripts
static INLINE_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[Chart\]\(data:image/[^;]+;base64,[^\)]+\)\s*").expect("valid image regex")
});

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the API base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound each HTTP request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => self.client = client,
            Err(e) => tracing::warn!("Failed to build HTTP client with timeout: {}", e),
        }
        self
    }

    /// Set retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            self.api_key.parse().map_err(|_| Error::InvalidApiKey)?,
        );
        headers.insert("anthropic-version", reqwest::header::HeaderValue::from_static(API_VERSION));
        headers.insert(
            "content-type",
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        headers.insert("accept", reqwest::header::HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn send_once(&self, request: &AnthropicRequest) -> Result<Completion> {
        let url = format!("{}/v1/messages", self.base_url);
        tracing::debug!("Anthropic API URL: {}", url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(error_from_status(status.as_u16(), &headers, &body));
        }

        let (outcome, usage) = parse_response(&body)?;
        Ok(Completion {
            outcome,
            usage,
            rate_limit: parse_rate_limit(&headers),
        })
    }
}

#[async_trait]
impl ModelGateway for AnthropicProvider {
    async fn complete(&self, context: &Context, options: &CompleteOptions) -> Result<Completion> {
        let request = build_request(context, options);
        let request = &request;
        self.retry.run(move || self.send_once(request)).await
    }
}

fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Http(e)
    }
}

fn error_from_status(status: u16, headers: &HeaderMap, body: &str) -> Error {
    let (error_type, message) = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => (parsed.error.error_type, parsed.error.message),
        Err(_) => ("unknown".to_string(), body.trim().to_string()),
    };

    match status {
        401 | 403 => Error::Auth(message),
        429 => {
            tracing::error!(
                "Rate limit exceeded. Input tokens limit: {}, remaining: {}, reset: {}, Retry-After: {} seconds",
                header_str(headers, RATELIMIT_LIMIT).unwrap_or("unknown"),
                header_str(headers, RATELIMIT_REMAINING).unwrap_or("unknown"),
                header_str(headers, RATELIMIT_RESET).unwrap_or("unknown"),
                header_str(headers, "retry-after").unwrap_or("unknown"),
            );
            Error::RateLimited {
                retry_after: header_str(headers, "retry-after").and_then(|v| v.parse().ok()),
            }
        }
        _ => Error::api(status, error_type, message),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Read the input-token rate-limit headers.
///
/// All three must be present and well-formed; otherwise there is no snapshot.
pub fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let limit = header_str(headers, RATELIMIT_LIMIT)?.trim().parse().ok()?;
    let remaining = header_str(headers, RATELIMIT_REMAINING)?.trim().parse().ok()?;
    let reset = chrono::DateTime::parse_from_rfc3339(header_str(headers, RATELIMIT_RESET)?.trim())
        .ok()?
        .with_timezone(&chrono::Utc);
    Some(RateLimitSnapshot {
        remaining,
        limit,
        reset,
    })
}

/// Decode a Messages API response body
pub fn parse_response(body: &str) -> Result<(CompletionOutcome, Usage)> {
    let response: AnthropicResponse = serde_json::from_str(body)
        .map_err(|e| Error::UnexpectedResponse(format!("malformed response body: {}", e)))?;

    let mut text = String::new();
    let mut requests = vec![];
    for block in response.content {
        match block {
            ResponseBlock::Text { text: t } => text.push_str(&t),
            ResponseBlock::ToolUse { id, name, input } => {
                requests.push(ToolRequest::new(id, name, input));
            }
            ResponseBlock::Other => {}
        }
    }

    let stop_reason = response.stop_reason.as_deref().map(map_stop_reason);
    if stop_reason == Some(StopReason::ToolUse) && requests.is_empty() {
        return Err(Error::UnexpectedResponse(
            "stop_reason is tool_use but no tool_use blocks were returned".to_string(),
        ));
    }
    if stop_reason == Some(StopReason::Length) {
        tracing::warn!("Response truncated at max_tokens");
    }

    let usage = Usage::new(response.usage.input_tokens, response.usage.output_tokens);
    let outcome = if requests.is_empty() {
        CompletionOutcome::FinalText(text)
    } else {
        CompletionOutcome::ToolRequests { text, requests }
    };
    Ok((outcome, usage))
}

fn build_request(context: &Context, options: &CompleteOptions) -> AnthropicRequest {
    let tools = if context.tools.is_empty() {
        None
    } else {
        Some(convert_tools(&context.tools))
    };

    AnthropicRequest {
        model: options.model.clone(),
        messages: convert_messages(&context.messages),
        max_tokens: options.max_tokens,
        system: context.system_prompt.as_ref().map(|system_prompt| {
            vec![SystemBlock {
                block_type: "text".to_string(),
                text: system_prompt.clone(),
                cache_control: Some(CacheControl {
                    control_type: "ephemeral".to_string(),
                }),
            }]
        }),
        tools,
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

// ============================================================================
// Conversion functions
// ============================================================================

fn strip_inline_images(text: &str) -> String {
    INLINE_IMAGE.replace_all(text, "").into_owned()
}

fn text_block(text: &str) -> Option<serde_json::Value> {
    let text = strip_inline_images(text);
    if text.trim().is_empty() {
        None
    } else {
        Some(serde_json::json!({ "type": "text", "text": text }))
    }
}

/// Append blocks under a role, merging with the previous message when the
/// role repeats (e.g. a user message after a turn that failed mid-way).
fn push_blocks(result: &mut Vec<AnthropicMessage>, role: &'static str, blocks: Vec<serde_json::Value>) {
    if blocks.is_empty() {
        return;
    }
    match result.last_mut() {
        Some(last) if last.role == role => last.content.extend(blocks),
        _ => result.push(AnthropicMessage {
            role,
            content: blocks,
        }),
    }
}

fn convert_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut result = vec![];

    for (idx, message) in messages.iter().enumerate() {
        match message {
            Message::User { content, .. } => {
                push_blocks(&mut result, "user", text_block(content).into_iter().collect());
            }
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut blocks: Vec<serde_json::Value> = text_block(content).into_iter().collect();
                blocks.extend(tool_calls.iter().map(|call| {
                    serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments
                    })
                }));
                push_blocks(&mut result, "assistant", blocks);

                // Every tool_use must be answered; fall back to the recorded
                // outcomes if the tool-result message never made it to the store.
                let answered = matches!(messages.get(idx + 1), Some(Message::ToolResult { .. }));
                if !tool_calls.is_empty() && !answered {
                    let blocks = tool_calls
                        .iter()
                        .map(|call| {
                            serde_json::json!({
                                "type": "tool_result",
                                "tool_use_id": call.id,
                                "content": call.outcome.model_text(),
                                "is_error": call.outcome.is_error()
                            })
                        })
                        .collect();
                    push_blocks(&mut result, "user", blocks);
                }
            }
            Message::ToolResult { results, .. } => {
                let blocks = results
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "type": "tool_result",
                            "tool_use_id": r.tool_call_id,
                            "content": r.content,
                            "is_error": r.is_error
                        })
                    })
                    .collect();
                push_blocks(&mut result, "user", blocks);
            }
        }
    }

    result
}

fn convert_tools(tools: &[Tool]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| {
            let input_schema = if tool.parameters.is_object() {
                let mut schema = tool.parameters.clone();
                if let Some(obj) = schema.as_object_mut() {
                    obj.entry("type").or_insert(serde_json::json!("object"));
                }
                schema
            } else {
                serde_json::json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                })
            };

            AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema,
            }
        })
        .collect()
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}
