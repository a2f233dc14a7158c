//! Tool gateway trait, tool catalog and result rendering

use async_trait::async_trait;
use serde_json::Value;
use sheerwater_ai::Tool;
use std::collections::HashMap;
use std::sync::Arc;

/// Why a tool call did not produce a result.
///
/// The display string is the failure reason recorded on the tool call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolFailure {
    /// No answer within the per-call timeout
    #[error("timeout")]
    Timeout,
    /// The tool server could not be reached, even after reconnecting
    #[error("unavailable")]
    Unavailable,
    /// The tool ran and reported an error
    #[error("{0}")]
    Failed(String),
    /// The model asked for a tool the server does not offer
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// Arguments did not match the tool's input schema
    #[error("{0}")]
    InvalidArguments(String),
}

impl ToolFailure {
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// A remote tool server the turn engine can call
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Tools currently offered by the server
    async fn catalog(&self) -> Result<Vec<Tool>, ToolFailure>;

    /// Invoke a tool; arguments and result are passed through untouched
    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolFailure>;
}

/// Type alias for a shared tool gateway
pub type SharedToolGateway = Arc<dyn ToolGateway>;

/// Tool definitions for one turn, with compiled argument validators
pub struct ToolCatalog {
    tools: Vec<Tool>,
    validators: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<Tool>) -> Self {
        let mut validators = HashMap::new();
        for tool in &tools {
            match jsonschema::validator_for(&tool.parameters) {
                Ok(validator) => {
                    validators.insert(tool.name.clone(), Arc::new(validator));
                }
                Err(e) => {
                    tracing::warn!(
                        "Invalid tool parameter schema for '{}', skipping validation: {}",
                        tool.name,
                        e
                    );
                }
            }
        }
        Self { tools, validators }
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Reject calls to unknown tools or with arguments that fail the schema
    pub fn check(&self, name: &str, arguments: &Value) -> Result<(), ToolFailure> {
        if !self.tools.iter().any(|t| t.name == name) {
            return Err(ToolFailure::UnknownTool(name.to_string()));
        }
        match self.validators.get(name) {
            Some(validator) => match validate_with_validator(arguments, validator) {
                Some(err) => Err(ToolFailure::InvalidArguments(err)),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(args: &Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}

/// A tool result split into what the model sees and what only the front end needs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedResult {
    pub text: String,
    pub chart_urls: Vec<String>,
}

/// Render a tool result payload for the model.
///
/// Text blocks holding a chart link object are pulled out into `chart_urls`
/// and not shown to the model.
pub fn render_result(payload: &Value) -> RenderedResult {
    let mut rendered = RenderedResult::default();

    let blocks = payload
        .get("content")
        .and_then(|c| c.as_array())
        .filter(|blocks| !blocks.is_empty());

    match blocks {
        Some(blocks) => {
            for block in blocks {
                match block.get("text").and_then(|t| t.as_str()) {
                    Some(text) => match extract_chart_url(text) {
                        Some(url) => rendered.chart_urls.push(url),
                        None => rendered.text.push_str(text),
                    },
                    None => rendered.text.push_str(&block.to_string()),
                }
            }
        }
        None => {
            let text = match payload {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match extract_chart_url(&text) {
                Some(url) => rendered.chart_urls.push(url),
                None => rendered.text = text,
            }
        }
    }

    rendered
}

/// Render a failure for the model
pub fn render_failure(failure: &ToolFailure) -> String {
    format!("Error: {}", failure)
}

/// Chart link from a JSON object, preferring the interactive `html_url`
pub fn extract_chart_url(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    obj.get("html_url")
        .or_else(|| obj.get("chart_url"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup_tool() -> Tool {
        Tool::new(
            "lookup",
            "Look something up",
            json!({
                "type": "object",
                "properties": {
                    "q": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["q"]
            }),
        )
    }

    #[test]
    fn test_catalog_accepts_valid_args() {
        let catalog = ToolCatalog::new(vec![lookup_tool()]);
        assert!(catalog.check("lookup", &json!({"q": "x"})).is_ok());
        assert!(catalog.check("lookup", &json!({"q": "x", "limit": 3})).is_ok());
    }

    #[test]
    fn test_catalog_rejects_missing_required() {
        let catalog = ToolCatalog::new(vec![lookup_tool()]);
        match catalog.check("lookup", &json!({"limit": 3})) {
            Err(ToolFailure::InvalidArguments(msg)) => {
                assert!(msg.contains("validation failed"), "got: {}", msg);
                assert!(msg.contains("q"), "should mention missing field, got: {}", msg);
            }
            other => panic!("expected InvalidArguments, got {:?}", other),
        }
    }

    #[test]
    fn test_catalog_rejects_wrong_type() {
        let catalog = ToolCatalog::new(vec![lookup_tool()]);
        assert!(matches!(
            catalog.check("lookup", &json!({"q": 42})),
            Err(ToolFailure::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_catalog_unknown_tool() {
        let catalog = ToolCatalog::new(vec![lookup_tool()]);
        let err = catalog.check("missing", &json!({})).unwrap_err();
        assert_eq!(err.reason(), "unknown tool: missing");
    }

    #[test]
    fn test_catalog_invalid_schema_skips_validation() {
        let tool = Tool::new("odd", "Odd schema", json!({"type": "not_a_real_type"}));
        let catalog = ToolCatalog::new(vec![tool]);
        assert!(catalog.check("odd", &json!({"anything": true})).is_ok());
    }

    #[test]
    fn test_failure_reasons() {
        assert_eq!(ToolFailure::Timeout.reason(), "timeout");
        assert_eq!(ToolFailure::Unavailable.reason(), "unavailable");
        assert_eq!(render_failure(&ToolFailure::Timeout), "Error: timeout");
    }

    #[test]
    fn test_render_plain_payload() {
        let rendered = render_result(&json!({"value": "42"}));
        assert_eq!(rendered.text, "{\"value\":\"42\"}");
        assert!(rendered.chart_urls.is_empty());

        let rendered = render_result(&json!("plain text"));
        assert_eq!(rendered.text, "plain text");
    }

    #[test]
    fn test_render_mcp_content_blocks() {
        let payload = json!({
            "content": [
                {"type": "text", "text": "MAE: 1.2. "},
                {"type": "text", "text": "{\"png_url\": \"https://x/c.png\", \"html_url\": \"https://x/c.html\"}"},
                {"type": "text", "text": "RMSE: 2.0"}
            ],
            "isError": false
        });
        let rendered = render_result(&payload);
        assert_eq!(rendered.text, "MAE: 1.2. RMSE: 2.0");
        assert_eq!(rendered.chart_urls, vec!["https://x/c.html".to_string()]);
    }

    #[test]
    fn test_extract_chart_url_legacy_and_missing() {
        assert_eq!(
            extract_chart_url("{\"chart_url\": \"https://x/old.png\"}"),
            Some("https://x/old.png".to_string())
        );
        assert_eq!(extract_chart_url("{\"png_url\": \"https://x/c.png\"}"), None);
        assert_eq!(extract_chart_url("not json"), None);
        assert_eq!(extract_chart_url("[1, 2]"), None);
    }
}
