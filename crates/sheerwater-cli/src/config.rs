//! Configuration file support

use serde::{Deserialize, Serialize};
use sheerwater_agent::{McpConfig, OrchestratorConfig};
use sheerwater_ai::AnthropicProvider;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MCP_SERVER_URL: &str = "http://localhost:8000/sse";

/// Configuration for sheerwater
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// User id conversations are stored under
    pub user: Option<String>,
    /// Where conversations and settings live
    pub data_dir: Option<String>,
    /// API keys (alternative to environment variables)
    pub api_keys: ApiKeys,
    pub anthropic: AnthropicSection,
    pub mcp: McpSection,
    pub engine: EngineSection,
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
}

/// Model provider connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicSection {
    pub base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

/// Tool server connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSection {
    pub url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    /// Connection attempts at startup
    pub connect_attempts: Option<u32>,
}

/// Turn engine knobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_steps: Option<u32>,
    pub tool_timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sheerwater")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for SHEERWATER_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("SHEERWATER_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Create the config file from the example if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        Self::init_at(&path)?;
        Ok(path)
    }

    fn init_at(path: &Path) -> std::io::Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, example_config())
    }

    /// Anthropic API key: `ANTHROPIC_API_KEY`, then config
    pub fn anthropic_api_key(&self) -> Option<String> {
        self.anthropic_api_key_with(std::env::var("ANTHROPIC_API_KEY").ok())
    }

    fn anthropic_api_key_with(&self, env: Option<String>) -> Option<String> {
        env.filter(|key| !key.is_empty())
            .or_else(|| self.api_keys.anthropic.clone())
            .filter(|key| !key.is_empty())
    }

    pub fn user_id(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "local".to_string())
    }

    /// Tool server URL: `MCP_SERVER_URL`, then config, then the default
    pub fn mcp_url(&self) -> String {
        self.mcp_url_with(std::env::var("MCP_SERVER_URL").ok())
    }

    fn mcp_url_with(&self, env: Option<String>) -> String {
        env.or_else(|| self.mcp.url.clone())
            .unwrap_or_else(|| DEFAULT_MCP_SERVER_URL.to_string())
    }

    /// Data directory: `SHEERWATER_DATA_DIR`, then config, then the platform data dir
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir_with(std::env::var("SHEERWATER_DATA_DIR").ok())
    }

    fn data_dir_with(&self, env: Option<String>) -> PathBuf {
        env.or_else(|| self.data_dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("sheerwater")
            })
    }

    /// Model gateway built from the `[anthropic]` section
    pub fn provider(&self, api_key: String) -> AnthropicProvider {
        let mut provider = AnthropicProvider::new(api_key).with_request_timeout(Duration::from_secs(
            self.anthropic.request_timeout_secs.unwrap_or(300),
        ));
        if let Some(base_url) = &self.anthropic.base_url {
            provider = provider.with_base_url(base_url);
        }
        provider
    }

    pub fn mcp_config(&self) -> McpConfig {
        let mut config = McpConfig::new(self.mcp_url());
        if let Some(secs) = self.mcp.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.mcp.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn connect_attempts(&self) -> u32 {
        self.mcp.connect_attempts.unwrap_or(5)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        OrchestratorConfig {
            max_steps: self.engine.max_steps.unwrap_or(defaults.max_steps),
            tool_timeout: self
                .engine
                .tool_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_timeout),
            max_tokens: self.engine.max_tokens.unwrap_or(defaults.max_tokens),
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# sheerwater configuration file
# Place at ~/.config/sheerwater/config.toml (Linux) or set SHEERWATER_CONFIG_PATH

# User id conversations are stored under (defaults to $USER)
# user = "alice"

# Where conversations and settings are stored (or set SHEERWATER_DATA_DIR)
# data_dir = "/var/lib/sheerwater"

# API keys (optional; ANTHROPIC_API_KEY takes precedence)
[api_keys]
# anthropic = "sk-ant-..."

# Model provider
[anthropic]
# base_url = "https://api.anthropic.com"
request_timeout_secs = 300

# Tool server (MCP over SSE); MCP_SERVER_URL overrides url
[mcp]
url = "http://localhost:8000/sse"
request_timeout_secs = 120
connect_timeout_secs = 10
connect_attempts = 5

# Turn engine
[engine]
max_steps = 10
tool_timeout_secs = 120
max_tokens = 4096
"#
}
