//! sheerwater-agent: turn orchestration engine
//!
//! This crate runs one user turn end to end: it drives the model through the
//! tool-use loop, calls tools on an MCP server, and persists every step of the
//! conversation before moving on.

pub mod error;
pub mod events;
pub mod locks;
pub mod mcp;
pub mod orchestrator;
pub mod settings;
pub mod store;
pub mod tool;

pub use error::{Error, Result, StoreError};
pub use events::TurnEvent;
pub use locks::ConversationLocks;
pub use mcp::{McpClient, McpConfig};
pub use orchestrator::{
    INCOMPLETE_NOTICE, Orchestrator, OrchestratorConfig, Transcript, TurnRequest, TurnResult,
    TurnStatus,
};
pub use settings::{
    DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT, FileSettingsStore, MemorySettingsStore, Settings,
    SettingsScope, SettingsStore, SettingsUpdate, SharedSettingsStore,
};
pub use store::{
    ConversationInfo, JsonlStore, MemoryStore, SharedTranscriptStore, TranscriptStore,
};
pub use tool::{SharedToolGateway, ToolCatalog, ToolFailure, ToolGateway};
