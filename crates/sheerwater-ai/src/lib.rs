//! sheerwater-ai: language-model gateway
//!
//! This crate defines the conversation types shared by the chat engine and a
//! gateway to the Anthropic Messages API that turns a conversation into either
//! a final answer or a set of tool requests, with usage and rate-limit data.

pub mod error;
pub mod providers;
pub mod types;

pub use error::{Error, Result};
pub use providers::anthropic::AnthropicProvider;
pub use providers::{ModelGateway, RetryPolicy};
pub use types::*;
