//! Shared data model, configuration, and error types for the LLM dispatch
//! and conversation orchestration engine.
//!
//! This crate holds no I/O and no provider logic — see `skynet-agent` for
//! the dispatcher, adapters, and tool loop built on top of these types.

pub mod config;
pub mod error;
pub mod types;

pub use config::{GatewayConfig, IntentTokens, ModelPricing};
pub use error::{GatewayError, Result, ERROR_SENTINEL};
pub use types::{
    Content, ContentBlock, Intent, LLMCall, LLMResult, Message, MessageAnnotations, ModelId, Role,
    Session, SessionUsage, SystemPrompt, ThinkingLevel, ToolCallRecord, ToolSchema, Usage,
};
