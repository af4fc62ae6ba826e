//! Tool execution seam. Tool implementations themselves are out of scope
//! for this crate (§6 "calls out: tool executor") — this module defines
//! only the trait shape the tool loop drives and the result it expects
//! back, plus the loop itself in [`tool_loop`].

pub mod tool_loop;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skynet_core::{ToolSchema, ERROR_SENTINEL};

/// Result of executing one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content fed back to the model as a `tool_result` block.
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    /// Prefixes the message with the error sentinel if the caller hasn't
    /// already — the circuit breaker counts on it appearing at index 0
    /// (§4.9g).
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let content = if message.starts_with(ERROR_SENTINEL) {
            message
        } else {
            format!("{ERROR_SENTINEL} {message}")
        };
        Self { content, is_error: true }
    }
}

/// Trait every tool implementation satisfies. The tool loop holds a slice
/// of these, resolved by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Convert a slice of tools to the provider-neutral schema shape every
/// adapter consumes.
pub fn to_schemas(tools: &[Box<dyn Tool>]) -> Vec<ToolSchema> {
    tools
        .iter()
        .map(|t| ToolSchema {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.input_schema(),
        })
        .collect()
}
