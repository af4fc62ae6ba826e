//! Multi-provider LLM dispatch and conversation orchestration engine.
//!
//! This crate normalizes four provider wire protocols behind one invocation contract,
//! runs the agentic tool-calling loop, sanitizes conversation histories,
//! applies prompt caching and context-window recovery, and enforces
//! provider failover, retry, and a process-wide cost cap. The HTTP/
//! WebSocket server, chat-channel adapters, the credential vault, session
//! persistence, tool implementations, and RAG indexing are all external
//! collaborators this crate only talks to through the trait seams declared
//! here (`CredentialStore`, `Tool`, `ToolRegistry`).

pub mod anthropic;
pub mod anthropic_stream;
pub mod cache;
pub mod cost_meter;
pub mod credentials;
pub mod dispatcher;
pub mod google;
pub mod intent;
pub mod metrics;
pub mod openai_compat;
pub mod overflow;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod sanitizer;
pub mod sse;
pub mod stream;
pub mod tools;

pub use anthropic::AnthropicAdapter;
pub use credentials::{CredentialStore, EnvCredentialStore};
pub use dispatcher::Dispatcher;
pub use google::GoogleAdapter;
pub use intent::{Classification, IntentClassifier, ToolRegistry};
pub use openai_compat::OpenAiCompatAdapter;
pub use overflow::{OverflowStats, Stage as OverflowStage};
pub use provider::ProviderAdapter;
pub use registry::ProviderRegistry;
pub use retry::RetryPolicy;
pub use stream::StreamEvent;
pub use tools::tool_loop::{ToolLoop, ToolLoopOutcome};
pub use tools::{Tool, ToolResult};
