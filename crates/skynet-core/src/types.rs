use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A typed content block inside a message.
///
/// Modeled as a tagged variant rather than a raw JSON value so that every
/// sanitizer and adapter operates on the same closed set of shapes — the
/// source this crate's behavior is grounded on mixes dict-shaped messages
/// across providers; here the shape is fixed at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, media_type: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult { tool_use_id: String, content: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }
}

/// Either a plain string or a list of typed content blocks.
///
/// Most user/system turns are plain text; tool-bearing assistant turns and
/// tool-result turns carry block lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            Content::Text(t) => vec![ContentBlock::text(t.clone())],
            Content::Blocks(b) => b.clone(),
        }
    }

    /// Concatenate all text-bearing parts of this content into one string.
    pub fn flatten_text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty_text(&self) -> bool {
        matches!(self, Content::Text(t) if t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// An ordered entry in a conversation history.
///
/// Bookkeeping keys that must never reach a provider (the source's
/// injection markers) are never attached here — see [`MessageAnnotations`]
/// for the parallel side-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(text.into()),
        }
    }

    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: Content::Blocks(blocks),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::blocks(
            Role::Tool,
            vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
            }],
        )
    }
}

/// Out-of-band bookkeeping attached to a message by identity (index), never
/// by mutating the message itself — so provider adapters structurally
/// cannot observe caller-internal markers (injection flags, recall tags).
#[derive(Debug, Clone, Default)]
pub struct MessageAnnotations(HashMap<usize, HashMap<String, serde_json::Value>>);

impl MessageAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, message_index: usize, key: impl Into<String>, value: serde_json::Value) {
        self.0.entry(message_index).or_default().insert(key.into(), value);
    }

    pub fn get(&self, message_index: usize, key: &str) -> Option<&serde_json::Value> {
        self.0.get(&message_index).and_then(|m| m.get(key))
    }
}

/// Provider-neutral tool schema. Adapters re-key `parameters` vs `input_schema`
/// as their wire format demands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool call extracted from a provider response, in a provider-neutral shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Token accounting for a single call, including prompt-cache discounts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub cache_creation: u32,
    pub cache_read: u32,
}

/// Thinking-depth tiers, shared across providers that support extended
/// reasoning. `Off` (the default) disables the feature entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    Low,
    Medium,
    High,
    XHigh,
}

impl Default for ThinkingLevel {
    fn default() -> Self {
        ThinkingLevel::Off
    }
}

impl ThinkingLevel {
    /// Fixed budget table (§4.3), not derived from model context size.
    pub fn budget_tokens(&self) -> u32 {
        match self {
            ThinkingLevel::Off => 0,
            ThinkingLevel::Low => 4_000,
            ThinkingLevel::Medium => 10_000,
            ThinkingLevel::High => 16_000,
            ThinkingLevel::XHigh => 32_000,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(ThinkingLevel::Off),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            "xhigh" => Some(ThinkingLevel::XHigh),
            _ => None,
        }
    }

    /// One tier deeper, saturating at `XHigh` — used when a detail-intent
    /// phrase asks for more than the intent's baseline depth.
    pub fn step_up(&self) -> Self {
        match self {
            ThinkingLevel::Off => ThinkingLevel::Low,
            ThinkingLevel::Low => ThinkingLevel::Medium,
            ThinkingLevel::Medium => ThinkingLevel::High,
            ThinkingLevel::High | ThinkingLevel::XHigh => ThinkingLevel::XHigh,
        }
    }
}

impl std::fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::XHigh => "xhigh",
        };
        f.write_str(s)
    }
}

/// A system prompt split into cache-friendly tiers for providers that
/// support prompt caching (Anthropic).
///
/// TIER 1 (static): identical across calls for a given deployment — tool
///   catalog, persona, safety rules.
/// TIER 2 (dynamic): stable across a session's turns but varies by session
///   or user.
/// TIER 3 (volatile): changes every call (turn count, timestamp), always
///   placed last so it never breaks a cached prefix.
///
/// Exposed as an explicit builder rather than a magic boundary string
/// embedded in prompt text, so the cache split is structural. Provider
/// adapters that don't support caching flatten it with [`SystemPrompt::to_plain_text`];
/// Anthropic's adapter shapes it into cache-tagged content blocks itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemPrompt {
    pub static_tier: String,
    pub dynamic_tier: String,
    pub volatile_tier: String,
}

impl SystemPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_static(mut self, text: impl Into<String>) -> Self {
        self.static_tier = text.into();
        self
    }

    pub fn with_dynamic(mut self, text: impl Into<String>) -> Self {
        self.dynamic_tier = text.into();
        self
    }

    pub fn with_volatile(mut self, text: impl Into<String>) -> Self {
        self.volatile_tier = text.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.static_tier.is_empty() && self.dynamic_tier.is_empty() && self.volatile_tier.is_empty()
    }

    pub fn to_plain_text(&self) -> String {
        [&self.static_tier, &self.dynamic_tier, &self.volatile_tier]
            .into_iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// A `"provider/model-id"` string split into its two parts. Models without
/// a `/` are treated as having no explicit provider (caller falls back to
/// the configured default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelId {
    pub provider: String,
    pub model_id: String,
}

impl ModelId {
    pub fn parse(model: &str) -> Self {
        match model.split_once('/') {
            Some((provider, model_id)) => Self {
                provider: provider.to_string(),
                model_id: model_id.to_string(),
            },
            None => Self {
                provider: String::new(),
                model_id: model.to_string(),
            },
        }
    }
}

/// Immutable invocation descriptor handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct LLMCall {
    /// Provider-prefixed identifier, e.g. `"anthropic/claude-sonnet-4-6"`.
    pub model: String,
    pub messages: Vec<Message>,
    pub system: SystemPrompt,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    pub thinking: Option<ThinkingLevel>,
    pub thinking_supported: bool,
}

impl LLMCall {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system: SystemPrompt::default(),
            tools: Vec::new(),
            max_tokens: 1024,
            thinking: None,
            thinking_supported: false,
        }
    }
}

/// Uniform result shape returned by every provider adapter.
#[derive(Debug, Clone, Default)]
pub struct LLMResult {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
    pub model: String,
    pub cached: bool,
}

impl LLMResult {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Per-session usage accounting, maintained by the caller's session store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_read_tokens: u64,
    pub cost_so_far_usd: f64,
    pub response_count: u64,
}

/// A session: an ordered message history plus usage accounting and an
/// optional per-session model override. Created on first reference,
/// mutated only by the tool loop, destroyed only on explicit request.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub messages: Vec<Message>,
    pub model_override: Option<String>,
    pub usage: SessionUsage,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Chat,
    Memory,
    Creative,
    Code,
    Search,
    Analysis,
    Media,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Chat => "chat",
            Intent::Memory => "memory",
            Intent::Creative => "creative",
            Intent::Code => "code",
            Intent::Search => "search",
            Intent::Analysis => "analysis",
            Intent::Media => "media",
        }
    }
}
