use async_trait::async_trait;
use serde::Deserialize;
use skynet_core::{
    ContentBlock as CoreContentBlock, GatewayError, LLMCall, LLMResult, Message, Role, ThinkingLevel,
    ToolCallRecord, Usage,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::ProviderAdapter;
use crate::stream::StreamEvent;

const API_VERSION: &str = "2023-06-01";
const PROMPT_CACHING_BETA: &str = "prompt-caching-2024-07-31";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat01-";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    is_oauth: bool,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let is_oauth = api_key.starts_with(OAUTH_TOKEN_PREFIX);
        Self {
            client: reqwest::Client::new(),
            is_oauth,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    /// OAuth tokens use Bearer + a beta header; plain API keys use `x-api-key`.
    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.is_oauth {
            builder
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("anthropic-beta", OAUTH_BETA)
        } else {
            builder.header("x-api-key", &self.api_key)
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/v1/messages", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", PROMPT_CACHING_BETA)
            .header("content-type", "application/json")
            .json(body);

        self.apply_auth(builder).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::TimeoutError {
                    provider: self.name().to_string(),
                }
            } else {
                GatewayError::NetworkError {
                    provider: self.name().to_string(),
                    message: e.to_string(),
                }
            }
        })
    }

    async fn error_for_status(&self, resp: reqwest::Response) -> GatewayError {
        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return GatewayError::AuthError {
                provider: self.name().to_string(),
            };
        }
        if status == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5_000);
            return GatewayError::RateLimitError {
                provider: self.name().to_string(),
                retry_after_ms,
            };
        }
        if status == 529 {
            return GatewayError::OverloadedError {
                provider: self.name().to_string(),
            };
        }
        let text = resp.text().await.unwrap_or_default();
        warn!(status, body = %redact(&text), provider = self.name(), "anthropic API error");
        GatewayError::ProviderSchemaError {
            provider: self.name().to_string(),
            message: format!("HTTP {status}: {}", truncate(&text, 300)),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn call(&self, request: &LLMCall) -> Result<LLMResult, GatewayError> {
        let body = build_request_body(request, false);
        debug!(model = %request.model, provider = self.name(), "sending request");

        let resp = self.post(&body).await?;
        if !resp.status().is_success() {
            return Err(self.error_for_status(resp).await);
        }

        let api_resp: ApiResponse = resp.json().await.map_err(|e| GatewayError::ProviderSchemaError {
            provider: self.name().to_string(),
            message: e.to_string(),
        })?;

        Ok(parse_response(api_resp))
    }

    async fn stream(&self, request: &LLMCall, tx: mpsc::Sender<StreamEvent>) -> Result<(), GatewayError> {
        let body = build_request_body(request, true);
        debug!(model = %request.model, provider = self.name(), "sending streaming request");

        let resp = self.post(&body).await?;
        if !resp.status().is_success() {
            let err = self.error_for_status(resp).await;
            let _ = tx.send(StreamEvent::Error { message: err.to_string() }).await;
            return Err(err);
        }

        crate::anthropic_stream::process_stream(resp, tx).await;
        Ok(())
    }
}

/// Mask alphanumeric/`-`/`_` runs of 20+ chars in the first 300 chars of a
/// logged body, so accidental key leakage in error bodies never hits logs.
fn redact(text: &str) -> String {
    let window = truncate(text, 300);
    let mut out = String::with_capacity(window.len());
    let mut run = String::new();
    let flush = |run: &mut String, out: &mut String| {
        if run.chars().count() >= 20 {
            out.push_str("[REDACTED]");
        } else {
            out.push_str(run);
        }
        run.clear();
    };
    for c in window.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            run.push(c);
        } else {
            flush(&mut run, &mut out);
            out.push(c);
        }
    }
    flush(&mut run, &mut out);
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
        Role::System => "user",
    }
}

fn content_block_json(block: &CoreContentBlock) -> serde_json::Value {
    match block {
        CoreContentBlock::Text { text } => serde_json::json!({ "type": "text", "text": text }),
        CoreContentBlock::Image { data, media_type } => serde_json::json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
        CoreContentBlock::ToolUse { id, name, input } => {
            serde_json::json!({ "type": "tool_use", "id": id, "name": name, "input": input })
        }
        CoreContentBlock::ToolResult { tool_use_id, content } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
        }),
    }
}

fn message_json(message: &Message) -> serde_json::Value {
    serde_json::json!({
        "role": role_str(message.role),
        "content": message.content.blocks().iter().map(content_block_json).collect::<Vec<_>>(),
    })
}

fn system_blocks(prompt: &skynet_core::SystemPrompt) -> Vec<serde_json::Value> {
    let mut blocks = Vec::with_capacity(3);
    if !prompt.static_tier.is_empty() {
        blocks.push(serde_json::json!({
            "type": "text",
            "text": prompt.static_tier,
            "cache_control": { "type": "ephemeral" },
        }));
    }
    if !prompt.dynamic_tier.is_empty() {
        blocks.push(serde_json::json!({
            "type": "text",
            "text": prompt.dynamic_tier,
            "cache_control": { "type": "ephemeral" },
        }));
    }
    if !prompt.volatile_tier.is_empty() {
        blocks.push(serde_json::json!({ "type": "text", "text": prompt.volatile_tier }));
    }
    blocks
}

/// Extended-thinking support is limited to the Claude opus/sonnet family.
fn supports_thinking(model: &str) -> bool {
    model.contains("opus") || model.contains("sonnet")
}

fn build_request_body(req: &LLMCall, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(message_json).collect();

    let mut max_tokens = req.max_tokens;
    let mut thinking_block = None;
    if req.thinking_supported && supports_thinking(&req.model) {
        if let Some(level) = req.thinking {
            if level != ThinkingLevel::Off {
                let budget = level.budget_tokens();
                max_tokens = max_tokens.max(budget + 4_000);
                thinking_block = Some(serde_json::json!({
                    "type": "enabled",
                    "budget_tokens": budget,
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": max_tokens,
        "system": system_blocks(&req.system),
        "messages": messages,
        "stream": stream,
    });

    // Temperature is omitted entirely when thinking is enabled (the API
    // rejects the combination), so we never set it at all here — the
    // adapter has no sampling-temperature knob in the call descriptor.
    if let Some(thinking) = thinking_block {
        body["thinking"] = thinking;
    }

    if !req.tools.is_empty() {
        let last_index = req.tools.len() - 1;
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut v = serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                });
                if i == last_index {
                    v["cache_control"] = serde_json::json!({ "type": "ephemeral" });
                }
                v
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

fn parse_response(resp: ApiResponse) -> LLMResult {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCallRecord> = Vec::new();

    for block in resp.content {
        match block {
            ApiContentBlock::Text { text } => text_parts.push(text),
            ApiContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCallRecord { id, name, arguments: input });
            }
            ApiContentBlock::Thinking { .. } | ApiContentBlock::Unknown => {}
        }
    }

    LLMResult {
        content: text_parts.join(""),
        tool_calls,
        usage: Usage {
            input: resp.usage.input_tokens,
            output: resp.usage.output_tokens,
            cache_creation: resp.usage.cache_creation_input_tokens.unwrap_or(0),
            cache_read: resp.usage.cache_read_input_tokens.unwrap_or(0),
        },
        model: resp.model,
        cached: false,
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ApiContentBlock>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    /// Internal reasoning block — filtered out of the flattened result;
    /// callers never see raw thinking text via the non-streaming path.
    #[serde(rename = "thinking")]
    Thinking {
        #[allow(dead_code)]
        thinking: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
    cache_creation_input_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
}
