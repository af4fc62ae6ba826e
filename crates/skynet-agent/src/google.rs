use async_trait::async_trait;
use serde::Deserialize;
use skynet_core::{ContentBlock, GatewayError, LLMCall, LLMResult, Message, Role, ToolCallRecord, Usage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::ProviderAdapter;
use crate::sse::{parse_sse_line, LineDecoder, SseLine};
use crate::stream::StreamEvent;

pub struct GoogleAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleAdapter {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
        }
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent?key={}", self.base_url, model, self.api_key)
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        )
    }

    /// The URL carries the API key as a query parameter — log a version with
    /// the key masked so it never reaches tracing output in full.
    fn redacted_url(&self, url: &str) -> String {
        url.replace(self.api_key.as_str(), "[REDACTED]")
    }

    async fn error_for_status(&self, resp: reqwest::Response) -> GatewayError {
        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return GatewayError::AuthError {
                provider: self.name().to_string(),
            };
        }
        if status == 429 {
            return GatewayError::RateLimitError {
                provider: self.name().to_string(),
                retry_after_ms: 5_000,
            };
        }
        if status == 503 {
            return GatewayError::OverloadedError {
                provider: self.name().to_string(),
            };
        }
        let text = resp.text().await.unwrap_or_default();
        warn!(status, provider = self.name(), "google API error");
        GatewayError::ProviderSchemaError {
            provider: self.name().to_string(),
            message: format!("HTTP {status}: {}", text.chars().take(300).collect::<String>()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &str {
        "google"
    }

    async fn call(&self, request: &LLMCall) -> Result<LLMResult, GatewayError> {
        let url = self.generate_url(&request.model);
        let body = build_request_body(request);
        debug!(model = %request.model, provider = self.name(), url = %self.redacted_url(&url), "sending request");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
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
            })?;

        if !resp.status().is_success() {
            return Err(self.error_for_status(resp).await);
        }

        let api_resp: GenerateContentResponse = resp.json().await.map_err(|e| GatewayError::ProviderSchemaError {
            provider: self.name().to_string(),
            message: e.to_string(),
        })?;

        Ok(parse_response(request.model.clone(), api_resp))
    }

    async fn stream(&self, request: &LLMCall, tx: mpsc::Sender<StreamEvent>) -> Result<(), GatewayError> {
        let url = self.stream_url(&request.model);
        let body = build_request_body(request);
        debug!(model = %request.model, provider = self.name(), url = %self.redacted_url(&url), "sending streaming request");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError {
                provider: self.name().to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let err = self.error_for_status(resp).await;
            let _ = tx.send(StreamEvent::Error { message: err.to_string() }).await;
            return Err(err);
        }

        process_stream(request.model.clone(), resp, tx).await;
        Ok(())
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::User | Role::Tool | Role::System => "user",
    }
}

fn content_part(block: &ContentBlock, tool_names: &std::collections::HashMap<String, String>) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({ "text": text }),
        ContentBlock::Image { data, media_type } => serde_json::json!({
            "inlineData": { "mimeType": media_type, "data": data },
        }),
        ContentBlock::ToolUse { name, input, .. } => serde_json::json!({
            "functionCall": { "name": name, "args": input },
        }),
        ContentBlock::ToolResult { tool_use_id, content } => {
            let name = tool_names.get(tool_use_id).map(String::as_str).unwrap_or("tool");
            serde_json::json!({
                "functionResponse": { "name": name, "response": { "content": content } },
            })
        }
    }
}

/// Maps every `tool_use` id in the history to the name that produced it, so
/// a later `tool_result` can report its real function name rather than a
/// placeholder (Gemini correlates `functionResponse.name` to the call).
fn tool_use_names(messages: &[Message]) -> std::collections::HashMap<String, String> {
    messages
        .iter()
        .flat_map(|m| m.content.blocks())
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, .. } => Some((id, name)),
            _ => None,
        })
        .collect()
}

fn message_to_google(message: &Message, tool_names: &std::collections::HashMap<String, String>) -> serde_json::Value {
    let parts: Vec<serde_json::Value> = message
        .content
        .blocks()
        .iter()
        .map(|block| content_part(block, tool_names))
        .collect();
    serde_json::json!({ "role": role_str(message.role), "parts": parts })
}

/// Only emit `parameters` when the JSON Schema declares at least one
/// property — Gemini rejects an empty-object schema for zero-arg tools.
fn function_declaration(tool: &skynet_core::ToolSchema) -> serde_json::Value {
    let mut decl = serde_json::json!({ "name": tool.name, "description": tool.description });
    let has_properties = tool
        .parameters
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|o| !o.is_empty())
        .unwrap_or(false);
    if has_properties {
        decl["parameters"] = tool.parameters.clone();
    }
    decl
}

fn build_request_body(req: &LLMCall) -> serde_json::Value {
    let tool_names = tool_use_names(&req.messages);
    let mut contents: Vec<serde_json::Value> =
        req.messages.iter().map(|m| message_to_google(m, &tool_names)).collect();

    // Gemini rejects a conversation that opens on a `model` turn; bootstrap
    // with an empty user turn if sanitization left one at the front.
    if matches!(contents.first().and_then(|c| c["role"].as_str()), Some("model")) {
        contents.insert(0, serde_json::json!({ "role": "user", "parts": [{ "text": "" }] }));
    }

    let mut body = serde_json::json!({
        "contents": contents,
        "generationConfig": { "maxOutputTokens": req.max_tokens },
    });

    if !req.system.is_empty() {
        body["systemInstruction"] = serde_json::json!({
            "parts": [{ "text": req.system.to_plain_text() }],
        });
    }

    if !req.tools.is_empty() {
        let declarations: Vec<serde_json::Value> = req.tools.iter().map(function_declaration).collect();
        body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
    }

    body
}

fn parse_response(model: String, resp: GenerateContentResponse) -> LLMResult {
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    if let Some(candidate) = resp.candidates.into_iter().next() {
        for (i, part) in candidate.content.parts.into_iter().enumerate() {
            if let Some(text) = part.text {
                content.push_str(&text);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCallRecord {
                    id: format!("{}-{}", call.name, i),
                    name: call.name,
                    arguments: call.args,
                });
            }
        }
    }

    let usage = resp.usage_metadata.map(|u| Usage {
        input: u.prompt_token_count,
        output: u.candidates_token_count,
        cache_creation: 0,
        cache_read: u.cached_content_token_count.unwrap_or(0),
    });

    LLMResult {
        content,
        tool_calls,
        usage: usage.unwrap_or_default(),
        model,
        cached: false,
    }
}

async fn process_stream(model: String, resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut decoder = LineDecoder::new();
    let mut usage = Usage::default();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                return;
            }
        };

        for line in decoder.feed(&chunk) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let data = match parse_sse_line(line) {
                SseLine::Data(d) => d,
                _ => continue,
            };
            let chunk_resp: GenerateContentResponse = match serde_json::from_str(&data) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "failed to parse google stream chunk");
                    continue;
                }
            };
            if let Some(u) = &chunk_resp.usage_metadata {
                usage.input = u.prompt_token_count;
                usage.output = u.candidates_token_count;
            }
            if let Some(candidate) = chunk_resp.candidates.into_iter().next() {
                for (i, part) in candidate.content.parts.into_iter().enumerate() {
                    if let Some(text) = part.text {
                        if tx.send(StreamEvent::TextDelta { text }).await.is_err() {
                            return;
                        }
                    }
                    if let Some(call) = part.function_call {
                        let record = ToolCallRecord {
                            id: format!("{}-{}", call.name, i),
                            name: call.name,
                            arguments: call.args,
                        };
                        if tx.send(StreamEvent::ToolUseEnd { call: record }).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::MessageEnd {
            result: LLMResult {
                content: String::new(),
                tool_calls: Vec::new(),
                usage,
                model,
                cached: false,
            },
        })
        .await;
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "cachedContentTokenCount")]
    cached_content_token_count: Option<u32>,
}
