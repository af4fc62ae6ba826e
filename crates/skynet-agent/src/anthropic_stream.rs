use serde::Deserialize;
use skynet_core::{LLMResult, ToolCallRecord, Usage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sse::{parse_sse_line, LineDecoder, SseLine};
use crate::stream::StreamEvent;

/// Parse an Anthropic streaming response and emit `StreamEvent`s, buffering
/// across chunk boundaries so a split UTF-8 sequence or a split SSE line
/// never gets silently dropped.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut current_event = String::new();
    // Content block type from `content_block_start` ("text"/"thinking"/"tool_use").
    let mut current_block_type = String::new();
    let mut tool_use_id = String::new();
    let mut tool_use_name = String::new();
    let mut tool_use_input_json = String::new();
    let mut model = String::new();
    let mut usage = Usage::default();
    let mut decoder = LineDecoder::new();

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

            match parse_sse_line(line) {
                SseLine::Event(ev) => current_event = ev,
                SseLine::Data(data) => {
                    let events = parse_data_block(
                        &current_event,
                        &data,
                        &mut current_block_type,
                        &mut tool_use_id,
                        &mut tool_use_name,
                        &mut tool_use_input_json,
                        &mut model,
                        &mut usage,
                    );
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
                SseLine::Other => {}
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

#[allow(clippy::too_many_arguments)]
fn parse_data_block(
    event_type: &str,
    data: &str,
    current_block_type: &mut String,
    tool_use_id: &mut String,
    tool_use_name: &mut String,
    tool_use_input_json: &mut String,
    model: &mut String,
    usage: &mut Usage,
) -> Vec<StreamEvent> {
    match event_type {
        "message_start" => {
            if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                *model = msg.message.model;
                usage.input = msg.message.usage.input_tokens;
                usage.cache_creation = msg.message.usage.cache_creation_input_tokens.unwrap_or(0);
                usage.cache_read = msg.message.usage.cache_read_input_tokens.unwrap_or(0);
            }
            Vec::new()
        }

        "content_block_start" => {
            if let Ok(block_start) = serde_json::from_str::<ContentBlockStart>(data) {
                *current_block_type = block_start.content_block.block_type.clone();
                if block_start.content_block.block_type == "tool_use" {
                    *tool_use_id = block_start.content_block.id.unwrap_or_default();
                    *tool_use_name = block_start.content_block.name.unwrap_or_default();
                    tool_use_input_json.clear();
                    return vec![StreamEvent::ToolUseStart {
                        id: tool_use_id.clone(),
                        name: tool_use_name.clone(),
                    }];
                }
            }
            Vec::new()
        }

        "content_block_delta" => {
            if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                match delta.delta.delta_type.as_str() {
                    "text_delta" => {
                        if let Some(text) = delta.delta.text {
                            debug!(len = text.len(), "stream text delta");
                            return vec![StreamEvent::TextDelta { text }];
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.delta.thinking {
                            debug!(len = text.len(), "stream thinking delta");
                            return vec![StreamEvent::ThinkingDelta { text }];
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.delta.partial_json {
                            tool_use_input_json.push_str(&partial);
                            return vec![StreamEvent::ToolUseDelta {
                                id: tool_use_id.clone(),
                                partial_json: partial,
                            }];
                        }
                    }
                    other => debug!(delta_type = other, "unhandled delta type"),
                }
            }
            Vec::new()
        }

        "content_block_stop" => {
            if current_block_type == "tool_use" {
                let input = serde_json::from_str::<serde_json::Value>(tool_use_input_json.as_str())
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                let call = ToolCallRecord {
                    id: std::mem::take(tool_use_id),
                    name: std::mem::take(tool_use_name),
                    arguments: input,
                };
                tool_use_input_json.clear();
                current_block_type.clear();
                return vec![StreamEvent::ToolUseEnd { call }];
            }
            current_block_type.clear();
            Vec::new()
        }

        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                usage.output = delta.usage.output_tokens;
            }
            Vec::new()
        }

        "error" => {
            warn!(data, "anthropic stream error");
            vec![StreamEvent::Error { message: data.to_string() }]
        }

        // message_stop and unrecognized events need no action.
        _ => Vec::new(),
    }
}

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
    cache_creation_input_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}
