use std::collections::HashSet;

use sha2::{Digest, Sha256};
use skynet_core::{Content, ContentBlock, Message, Role};

/// Drop assistant messages whose only content is empty text, drop `tool_use`
/// blocks with no `input` object, drop orphan `tool_result` blocks (no
/// matching earlier `tool_use`), and drop messages left with no blocks
/// (§4.2 universal repairs). Input is never mutated.
pub fn universal_repairs(messages: &[Message]) -> Vec<Message> {
    let mut seen_tool_use_ids: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        if let Content::Text(text) = &message.content {
            if message.role == Role::Assistant && text.trim().is_empty() {
                continue;
            }
            out.push(message.clone());
            continue;
        }

        let blocks = message.content.blocks();
        let mut kept = Vec::with_capacity(blocks.len());
        for block in blocks {
            match &block {
                ContentBlock::ToolUse { id, input, .. } => {
                    if input.is_null() {
                        continue;
                    }
                    seen_tool_use_ids.insert(id.clone());
                    kept.push(block);
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    if seen_tool_use_ids.contains(tool_use_id) {
                        kept.push(block);
                    }
                }
                ContentBlock::Text { text } if text.trim().is_empty() => {}
                _ => kept.push(block),
            }
        }

        if kept.is_empty() {
            continue;
        }
        out.push(Message::blocks(message.role, kept));
    }

    out
}

/// Anthropic-style shaping: `tool` role becomes a `user` message carrying a
/// `tool_result` block, consecutive `user` messages merge, system messages
/// are lifted out of the list and returned separately.
pub fn shape_anthropic(messages: &[Message]) -> (Vec<Message>, String) {
    let repaired = universal_repairs(messages);
    let mut system_parts = Vec::new();
    let mut reshaped: Vec<Message> = Vec::with_capacity(repaired.len());

    for message in repaired {
        if message.role == Role::System {
            system_parts.push(message.content.flatten_text());
            continue;
        }
        let role = if message.role == Role::Tool { Role::User } else { message.role };
        let normalized = Message::blocks(role, message.content.blocks());
        merge_or_push(&mut reshaped, normalized);
    }

    (reshaped, system_parts.join("\n\n"))
}

/// Google-style shaping: same-role merging across *any* role (not just
/// `user`), a synthetic `user` bootstrap when the first turn would be
/// `model`, and stable alphanumeric remapping of tool call/result ids.
pub fn shape_google(messages: &[Message]) -> Vec<Message> {
    let repaired = universal_repairs(messages);
    let mut reshaped: Vec<Message> = Vec::with_capacity(repaired.len());

    for message in repaired {
        if message.role == Role::System {
            continue; // lifted into systemInstruction by the caller
        }
        let role = if message.role == Role::Tool { Role::User } else { message.role };
        let remapped_blocks: Vec<ContentBlock> = message
            .content
            .blocks()
            .into_iter()
            .map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    ContentBlock::ToolUse { id: remap_id(&id), name, input }
                }
                ContentBlock::ToolResult { tool_use_id, content } => {
                    ContentBlock::ToolResult { tool_use_id: remap_id(&tool_use_id), content }
                }
                other => other,
            })
            .collect();
        merge_same_role_or_push(&mut reshaped, Message::blocks(role, remapped_blocks));
    }

    if matches!(reshaped.first().map(|m| m.role), Some(Role::Assistant)) {
        reshaped.insert(0, Message::text(Role::User, ""));
    }

    reshaped
}

/// OpenAI-compatible shaping: text-only messages collapse to a single
/// `Content::Text`; messages carrying tool calls or tool results keep their
/// block structure so the adapter can build the wire-level `tool_calls`
/// array and `tool` role messages.
pub fn shape_openai_compat(messages: &[Message]) -> Vec<Message> {
    universal_repairs(messages)
        .into_iter()
        .map(|message| {
            let blocks = message.content.blocks();
            let all_text = blocks.iter().all(|b| matches!(b, ContentBlock::Text { .. }));
            if all_text {
                Message::text(message.role, message.content.flatten_text())
            } else {
                message
            }
        })
        .collect()
}

fn merge_or_push(out: &mut Vec<Message>, message: Message) {
    if message.role == Role::User {
        merge_same_role_or_push(out, message);
    } else {
        out.push(message);
    }
}

fn merge_same_role_or_push(out: &mut Vec<Message>, message: Message) {
    if let Some(last) = out.last_mut() {
        if last.role == message.role {
            let mut blocks = last.content.blocks();
            blocks.extend(message.content.blocks());
            *last = Message::blocks(last.role, blocks);
            return;
        }
    }
    out.push(message);
}

/// Alphanumeric ids pass through unchanged so re-sanitizing an already-shaped
/// history is a no-op; anything else gets a stable hash-derived replacement.
fn remap_id(id: &str) -> String {
    if !id.is_empty() && id.len() <= 40 && id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return id.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_empty_assistant_text() {
        let messages = vec![Message::text(Role::Assistant, "   ")];
        assert!(universal_repairs(&messages).is_empty());
    }

    #[test]
    fn drops_orphan_tool_result() {
        let messages = vec![Message::tool_result("call_1", "result text")];
        assert!(universal_repairs(&messages).is_empty());
    }

    #[test]
    fn keeps_tool_result_with_matching_tool_use() {
        let messages = vec![
            Message::blocks(
                Role::Assistant,
                vec![ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "search".into(),
                    input: serde_json::json!({}),
                }],
            ),
            Message::tool_result("call_1", "result text"),
        ];
        let repaired = universal_repairs(&messages);
        assert_eq!(repaired.len(), 2);
    }

    #[test]
    fn drops_tool_use_lacking_input() {
        let messages = vec![Message::blocks(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "search".into(),
                input: serde_json::Value::Null,
            }],
        )];
        assert!(universal_repairs(&messages).is_empty());
    }

    #[test]
    fn anthropic_shaping_merges_consecutive_user_and_lifts_system() {
        let messages = vec![
            Message::text(Role::System, "be nice"),
            Message::text(Role::User, "hi"),
            Message::text(Role::User, "there"),
        ];
        let (shaped, system) = shape_anthropic(&messages);
        assert_eq!(system, "be nice");
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].content.flatten_text(), "hi\nthere");
    }

    #[test]
    fn anthropic_shaping_converts_tool_role_to_user() {
        let messages = vec![
            Message::blocks(
                Role::Assistant,
                vec![ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "search".into(),
                    input: serde_json::json!({}),
                }],
            ),
            Message::tool_result("call_1", "ok"),
        ];
        let (shaped, _) = shape_anthropic(&messages);
        assert_eq!(shaped[1].role, Role::User);
    }

    #[test]
    fn google_shaping_bootstraps_when_first_turn_is_model() {
        let messages = vec![Message::text(Role::Assistant, "hello")];
        let shaped = shape_google(&messages);
        assert_eq!(shaped[0].role, Role::User);
        assert_eq!(shaped[1].role, Role::Assistant);
    }

    #[test]
    fn sanitization_is_idempotent_for_anthropic_shaping() {
        let messages = vec![Message::text(Role::User, "hi"), Message::text(Role::User, "there")];
        let (once, sys1) = shape_anthropic(&messages);
        let (twice, sys2) = shape_anthropic(&once);
        assert_eq!(once, twice);
        assert_eq!(sys1, sys2);
    }

    #[test]
    fn sanitization_is_idempotent_for_google_shaping() {
        let messages = vec![Message::blocks(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "weird id!@#".into(),
                name: "search".into(),
                input: serde_json::json!({}),
            }],
        )];
        let once = shape_google(&messages);
        let twice = shape_google(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn openai_shaping_flattens_text_only_blocks_to_string() {
        let messages = vec![Message::blocks(
            Role::User,
            vec![ContentBlock::text("a"), ContentBlock::text("b")],
        )];
        let shaped = shape_openai_compat(&messages);
        assert!(matches!(shaped[0].content, Content::Text(_)));
    }
}
