use skynet_core::{Message, Role};

use crate::sanitizer::universal_repairs;

/// Which stage overflow recovery stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Estimated tokens already fit; history returned unchanged.
    NoOp,
    /// Oldest user+assistant pairs dropped from the front.
    DropOldestPairs,
    /// Only the system message(s) and the last `K` pairs survive.
    Critical,
}

#[derive(Debug, Clone)]
pub struct OverflowStats {
    pub stage: Stage,
    pub pairs_dropped: usize,
    pub tokens_after: u32,
}

/// `chars/4` for ASCII-heavy text, `chars/2` for CJK-heavy text, summed
/// across all messages — a cheap proxy, not a real tokenizer (§4.8).
pub fn estimate_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(|m| estimate_message_tokens(m)).sum()
}

fn estimate_message_tokens(message: &Message) -> u32 {
    let text = message.content.flatten_text();
    if text.is_empty() {
        return 0;
    }
    let total_chars = text.chars().count();
    let cjk_chars = text.chars().filter(|c| is_cjk(*c)).count();
    let cjk_ratio = cjk_chars as f64 / total_chars as f64;
    let divisor = if cjk_ratio > 0.3 { 2.0 } else { 4.0 };
    ((total_chars as f64) / divisor).ceil() as u32
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0xAC00..=0xD7A3)
}

/// A contiguous `user` turn followed by the next `assistant` turn, the unit
/// Stage B/C drop or retain as a pair.
fn pair_boundaries(messages: &[Message]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        if messages[i].role == Role::User {
            let mut end = i;
            // A "pair" spans the user turn through to (but not including)
            // the next user turn, so any tool round-trips in between stay
            // attached to the assistant side of the same pair.
            let mut j = i + 1;
            while j < messages.len() && messages[j].role != Role::User {
                end = j;
                j += 1;
            }
            pairs.push((i, end));
            i = j;
        } else {
            i += 1;
        }
    }
    pairs
}

/// Stage A/B/C context-window recovery. Never mutates `messages`; always
/// returns exactly one system message in the result (never zero, never
/// duplicated).
pub fn recover(messages: &[Message], window: u32, stage_b_factor: f64, stage_c_pairs: usize) -> (Vec<Message>, OverflowStats) {
    let tokens = estimate_tokens(messages);
    if tokens <= window {
        return (
            messages.to_vec(),
            OverflowStats {
                stage: Stage::NoOp,
                pairs_dropped: 0,
                tokens_after: tokens,
            },
        );
    }

    let system: Vec<Message> = messages.iter().filter(|m| m.role == Role::System).cloned().collect();
    let system = if system.is_empty() {
        vec![Message::text(Role::System, "")]
    } else {
        vec![Message::text(Role::System, system.iter().map(|m| m.content.flatten_text()).collect::<Vec<_>>().join("\n\n"))]
    };
    let rest: Vec<Message> = messages.iter().filter(|m| m.role != Role::System).cloned().collect();

    // Stage B: drop oldest pairs, never touching the most recent K.
    let target = (window as f64 * stage_b_factor).floor() as u32;
    let pairs = pair_boundaries(&rest);
    let mut dropped = 0;
    let mut start_pair = 0;
    while start_pair < pairs.len().saturating_sub(stage_c_pairs) {
        let candidate_start = pairs[start_pair + 1].0;
        let candidate: Vec<Message> = rest[candidate_start..].to_vec();
        let candidate_tokens = estimate_tokens(&system) + estimate_tokens(&candidate);
        dropped += 1;
        start_pair += 1;
        if candidate_tokens <= target {
            let repaired = universal_repairs(&[system.clone(), candidate].concat());
            let tokens_after = estimate_tokens(&repaired);
            return (
                repaired,
                OverflowStats {
                    stage: Stage::DropOldestPairs,
                    pairs_dropped: dropped,
                    tokens_after,
                },
            );
        }
    }

    // Stage C: retain only system + last K pairs.
    let retain_from_pair = pairs.len().saturating_sub(stage_c_pairs);
    let retained_start = pairs.get(retain_from_pair).map(|(s, _)| *s).unwrap_or(rest.len());
    let retained: Vec<Message> = rest[retained_start..].to_vec();
    let final_list = universal_repairs(&[system, retained].concat());
    let tokens_after = estimate_tokens(&final_list);
    (
        final_list,
        OverflowStats {
            stage: Stage::Critical,
            pairs_dropped: pairs.len().saturating_sub(retain_from_pair.min(pairs.len())).max(dropped),
            tokens_after,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(i: usize) -> Vec<Message> {
        vec![
            Message::text(Role::User, format!("user turn {i} ").repeat(40)),
            Message::text(Role::Assistant, format!("assistant turn {i} ").repeat(40)),
        ]
    }

    #[test]
    fn stage_a_is_noop_when_under_window() {
        let messages = vec![Message::text(Role::System, "rules"), Message::text(Role::User, "hi")];
        let (result, stats) = recover(&messages, 10_000, 0.85, 8);
        assert_eq!(stats.stage, Stage::NoOp);
        assert_eq!(result.len(), messages.len());
    }

    #[test]
    fn stage_b_drops_oldest_pairs_and_keeps_one_system_message() {
        let mut messages = vec![Message::text(Role::System, "rules")];
        for i in 0..20 {
            messages.extend(pair(i));
        }
        let (result, stats) = recover(&messages, 2_000, 0.85, 8);
        assert_eq!(stats.stage, Stage::DropOldestPairs);
        assert!(stats.pairs_dropped >= 1);
        assert_eq!(result.iter().filter(|m| m.role == Role::System).count(), 1);
        assert!(stats.tokens_after <= 1_700);
    }

    #[test]
    fn stage_c_retains_only_last_k_pairs() {
        let mut messages = vec![Message::text(Role::System, "rules")];
        for i in 0..50 {
            messages.extend(pair(i));
        }
        let (result, stats) = recover(&messages, 50, 0.85, 8);
        assert_eq!(stats.stage, Stage::Critical);
        assert_eq!(result.iter().filter(|m| m.role == Role::System).count(), 1);
    }

    #[test]
    fn recovery_never_mutates_input() {
        let mut messages = vec![Message::text(Role::System, "rules")];
        for i in 0..20 {
            messages.extend(pair(i));
        }
        let original_len = messages.len();
        let _ = recover(&messages, 2_000, 0.85, 8);
        assert_eq!(messages.len(), original_len);
    }
}
