use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use skynet_core::{Message, Role};

struct CacheEntry {
    text: String,
    created_at: Instant,
}

/// Fingerprint-keyed cache for tool-free completions, backed by a
/// `dashmap::DashMap` for the concurrent map itself (§4.4). Applied only
/// when a call has no tools; cache hits bypass provider I/O entirely.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    fingerprint_messages: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, fingerprint_messages: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            fingerprint_messages,
        }
    }

    pub fn get(&self, model: &str, messages: &[Message]) -> Option<String> {
        let key = fingerprint(model, messages, self.fingerprint_messages);
        let entry = self.entries.get(&key)?;
        if entry.created_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.text.clone())
    }

    pub fn put(&self, model: &str, messages: &[Message], text: String) {
        let key = fingerprint(model, messages, self.fingerprint_messages);
        self.entries.insert(
            key,
            CacheEntry {
                text,
                created_at: Instant::now(),
            },
        );
    }
}

/// `hash(model-id || canonical(last-N user/assistant messages))`. Role and
/// flattened text are joined with a stable separator before hashing, rather
/// than round-tripped through `serde_json::Value`, so fingerprints are
/// insensitive to incidental JSON whitespace differences.
fn fingerprint(model: &str, messages: &[Message], n: usize) -> String {
    let tail: Vec<&Message> = messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .rev()
        .take(n)
        .collect();

    let mut canonical = String::new();
    for message in tail.into_iter().rev() {
        canonical.push_str(message.role.as_str());
        canonical.push('\x1f');
        canonical.push_str(&message.content.flatten_text());
        canonical.push('\x1e');
    }

    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
