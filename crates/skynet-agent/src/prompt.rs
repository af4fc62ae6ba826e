//! Cache-tiered system prompt builder.
//!
//! The tier data itself is provider-neutral and lives in `skynet_core`; this
//! module re-exports it for the adapters that consume it, and
//! [`anthropic`](crate::anthropic) is where the tiers get shaped into
//! `cache_control`-tagged content blocks.
pub use skynet_core::SystemPrompt;
