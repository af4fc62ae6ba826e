use crate::openai_compat::LOCAL_SENTINEL;

/// Read-only secret lookup, injected by the composition root. The vault or
/// secret store backing it is outside this crate's scope (§6) — this trait
/// is the only seam the dispatcher sees.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Default store reading directly from process environment variables.
/// A reasonable default for a standalone deployment; swap in a real
/// vault-backed store at the composition root for anything more sensitive.
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Providers that ride on an aggregator account rather than their own key.
const OPENROUTER_PROVIDERS: &[&str] = &["deepseek", "meta-llama", "mistralai", "qwen"];

fn is_local_provider(provider: &str) -> bool {
    matches!(provider, "local" | "ollama")
}

/// `resolve(provider) → key | nil`. Never panics on a missing key — callers
/// translate `None` into a user-visible "not configured" error.
pub fn resolve(store: &dyn CredentialStore, provider: &str) -> Option<String> {
    if is_local_provider(provider) {
        return Some(LOCAL_SENTINEL.to_string());
    }
    if OPENROUTER_PROVIDERS.contains(&provider) {
        return store.get("OPENROUTER_API_KEY");
    }
    if provider == "google" {
        return store.get("GOOGLE_API_KEY").or_else(|| store.get("GEMINI_API_KEY"));
    }
    store.get(&format!("{}_API_KEY", provider.to_uppercase()))
}
