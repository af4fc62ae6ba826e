use std::collections::HashMap;
use std::sync::Arc;

use crate::anthropic::AnthropicAdapter;
use crate::credentials::{resolve, CredentialStore};
use crate::google::GoogleAdapter;
use crate::openai_compat::OpenAiCompatAdapter;
use crate::provider::ProviderAdapter;

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
/// Model namespaces billed through the OpenRouter account rather than their
/// own key (§4.2 credential resolution) — they share one adapter instance
/// keyed under each namespace so `ModelId::parse("qwen/qwen-max")` resolves.
const AGGREGATED_PROVIDERS: &[&str] = &["deepseek", "meta-llama", "mistralai", "qwen", "openrouter"];

fn default_ollama_url() -> String {
    std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434/v1".to_string())
}

/// Built-in provider adapters, keyed by the provider segment of a
/// `"provider/model-id"` string (§4.3). A provider with no resolvable
/// credential is simply absent rather than failing construction — a
/// deployment with only an Anthropic key still gets a working registry.
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn build(credentials: &dyn CredentialStore) -> Self {
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();

        if let Some(key) = resolve(credentials, "anthropic") {
            adapters.insert("anthropic".to_string(), Arc::new(AnthropicAdapter::new(key, None)));
        }
        if let Some(key) = resolve(credentials, "openai") {
            adapters.insert(
                "openai".to_string(),
                Arc::new(OpenAiCompatAdapter::new("openai", "https://api.openai.com/v1", Some(key))),
            );
        }
        if let Some(key) = resolve(credentials, "xai") {
            adapters.insert(
                "xai".to_string(),
                Arc::new(OpenAiCompatAdapter::new("xai", "https://api.x.ai/v1", Some(key))),
            );
        }
        if let Some(key) = resolve(credentials, "google") {
            adapters.insert("google".to_string(), Arc::new(GoogleAdapter::new(key, None)));
        }
        if let Some(key) = resolve(credentials, "openrouter") {
            for provider in AGGREGATED_PROVIDERS {
                adapters.insert(
                    provider.to_string(),
                    Arc::new(OpenAiCompatAdapter::new(*provider, OPENROUTER_BASE_URL, Some(key.clone()))),
                );
            }
        }

        let ollama_url = default_ollama_url();
        adapters.insert("ollama".to_string(), Arc::new(OpenAiCompatAdapter::local(ollama_url.clone())));
        adapters.insert("local".to_string(), Arc::new(OpenAiCompatAdapter::local(ollama_url)));

        Self { adapters }
    }

    /// An empty registry, for tests and other callers that want to inject
    /// adapters directly rather than resolve them from credentials.
    pub fn empty() -> Self {
        Self { adapters: HashMap::new() }
    }

    pub fn insert(&mut self, provider: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider.into(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    /// Fixed cross-provider failover order (§4.7): Anthropic, then xAI, then
    /// Google, skipping whichever one just failed and skipping any provider
    /// this registry has no credential for.
    pub fn failover_candidate(&self, failed_provider: &str) -> Option<(&'static str, Arc<dyn ProviderAdapter>)> {
        const ORDER: &[&str] = &["anthropic", "xai", "google"];
        ORDER
            .iter()
            .find(|candidate| **candidate != failed_provider && self.adapters.contains_key(**candidate))
            .map(|candidate| (*candidate, self.adapters.get(*candidate).expect("checked above").clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    struct MapStore(StdHashMap<String, String>);
    impl CredentialStore for MapStore {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).cloned()
        }
    }

    fn store_with(pairs: &[(&str, &str)]) -> MapStore {
        MapStore(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn missing_credentials_omit_the_provider() {
        let registry = ProviderRegistry::build(&store_with(&[]));
        assert!(registry.get("anthropic").is_none());
        assert!(registry.get("ollama").is_some());
    }

    #[test]
    fn configured_provider_is_retrievable() {
        let registry = ProviderRegistry::build(&store_with(&[("ANTHROPIC_API_KEY", "key")]));
        assert!(registry.get("anthropic").is_some());
    }

    #[test]
    fn aggregated_providers_share_the_openrouter_key() {
        let registry = ProviderRegistry::build(&store_with(&[("OPENROUTER_API_KEY", "or-key")]));
        assert!(registry.get("qwen").is_some());
        assert!(registry.get("deepseek").is_some());
    }

    #[test]
    fn failover_skips_the_failed_provider_and_unconfigured_ones() {
        let registry = ProviderRegistry::build(&store_with(&[
            ("ANTHROPIC_API_KEY", "a"),
            ("XAI_API_KEY", "x"),
        ]));
        let (name, _) = registry.failover_candidate("anthropic").expect("xai configured");
        assert_eq!(name, "xai");
    }

    #[test]
    fn failover_returns_none_when_nothing_else_is_configured() {
        let registry = ProviderRegistry::build(&store_with(&[("ANTHROPIC_API_KEY", "a")]));
        assert!(registry.failover_candidate("anthropic").is_none());
    }
}
