use std::time::{Duration, Instant};

use skynet_core::{GatewayConfig, GatewayError, LLMCall, LLMResult, ModelId};

use crate::cache::ResponseCache;
use crate::cost_meter::CostMeter;
use crate::credentials::CredentialStore;
use crate::metrics::MetricsRegistry;
use crate::provider::ProviderAdapter;
use crate::registry::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::sanitizer::{shape_anthropic, shape_google, shape_openai_compat};

/// Central entry point tying cache, cost cap, sanitization, provider
/// adapters, retry, and cross-provider failover together into one call
/// (§4.4–§4.7). Constructed once at the composition root and shared behind
/// an `Arc` — never a module-level singleton (§9).
pub struct Dispatcher {
    registry: ProviderRegistry,
    retry_policy: RetryPolicy,
    cost_meter: CostMeter,
    cache: ResponseCache,
    metrics: MetricsRegistry,
    default_model: String,
    fallback_models: std::collections::HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(config: &GatewayConfig, credentials: &dyn CredentialStore) -> Self {
        Self::with_registry(config, ProviderRegistry::build(credentials))
    }

    /// Construct with an already-built registry — the seam tests use to
    /// inject mock adapters without touching real credentials or network.
    pub fn with_registry(config: &GatewayConfig, registry: ProviderRegistry) -> Self {
        Self {
            registry,
            retry_policy: RetryPolicy::from(config),
            cost_meter: CostMeter::new(config),
            cache: ResponseCache::new(
                Duration::from_secs(config.cache_ttl_secs),
                config.cache_fingerprint_messages,
            ),
            metrics: MetricsRegistry::new(),
            default_model: config.default_model.clone(),
            fallback_models: config.fallback_models.clone(),
        }
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn cost_meter(&self) -> &CostMeter {
        &self.cost_meter
    }

    /// Dispatch one call. Never mutates `call` (testable property 3) — a
    /// resolved, sanitized copy is built internally.
    pub async fn dispatch(&self, call: LLMCall) -> Result<LLMResult, GatewayError> {
        let model_id = resolve_model(&call.model, &self.default_model);
        let mut resolved = call;
        resolved.model = format!("{}/{}", model_id.provider, model_id.model_id);

        if resolved.tools.is_empty() {
            if let Some(text) = self.cache.get(&resolved.model, &resolved.messages) {
                self.metrics.record_call(&model_id.provider, &model_id.model_id, "cache_hit");
                return Ok(LLMResult {
                    content: text,
                    tool_calls: Vec::new(),
                    usage: skynet_core::Usage::default(),
                    model: resolved.model.clone(),
                    cached: true,
                });
            }
        }

        // §8 property 8: a call that would push spend over the cap is
        // refused before any network I/O.
        self.cost_meter.check()?;

        let adapter = self
            .registry
            .get(&model_id.provider)
            .ok_or_else(|| GatewayError::AuthError { provider: model_id.provider.clone() })?;

        let sanitized = sanitize_for(&model_id.provider, &resolved);
        let started = Instant::now();

        match self.call_with_retry(adapter.as_ref(), &sanitized).await {
            Ok(result) => {
                self.record_success(&model_id.provider, &resolved, &result, started);
                Ok(result)
            }
            Err(error) => {
                self.metrics.record_error(&model_id.provider, error.code());
                if error.is_immediately_terminal() {
                    return Err(error);
                }
                self.try_failover(&model_id.provider, &resolved, error).await
            }
        }
    }

    async fn call_with_retry(
        &self,
        adapter: &dyn ProviderAdapter,
        call: &LLMCall,
    ) -> Result<LLMResult, GatewayError> {
        self.retry_policy.run_async(|| adapter.call(call)).await
    }

    /// Cross-provider failover — at most one hop, fixed preference order
    /// (§4.7, §8 property 7). Re-sanitizes for the fallback provider's
    /// shape since Anthropic, Google, and OpenAI-compatible adapters each
    /// expect a different message shape.
    async fn try_failover(
        &self,
        failed_provider: &str,
        original: &LLMCall,
        original_error: GatewayError,
    ) -> Result<LLMResult, GatewayError> {
        let Some((fallback_provider, fallback_adapter)) = self.registry.failover_candidate(failed_provider) else {
            return Err(original_error);
        };
        let Some(fallback_model) = self.fallback_models.get(fallback_provider) else {
            return Err(original_error);
        };

        let mut fallback_call = original.clone();
        fallback_call.model = format!("{fallback_provider}/{fallback_model}");
        let sanitized = sanitize_for(fallback_provider, &fallback_call);

        let started = Instant::now();
        match self.call_with_retry(fallback_adapter.as_ref(), &sanitized).await {
            Ok(result) => {
                self.record_success(fallback_provider, &fallback_call, &result, started);
                Ok(result)
            }
            Err(fallback_error) => {
                self.metrics.record_error(fallback_provider, fallback_error.code());
                Err(fallback_error)
            }
        }
    }

    fn record_success(&self, provider: &str, original_call: &LLMCall, result: &LLMResult, started: Instant) {
        self.cost_meter.record(&result.model, &result.usage);
        self.metrics.record_call(provider, &result.model, "ok");
        self.metrics.observe_duration(provider, started.elapsed().as_secs_f64());
        self.metrics.record_tokens(provider, "input", result.usage.input as u64);
        self.metrics.record_tokens(provider, "output", result.usage.output as u64);
        self.metrics.record_tokens(provider, "cache_creation", result.usage.cache_creation as u64);
        self.metrics.record_tokens(provider, "cache_read", result.usage.cache_read as u64);

        // §8 property 5: the cache is only ever populated for tool-free calls.
        if original_call.tools.is_empty() && result.tool_calls.is_empty() {
            self.cache.put(&original_call.model, &original_call.messages, result.content.clone());
        }
    }
}

fn resolve_model(model: &str, default_model: &str) -> ModelId {
    let parsed = ModelId::parse(model);
    if parsed.provider.is_empty() {
        ModelId::parse(default_model)
    } else {
        parsed
    }
}

/// Shape a call's message history for the target provider's wire protocol
/// (§4.2). Anthropic's extraction of system-role messages out of the
/// history is folded into the call's volatile system tier rather than
/// discarded.
fn sanitize_for(provider: &str, call: &LLMCall) -> LLMCall {
    let mut shaped = call.clone();
    match provider {
        "anthropic" => {
            let (messages, extracted_system) = shape_anthropic(&call.messages);
            shaped.messages = messages;
            if !extracted_system.is_empty() {
                let mut system = call.system.clone();
                system.volatile_tier = if system.volatile_tier.is_empty() {
                    extracted_system
                } else {
                    format!("{}\n\n{}", system.volatile_tier, extracted_system)
                };
                shaped.system = system;
            }
        }
        "google" => {
            shaped.messages = shape_google(&call.messages);
        }
        _ => {
            shaped.messages = shape_openai_compat(&call.messages);
        }
    }
    shaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skynet_core::{Message, Role, Usage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn call(model: &str, text: &str) -> LLMCall {
        LLMCall::new(model, vec![Message::text(Role::User, text)])
    }

    struct ScriptedAdapter {
        name: &'static str,
        fail_times: u32,
        calls: AtomicU32,
    }

    impl ScriptedAdapter {
        fn always_ok(name: &'static str) -> Self {
            Self { name, fail_times: 0, calls: AtomicU32::new(0) }
        }

        fn fails_then_succeeds(name: &'static str, fail_times: u32) -> Self {
            Self { name, fail_times, calls: AtomicU32::new(0) }
        }

        fn always_fails(name: &'static str) -> Self {
            Self { name, fail_times: u32::MAX, calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            self.name
        }

        async fn call(&self, request: &LLMCall) -> Result<LLMResult, GatewayError> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                return Err(GatewayError::TimeoutError { provider: self.name.to_string() });
            }
            Ok(LLMResult {
                content: format!("reply from {}", self.name),
                tool_calls: Vec::new(),
                usage: Usage { input: 1, output: 1, cache_creation: 0, cache_read: 0 },
                model: request.model.clone(),
                cached: false,
            })
        }
    }

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.retry_max_attempts = 3;
        config.retry_base_delay_secs = 0.0;
        config.retry_max_delay_secs = 0.0;
        config.overloaded_wait_secs = 0.0;
        config.retry_jitter_factor = 0.0;
        config
    }

    #[tokio::test]
    async fn cache_hit_returns_without_network_io_and_zero_usage() {
        let config = test_config();
        let dispatcher = Dispatcher::with_registry(&config, ProviderRegistry::empty());

        let model = "anthropic/claude-sonnet-4-6";
        dispatcher.cache.put(model, &call(model, "hello").messages, "hi".to_string());

        let result = dispatcher.dispatch(call(model, "hello")).await.expect("cache hit");
        assert!(result.cached);
        assert_eq!(result.content, "hi");
        assert_eq!(result.usage.input, 0);
        assert_eq!(result.usage.output, 0);
    }

    #[tokio::test]
    async fn cost_cap_refuses_before_any_adapter_call() {
        let mut config = test_config();
        config.cost_cap_usd = 0.0;
        let dispatcher = Dispatcher::with_registry(&config, ProviderRegistry::empty());

        let err = dispatcher.dispatch(call("anthropic/claude-sonnet-4-6", "hi")).await.unwrap_err();
        assert_eq!(err.code(), "COST_CAP_EXCEEDED");
    }

    #[tokio::test]
    async fn unconfigured_provider_yields_auth_error() {
        let config = test_config();
        let dispatcher = Dispatcher::with_registry(&config, ProviderRegistry::empty());
        let err = dispatcher
            .dispatch(call("nonexistent-provider/some-model", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_ERROR");
    }

    #[tokio::test]
    async fn transient_error_is_retried_then_succeeds() {
        let config = test_config();
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(ScriptedAdapter::fails_then_succeeds("anthropic", 1)));
        let dispatcher = Dispatcher::with_registry(&config, registry);

        let result = dispatcher.dispatch(call("anthropic/claude-sonnet-4-6", "hi")).await.expect("retried ok");
        assert_eq!(result.content, "reply from anthropic");
    }

    #[tokio::test]
    async fn terminal_error_on_primary_fails_over_to_xai() {
        let config = test_config();
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(ScriptedAdapter::always_fails("anthropic")));
        registry.insert("xai", Arc::new(ScriptedAdapter::always_ok("xai")));
        let dispatcher = Dispatcher::with_registry(&config, registry);

        let result = dispatcher
            .dispatch(call("anthropic/claude-sonnet-4-6", "hi"))
            .await
            .expect("fails over to xai");
        assert_eq!(result.model, "xai/grok-2-latest");
    }

    #[tokio::test]
    async fn immediately_terminal_errors_never_trigger_failover() {
        let config = test_config();
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(AlwaysAuthFails));
        registry.insert("xai", Arc::new(ScriptedAdapter::always_ok("xai")));
        let dispatcher = Dispatcher::with_registry(&config, registry);

        let err = dispatcher.dispatch(call("anthropic/claude-sonnet-4-6", "hi")).await.unwrap_err();
        assert_eq!(err.code(), "AUTH_ERROR");
    }

    struct AlwaysAuthFails;
    #[async_trait]
    impl ProviderAdapter for AlwaysAuthFails {
        fn name(&self) -> &str {
            "anthropic"
        }
        async fn call(&self, _request: &LLMCall) -> Result<LLMResult, GatewayError> {
            Err(GatewayError::AuthError { provider: "anthropic".to_string() })
        }
    }

    #[test]
    fn sanitize_for_anthropic_folds_extracted_system_into_volatile_tier() {
        let mut req = call("anthropic/claude-sonnet-4-6", "hi");
        req.messages.insert(0, Message::text(Role::System, "be nice"));
        let shaped = sanitize_for("anthropic", &req);
        assert_eq!(shaped.system.volatile_tier, "be nice");
        assert!(shaped.messages.iter().all(|m| m.role != Role::System));
    }

    #[test]
    fn resolve_model_falls_back_to_default_when_no_provider_prefix() {
        let resolved = resolve_model("claude-sonnet-4-6", "anthropic/claude-sonnet-4-6");
        assert_eq!(resolved.provider, "anthropic");
    }
}
