//! Agentic tool-calling loop (§4.9) — the core's largest single component.
//!
//! Flow: classify intent → dispatch → if tool-use, execute tools in parallel
//! and re-dispatch → repeat until final text, loop detection, a circuit
//! break, or the iteration cap. Cancellation-aware throughout.

use std::collections::HashMap;

use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use skynet_core::{
    ContentBlock, GatewayConfig, GatewayError, LLMCall, Message, Role, Session, SystemPrompt,
    ERROR_SENTINEL,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::intent::{Classification, IntentClassifier, ToolRegistry};
use crate::overflow;

use super::Tool;

/// What a completed run produced. A loop-detected / circuit-break /
/// iteration-cap termination is a normal, user-displayable outcome (§7),
/// not a propagated error — only `Cancelled` needs to be told apart from
/// ordinary text by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolLoopOutcome {
    Text(String),
    Cancelled,
}

impl ToolLoopOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            ToolLoopOutcome::Text(t) => Some(t),
            ToolLoopOutcome::Cancelled => None,
        }
    }
}

/// Ties a dispatcher and a tool set together for one call to [`run`]. Built
/// fresh per turn at the composition root — never a module-level singleton
/// (§9, §2.12).
pub struct ToolLoop<'a> {
    dispatcher: &'a Dispatcher,
    tools: &'a [Box<dyn Tool>],
    config: &'a GatewayConfig,
}

impl<'a> ToolLoop<'a> {
    pub fn new(dispatcher: &'a Dispatcher, tools: &'a [Box<dyn Tool>], config: &'a GatewayConfig) -> Self {
        Self { dispatcher, tools, config }
    }

    /// `run(session, user_input, cancel) → final_text` (§4.9).
    ///
    /// `model` and `system` come from the caller's already-resolved session
    /// and prompt-builder context; this function only drives the loop.
    pub async fn run(
        &self,
        session: &mut Session,
        model: &str,
        system: &SystemPrompt,
        user_input: &str,
        cancel: &CancellationToken,
        on_tool: Option<&(dyn Fn(&str, &serde_json::Value) + Send + Sync)>,
        on_status: Option<&(dyn Fn(&str, &str) + Send + Sync)>,
    ) -> Result<ToolLoopOutcome, GatewayError> {
        session.append(Message::text(Role::User, user_input));

        let registry = ToolsAsRegistry(self.tools);
        let classifier = IntentClassifier::new(&registry, self.config.intent_max_tokens);
        let Classification { tools: schemas, max_tokens, thinking_level, .. } =
            classifier.classify(user_input, session.messages.len());
        let thinking = (thinking_level != skynet_core::ThinkingLevel::Off).then_some(thinking_level);

        let mut signature_window: Vec<String> = Vec::with_capacity(self.config.loop_window);
        let mut last_partial_text: Option<String> = None;

        for iteration in 0..self.config.tool_loop_max_iterations {
            if cancel.is_cancelled() {
                return Ok(ToolLoopOutcome::Cancelled);
            }

            if let Some(cb) = on_status {
                cb("typing", "");
            }

            let call = LLMCall {
                model: model.to_string(),
                messages: session.messages.clone(),
                system: system.clone(),
                tools: schemas.clone(),
                max_tokens,
                thinking,
                thinking_supported: thinking.is_some(),
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ToolLoopOutcome::Cancelled),
                result = self.dispatcher.dispatch(call.clone()) => result,
            };

            let result = match result {
                Ok(result) => result,
                Err(GatewayError::TokenOverflowError { .. }) => {
                    // §4.9b: recover once, then retry this same iteration.
                    let (recovered, stats) = overflow::recover(
                        &session.messages,
                        self.config.compaction_threshold,
                        self.config.overflow_stage_b_factor,
                        self.config.overflow_stage_c_pairs,
                    );
                    info!(
                        stage = ?stats.stage,
                        pairs_dropped = stats.pairs_dropped,
                        tokens_after = stats.tokens_after,
                        "recovered from context overflow"
                    );
                    session.messages = recovered;
                    if let Some(cb) = on_status {
                        cb("recovering", &format!("stage {:?}", stats.stage));
                    }
                    let retry_call = LLMCall { messages: session.messages.clone(), ..call };
                    self.dispatcher.dispatch(retry_call).await?
                }
                Err(other) => return Err(other),
            };

            if !result.has_tool_calls() {
                session.append(Message::text(Role::Assistant, result.content.clone()));
                return Ok(ToolLoopOutcome::Text(result.content));
            }

            if !result.content.is_empty() {
                last_partial_text = Some(result.content.clone());
            }

            let mut assistant_blocks = Vec::with_capacity(result.tool_calls.len() + 1);
            if !result.content.is_empty() {
                assistant_blocks.push(ContentBlock::text(result.content.clone()));
            }
            for tool_call in &result.tool_calls {
                assistant_blocks.push(ContentBlock::ToolUse {
                    id: tool_call.id.clone(),
                    name: tool_call.name.clone(),
                    input: tool_call.arguments.clone(),
                });
            }
            session.append(Message::blocks(Role::Assistant, assistant_blocks));

            if let Some(cb) = on_status {
                cb("tool_running", "");
            }
            for tool_call in &result.tool_calls {
                if let Some(cb) = on_tool {
                    cb(&tool_call.name, &tool_call.arguments);
                }
                signature_window.push(signature(&tool_call.name, &tool_call.arguments));
                if signature_window.len() > self.config.loop_window {
                    signature_window.remove(0);
                }
            }
            if has_repeated_signature(&signature_window, self.config.loop_threshold) {
                warn!(iteration, "tool loop detected — repeated tool signature");
                let message =
                    format!("{ERROR_SENTINEL} I seem to be stuck repeating the same action, so I stopped.");
                session.append(Message::text(Role::Assistant, message.clone()));
                return Ok(ToolLoopOutcome::Text(message));
            }

            let tool_results = self.execute_tools(&result.tool_calls, cancel).await;
            if cancel.is_cancelled() {
                return Ok(ToolLoopOutcome::Cancelled);
            }

            let error_count =
                tool_results.iter().filter(|(_, content)| content.starts_with(ERROR_SENTINEL)).count();

            let result_blocks: Vec<ContentBlock> = tool_results
                .into_iter()
                .map(|(id, content)| ContentBlock::ToolResult { tool_use_id: id, content })
                .collect();
            session.append(Message::blocks(Role::Tool, result_blocks));

            if error_count >= self.config.circuit_breaker_errors {
                warn!(iteration, error_count, "tool loop circuit breaker tripped");
                let message = format!("{ERROR_SENTINEL} too many tool errors in a row, so I stopped.");
                session.append(Message::text(Role::Assistant, message.clone()));
                return Ok(ToolLoopOutcome::Text(message));
            }
        }

        warn!(max_iterations = self.config.tool_loop_max_iterations, "tool loop hit the iteration cap");
        let message = match last_partial_text {
            Some(partial) => {
                format!("{ERROR_SENTINEL} I ran out of steps before finishing. Here's what I had so far:\n\n{partial}")
            }
            None => format!("{ERROR_SENTINEL} I ran out of steps before finishing."),
        };
        session.append(Message::text(Role::Assistant, message.clone()));
        Ok(ToolLoopOutcome::Text(message))
    }

    /// Execute every tool call concurrently, bounded by `tool_fanout_max`
    /// (§4.9e, §5). Results come back reordered by completion time but are
    /// re-sorted to the original call order before returning, so the
    /// tool-result blocks line up with their `tool_use` ids deterministically.
    async fn execute_tools(
        &self,
        calls: &[skynet_core::ToolCallRecord],
        cancel: &CancellationToken,
    ) -> Vec<(String, String)> {
        let fanout = self.config.tool_fanout_max.max(1);
        let tools = self.tools;

        let indexed: Vec<(usize, String, String, serde_json::Value)> = calls
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.id.clone(), c.name.clone(), c.arguments.clone()))
            .collect();

        let mut completed: Vec<(usize, String, String)> = stream::iter(indexed)
            .map(|(index, id, name, arguments)| {
                let cancel = cancel.clone();
                async move {
                    let content = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            format!("{ERROR_SENTINEL} cancelled before this tool ran")
                        }
                        result = execute_one(tools, &name, arguments) => result,
                    };
                    (index, id, content)
                }
            })
            .buffer_unordered(fanout)
            .collect()
            .await;

        completed.sort_by_key(|(index, _, _)| *index);
        completed.into_iter().map(|(_, id, content)| (id, content)).collect()
    }
}

async fn execute_one(tools: &[Box<dyn Tool>], name: &str, arguments: serde_json::Value) -> String {
    match tools.iter().find(|t| t.name() == name) {
        Some(tool) => {
            debug!(tool = name, "executing tool");
            tool.execute(arguments).await.content
        }
        None => format!("{ERROR_SENTINEL} unknown tool '{name}'"),
    }
}

/// Stable `(tool_name, first 8 hex chars of a sorted-key hash of arguments)`
/// signature. The source hashes with MD5 over `json.dumps(args,
/// sort_keys=True)`; this crate compares signatures only within one process
/// run, so it reuses the `sha2`/`hex` pairing already in the sanitizer
/// rather than adding an MD5 dependency for a non-cryptographic purpose.
fn signature(name: &str, arguments: &serde_json::Value) -> String {
    let canonical = canonicalize(arguments);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{name}:{}", &digest[..8])
}

/// Recursively sort object keys so the same argument set always serializes
/// identically regardless of insertion order.
fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            let mut out = String::from("{");
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&format!("{:?}:{}", k, canonicalize(v)));
            }
            out.push('}');
            out
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// True once any signature in the window recurs at least `threshold` times
/// (default: 3 occurrences within the last 6) — §4.9f.
fn has_repeated_signature(window: &[String], threshold: usize) -> bool {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for sig in window {
        let count = counts.entry(sig.as_str()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            return true;
        }
    }
    false
}

/// Adapts a slice of live [`Tool`] implementations to the intent
/// classifier's schema-lookup seam, so the classifier never needs to know
/// how tools are implemented (§1, §4.10).
struct ToolsAsRegistry<'a>(&'a [Box<dyn Tool>]);

impl<'a> ToolRegistry for ToolsAsRegistry<'a> {
    fn get(&self, name: &str) -> Option<skynet_core::ToolSchema> {
        self.0.iter().find(|t| t.name() == name).map(|t| skynet_core::ToolSchema {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.input_schema(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProviderRegistry;
    use crate::tools::ToolResult;
    use async_trait::async_trait;
    use skynet_core::{LLMResult, ToolCallRecord, Usage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct EchoTool;
    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input.to_string())
        }
    }

    struct FailingTool;
    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            ToolResult::error("kaboom")
        }
    }

    struct ScriptedAdapter {
        responses: std::sync::Mutex<Vec<LLMResult>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl crate::provider::ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "anthropic"
        }
        async fn call(&self, request: &LLMCall) -> Result<LLMResult, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().expect("lock");
            if responses.is_empty() {
                return Ok(LLMResult {
                    content: "done".into(),
                    tool_calls: Vec::new(),
                    usage: Usage::default(),
                    model: request.model.clone(),
                    cached: false,
                });
            }
            Ok(responses.remove(0))
        }
    }

    fn config() -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.tool_loop_max_iterations = 12;
        cfg.tool_fanout_max = 4;
        cfg.loop_window = 6;
        cfg.loop_threshold = 3;
        cfg.circuit_breaker_errors = 3;
        cfg
    }

    fn tool_use_result(calls: Vec<(&str, &str, serde_json::Value)>) -> LLMResult {
        LLMResult {
            content: String::new(),
            tool_calls: calls
                .into_iter()
                .map(|(id, name, args)| ToolCallRecord { id: id.into(), name: name.into(), arguments: args })
                .collect(),
            usage: Usage::default(),
            model: "anthropic/claude-sonnet-4-6".into(),
            cached: false,
        }
    }

    #[tokio::test]
    async fn final_text_appends_assistant_message_and_returns() {
        let adapter =
            ScriptedAdapter { responses: std::sync::Mutex::new(Vec::new()), calls: AtomicUsize::new(0) };
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(adapter));
        let mut cfg = config();
        cfg.default_model = "anthropic/claude-sonnet-4-6".into();
        let dispatcher = Dispatcher::with_registry(&cfg, registry);
        let tools: Vec<Box<dyn Tool>> = Vec::new();
        let tool_loop = ToolLoop::new(&dispatcher, &tools, &cfg);

        let mut session = Session::new();
        let cancel = CancellationToken::new();
        let outcome = tool_loop
            .run(&mut session, "anthropic/claude-sonnet-4-6", &SystemPrompt::default(), "hello", &cancel, None, None)
            .await
            .expect("run");

        assert_eq!(outcome, ToolLoopOutcome::Text("done".to_string()));
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn two_tool_fan_out_appends_in_order() {
        let first = tool_use_result(vec![
            ("a", "echo", serde_json::json!({"expr": "2+2"})),
            ("b", "echo", serde_json::json!({"expr": "3+3"})),
        ]);
        let adapter =
            ScriptedAdapter { responses: std::sync::Mutex::new(vec![first]), calls: AtomicUsize::new(0) };
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(adapter));
        let cfg = config();
        let dispatcher = Dispatcher::with_registry(&cfg, registry);
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let tool_loop = ToolLoop::new(&dispatcher, &tools, &cfg);

        let mut session = Session::new();
        let cancel = CancellationToken::new();
        let outcome = tool_loop
            .run(
                &mut session,
                "anthropic/claude-sonnet-4-6",
                &SystemPrompt::default(),
                "compare 2+2 and 3+3",
                &cancel,
                None,
                None,
            )
            .await
            .expect("run");

        assert_eq!(outcome, ToolLoopOutcome::Text("done".to_string()));
        // user, assistant(tool_use x2), tool(tool_result x2), assistant(final)
        assert_eq!(session.messages.len(), 4);
        let tool_msg = &session.messages[2];
        let blocks = tool_msg.content.blocks();
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "a"));
        assert!(matches!(&blocks[1], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "b"));
    }

    #[tokio::test]
    async fn repeated_signature_trips_loop_detection() {
        let repeated = tool_use_result(vec![("x", "echo", serde_json::json!({"q": "x"}))]);
        let responses: Vec<LLMResult> = (0..5)
            .map(|_| LLMResult {
                content: repeated.content.clone(),
                tool_calls: repeated.tool_calls.clone(),
                usage: repeated.usage,
                model: repeated.model.clone(),
                cached: repeated.cached,
            })
            .collect();
        let adapter = ScriptedAdapter { responses: std::sync::Mutex::new(responses), calls: AtomicUsize::new(0) };
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(adapter));
        let cfg = config();
        let dispatcher = Dispatcher::with_registry(&cfg, registry);
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let tool_loop = ToolLoop::new(&dispatcher, &tools, &cfg);

        let mut session = Session::new();
        let cancel = CancellationToken::new();
        let outcome = tool_loop
            .run(&mut session, "anthropic/claude-sonnet-4-6", &SystemPrompt::default(), "search x", &cancel, None, None)
            .await
            .expect("run");

        match outcome {
            ToolLoopOutcome::Text(text) => assert!(text.starts_with(ERROR_SENTINEL.to_string().as_str())),
            ToolLoopOutcome::Cancelled => panic!("should not cancel"),
        }
    }

    #[tokio::test]
    async fn circuit_breaker_trips_after_three_tool_errors_in_one_iteration() {
        let failing = tool_use_result(vec![
            ("a", "boom", serde_json::json!({})),
            ("b", "boom", serde_json::json!({})),
            ("c", "boom", serde_json::json!({})),
        ]);
        let adapter =
            ScriptedAdapter { responses: std::sync::Mutex::new(vec![failing]), calls: AtomicUsize::new(0) };
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(adapter));
        let cfg = config();
        let dispatcher = Dispatcher::with_registry(&cfg, registry);
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(FailingTool)];
        let tool_loop = ToolLoop::new(&dispatcher, &tools, &cfg);

        let mut session = Session::new();
        let cancel = CancellationToken::new();
        let outcome = tool_loop
            .run(&mut session, "anthropic/claude-sonnet-4-6", &SystemPrompt::default(), "do three things", &cancel, None, None)
            .await
            .expect("run");

        match outcome {
            ToolLoopOutcome::Text(text) => assert!(text.contains("too many tool errors")),
            ToolLoopOutcome::Cancelled => panic!("should not cancel"),
        }
    }

    #[tokio::test]
    async fn already_cancelled_token_short_circuits_before_any_dispatch() {
        let adapter =
            ScriptedAdapter { responses: std::sync::Mutex::new(Vec::new()), calls: AtomicUsize::new(0) };
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(adapter));
        let cfg = config();
        let dispatcher = Dispatcher::with_registry(&cfg, registry);
        let tools: Vec<Box<dyn Tool>> = Vec::new();
        let tool_loop = ToolLoop::new(&dispatcher, &tools, &cfg);

        let mut session = Session::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = tool_loop
            .run(&mut session, "anthropic/claude-sonnet-4-6", &SystemPrompt::default(), "hi", &cancel, None, None)
            .await
            .expect("run");

        assert_eq!(outcome, ToolLoopOutcome::Cancelled);
    }

    #[tokio::test]
    async fn on_status_fires_typing_then_tool_running() {
        let first = tool_use_result(vec![("a", "echo", serde_json::json!({"expr": "2+2"}))]);
        let adapter =
            ScriptedAdapter { responses: std::sync::Mutex::new(vec![first]), calls: AtomicUsize::new(0) };
        let mut registry = ProviderRegistry::empty();
        registry.insert("anthropic", Arc::new(adapter));
        let cfg = config();
        let dispatcher = Dispatcher::with_registry(&cfg, registry);
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let tool_loop = ToolLoop::new(&dispatcher, &tools, &cfg);

        let seen: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());
        let on_status = |status: &str, _detail: &str| {
            seen.lock().expect("lock").push(status.to_string());
        };

        let mut session = Session::new();
        let cancel = CancellationToken::new();
        tool_loop
            .run(
                &mut session,
                "anthropic/claude-sonnet-4-6",
                &SystemPrompt::default(),
                "compute 2+2",
                &cancel,
                None,
                Some(&on_status),
            )
            .await
            .expect("run");

        let seen = seen.into_inner().expect("lock");
        assert_eq!(seen, vec!["typing", "tool_running", "typing"]);
    }

    #[test]
    fn signature_is_insensitive_to_key_order() {
        let a = signature("search", &serde_json::json!({"q": "x", "n": 1}));
        let b = signature("search", &serde_json::json!({"n": 1, "q": "x"}));
        assert_eq!(a, b);
    }
}
