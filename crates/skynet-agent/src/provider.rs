use async_trait::async_trait;
use skynet_core::{GatewayError, LLMCall, LLMResult};
use tokio::sync::mpsc;

use crate::stream::StreamEvent;

/// A single provider's wire protocol: Anthropic, OpenAI-compatible, Google,
/// or local OpenAI-compatible (Ollama) — one implementor per wire shape,
/// not per commercial provider (§4.3).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short identifier used in logs, cost lookups, and failover ordering
    /// (e.g. `"anthropic"`, `"openai"`, `"google"`, `"xai"`).
    fn name(&self) -> &str;

    async fn call(&self, request: &LLMCall) -> Result<LLMResult, GatewayError>;

    /// Stream the response over `tx`, terminating with exactly one of
    /// `StreamEvent::MessageEnd` or `StreamEvent::Error`. The default
    /// implementation falls back to a single non-streaming `call()` and
    /// replays it as one `TextDelta` plus a `MessageEnd`.
    async fn stream(
        &self,
        request: &LLMCall,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GatewayError> {
        let result = self.call(request).await?;
        if !result.content.is_empty() {
            let _ = tx
                .send(StreamEvent::TextDelta {
                    text: result.content.clone(),
                })
                .await;
        }
        for call in &result.tool_calls {
            let _ = tx
                .send(StreamEvent::ToolUseEnd { call: call.clone() })
                .await;
        }
        let _ = tx.send(StreamEvent::MessageEnd { result }).await;
        Ok(())
    }
}
