use skynet_core::{LLMResult, ToolCallRecord};

/// Unified streaming event shape emitted by every provider adapter's
/// `stream()` — consumers iterate until `Error` or `MessageEnd` (§4.3, §9).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta { text: String },
    ThinkingDelta { text: String },
    ToolUseStart { id: String, name: String },
    ToolUseDelta { id: String, partial_json: String },
    ToolUseEnd { call: ToolCallRecord },
    MessageEnd { result: LLMResult },
    Error { message: String },
}
