use thiserror::Error;

/// The U+274C sentinel that every terminal, user-visible error string begins
/// with — callers may display `Display` output directly without further
/// formatting (§7).
pub const ERROR_SENTINEL: char = '\u{274C}';

/// Error taxonomy for the dispatch and tool-loop engine (§7).
///
/// A single `thiserror`-derived enum with a `.code()` accessor so callers can
/// branch on error identity without matching `Display` text.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{ERROR_SENTINEL} not configured: missing credentials for provider '{provider}'")]
    AuthError { provider: String },

    #[error("{ERROR_SENTINEL} rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimitError { provider: String, retry_after_ms: u64 },

    #[error("{ERROR_SENTINEL} {provider} is overloaded, please try again shortly")]
    OverloadedError { provider: String },

    #[error("{ERROR_SENTINEL} conversation is too long for {model}'s context window")]
    TokenOverflowError { model: String },

    #[error("{ERROR_SENTINEL} request to {provider} timed out")]
    TimeoutError { provider: String },

    #[error("{ERROR_SENTINEL} network error talking to {provider}: {message}")]
    NetworkError { provider: String, message: String },

    #[error("{ERROR_SENTINEL} cost cap of ${cap_usd:.4} exceeded (spent ${spent_usd:.4})")]
    CostCapExceeded { cap_usd: f64, spent_usd: f64 },

    #[error("{ERROR_SENTINEL} {provider} returned a malformed response: {message}")]
    ProviderSchemaError { provider: String, message: String },

    #[error("{ERROR_SENTINEL} tool '{name}' failed: {message}")]
    ToolError { name: String, message: String },

    #[error("{ERROR_SENTINEL} cancelled")]
    CancelledError,

    #[error("{ERROR_SENTINEL} the assistant seems to be stuck repeating the same tool call and was stopped")]
    LoopDetected,

    #[error("{ERROR_SENTINEL} the assistant did not finish within the iteration limit")]
    IterationCapExceeded,

    #[error("{ERROR_SENTINEL} configuration error: {0}")]
    Config(String),

    #[error("{ERROR_SENTINEL} internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable `SCREAMING_SNAKE_CASE` identity string, independent of `Display`
    /// text (which is allowed to change wording without breaking callers).
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AuthError { .. } => "AUTH_ERROR",
            GatewayError::RateLimitError { .. } => "RATE_LIMIT_ERROR",
            GatewayError::OverloadedError { .. } => "OVERLOADED_ERROR",
            GatewayError::TokenOverflowError { .. } => "TOKEN_OVERFLOW_ERROR",
            GatewayError::TimeoutError { .. } => "TIMEOUT_ERROR",
            GatewayError::NetworkError { .. } => "NETWORK_ERROR",
            GatewayError::CostCapExceeded { .. } => "COST_CAP_EXCEEDED",
            GatewayError::ProviderSchemaError { .. } => "PROVIDER_SCHEMA_ERROR",
            GatewayError::ToolError { .. } => "TOOL_ERROR",
            GatewayError::CancelledError => "CANCELLED_ERROR",
            GatewayError::LoopDetected => "LOOP_DETECTED",
            GatewayError::IterationCapExceeded => "ITERATION_CAP_EXCEEDED",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this class of error is immediately terminal at the dispatcher
    /// — never retried, never failed over (§4.7, §7 propagation policy).
    pub fn is_immediately_terminal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthError { .. }
                | GatewayError::CostCapExceeded { .. }
                | GatewayError::TokenOverflowError { .. }
                | GatewayError::CancelledError
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
