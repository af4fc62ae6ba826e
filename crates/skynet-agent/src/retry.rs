use std::future::Future;
use std::time::Duration;

use rand::Rng;
use skynet_core::GatewayError;
use tracing::warn;

/// How a failed attempt should be retried, if at all.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Classification {
    NotRetryable,
    /// Respect `Retry-After`-derived wait, bounded by `retry_max_delay`.
    Bounded(u64),
    /// Fixed long wait — provider signaled overload.
    FixedWait,
    /// `min(base * 2^(attempt-1), cap)` plus jitter.
    Exponential,
}

fn classify(error: &GatewayError) -> Classification {
    match error {
        GatewayError::RateLimitError { retry_after_ms, .. } => Classification::Bounded(*retry_after_ms),
        GatewayError::OverloadedError { .. } => Classification::FixedWait,
        GatewayError::TimeoutError { .. } | GatewayError::NetworkError { .. } => Classification::Exponential,
        GatewayError::ProviderSchemaError { message, .. } => classify_by_text(message),
        _ => Classification::NotRetryable,
    }
}

fn classify_by_text(message: &str) -> Classification {
    let lower = message.to_lowercase();
    if lower.contains("overloaded") || lower.contains("529") {
        Classification::FixedWait
    } else if lower.contains("rate limit") || lower.contains("429") {
        Classification::Bounded(0)
    } else if lower.contains("timeout") {
        Classification::Exponential
    } else if let Some(status) = http_status_prefix(message) {
        // Adapters fold any status they don't special-case into a
        // `ProviderSchemaError` with a leading `"HTTP {status}: ..."`
        // message (§4.3) — 5xx still needs the exponential retry §4.5
        // grants every other provider, even though it arrives through the
        // generic schema-error path rather than its own error variant.
        if (500..600).contains(&status) {
            Classification::Exponential
        } else {
            Classification::NotRetryable
        }
    } else {
        Classification::NotRetryable
    }
}

/// Parses the leading `"HTTP {status}:"` that every adapter's fallback
/// error-body formatting emits, without committing to a stricter message
/// shape than that prefix.
fn http_status_prefix(message: &str) -> Option<u16> {
    let rest = message.strip_prefix("HTTP ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Shared classification/backoff computation for the sync and async retry
/// paths — only the sleep primitive differs between them (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub overloaded_wait_secs: f64,
    pub jitter_factor: f64,
}

impl RetryPolicy {
    fn delay_for(&self, classification: Classification, attempt: u32) -> Duration {
        let base_secs = match classification {
            Classification::Bounded(ms) if ms > 0 => {
                (ms as f64 / 1000.0).min(self.max_delay_secs)
            }
            Classification::Bounded(_) => self.base_delay_secs,
            Classification::FixedWait => self.overloaded_wait_secs,
            Classification::Exponential => {
                (self.base_delay_secs * 2f64.powi(attempt as i32 - 1)).min(self.max_delay_secs)
            }
            Classification::NotRetryable => 0.0,
        };
        let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        let jittered = (base_secs * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered)
    }

    /// Run a synchronous, blocking provider call with retry.
    pub fn run_sync<T>(&self, mut attempt_fn: impl FnMut() -> Result<T, GatewayError>) -> Result<T, GatewayError> {
        let mut attempt = 1;
        loop {
            match attempt_fn() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let classification = classify(&error);
                    if classification == Classification::NotRetryable || attempt >= self.max_attempts {
                        return Err(error);
                    }
                    let delay = self.delay_for(classification, attempt);
                    warn!(attempt, delay_secs = delay.as_secs_f64(), code = error.code(), "retrying after error");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Run an async provider call with retry, used by the streaming and
    /// non-streaming dispatch paths alike.
    pub async fn run_async<T, Fut>(&self, mut attempt_fn: impl FnMut() -> Fut) -> Result<T, GatewayError>
    where
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let classification = classify(&error);
                    if classification == Classification::NotRetryable || attempt >= self.max_attempts {
                        return Err(error);
                    }
                    let delay = self.delay_for(classification, attempt);
                    warn!(attempt, delay_secs = delay.as_secs_f64(), code = error.code(), "retrying after error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl From<&skynet_core::GatewayConfig> for RetryPolicy {
    fn from(config: &skynet_core::GatewayConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay_secs: config.retry_base_delay_secs,
            max_delay_secs: config.retry_max_delay_secs,
            overloaded_wait_secs: config.overloaded_wait_secs,
            jitter_factor: config.retry_jitter_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 30.0,
            overloaded_wait_secs: 30.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn auth_error_is_not_retryable() {
        assert_eq!(
            classify(&GatewayError::AuthError { provider: "anthropic".into() }),
            Classification::NotRetryable
        );
    }

    #[test]
    fn overloaded_gets_fixed_wait() {
        assert_eq!(
            classify(&GatewayError::OverloadedError { provider: "anthropic".into() }),
            Classification::FixedWait
        );
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(Classification::Exponential, 1), Duration::from_secs_f64(1.0));
        assert_eq!(p.delay_for(Classification::Exponential, 2), Duration::from_secs_f64(2.0));
        assert_eq!(p.delay_for(Classification::Exponential, 3), Duration::from_secs_f64(4.0));
        assert_eq!(p.delay_for(Classification::Exponential, 10), Duration::from_secs_f64(30.0));
    }

    #[test]
    fn run_sync_retries_then_succeeds() {
        let p = policy();
        let mut attempts = 0;
        let result = p.run_sync(|| {
            attempts += 1;
            if attempts < 2 {
                Err(GatewayError::TimeoutError { provider: "anthropic".into() })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn run_sync_stops_at_max_attempts() {
        let p = policy();
        let mut attempts = 0;
        let result: Result<(), GatewayError> = p.run_sync(|| {
            attempts += 1;
            Err(GatewayError::TimeoutError { provider: "anthropic".into() })
        });
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn run_async_stops_on_non_retryable_error_immediately() {
        let p = policy();
        let mut attempts = 0;
        let result: Result<(), GatewayError> = p
            .run_async(|| {
                attempts += 1;
                async { Err(GatewayError::AuthError { provider: "anthropic".into() }) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn provider_schema_error_text_substring_classification() {
        assert_eq!(
            classify(&GatewayError::ProviderSchemaError {
                provider: "openai".into(),
                message: "upstream rate limit exceeded".into()
            }),
            Classification::Bounded(0)
        );
        assert_eq!(
            classify(&GatewayError::ProviderSchemaError {
                provider: "openai".into(),
                message: "service overloaded, try later".into()
            }),
            Classification::FixedWait
        );
    }

    #[test]
    fn http_5xx_provider_schema_error_retries_exponentially() {
        assert_eq!(
            classify(&GatewayError::ProviderSchemaError {
                provider: "openai".into(),
                message: "HTTP 500: internal server error".into()
            }),
            Classification::Exponential
        );
        assert_eq!(
            classify(&GatewayError::ProviderSchemaError {
                provider: "openai".into(),
                message: "HTTP 503: service unavailable".into()
            }),
            Classification::Exponential
        );
    }

    #[test]
    fn http_4xx_provider_schema_error_is_not_retryable() {
        assert_eq!(
            classify(&GatewayError::ProviderSchemaError {
                provider: "openai".into(),
                message: "HTTP 400: bad request".into()
            }),
            Classification::NotRetryable
        );
    }
}
