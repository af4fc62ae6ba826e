use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Default)]
struct Histogram {
    buckets: Vec<AtomicU64>,
    sum: Mutex<f64>,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: DURATION_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum: Mutex::new(0.0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        for (bucket, limit) in self.buckets.iter().zip(DURATION_BUCKETS) {
            if value <= *limit {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        *self.sum.lock().expect("metrics mutex poisoned") += value;
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counter/gauge/histogram registry rendered in Prometheus 0.0.4 text
/// exposition format. A process-wide singleton in the source's
/// `monitoring/metrics.py`; here an explicit context object constructed once
/// at the composition root and passed to the dispatcher (§9).
pub struct MetricsRegistry {
    llm_calls_total: DashMap<(String, String, String), AtomicU64>,
    llm_call_duration_seconds: DashMap<String, Histogram>,
    token_usage_total: DashMap<(String, &'static str), AtomicU64>,
    active_sessions: AtomicU64,
    llm_errors_total: DashMap<(String, String), AtomicU64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            llm_calls_total: DashMap::new(),
            llm_call_duration_seconds: DashMap::new(),
            token_usage_total: DashMap::new(),
            active_sessions: AtomicU64::new(0),
            llm_errors_total: DashMap::new(),
        }
    }

    pub fn record_call(&self, provider: &str, model: &str, status: &str) {
        self.llm_calls_total
            .entry((provider.to_string(), model.to_string(), status.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, provider: &str, code: &str) {
        self.llm_errors_total
            .entry((provider.to_string(), code.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, provider: &str, seconds: f64) {
        self.llm_call_duration_seconds
            .entry(provider.to_string())
            .or_insert_with(Histogram::new)
            .observe(seconds);
    }

    pub fn record_tokens(&self, provider: &str, kind: &'static str, amount: u64) {
        self.token_usage_total
            .entry((provider.to_string(), kind))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Render the full registry in Prometheus text exposition format 0.0.4.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP llm_calls_total Total LLM calls by provider, model, and status.\n");
        out.push_str("# TYPE llm_calls_total counter\n");
        for entry in self.llm_calls_total.iter() {
            let (provider, model, status) = entry.key();
            let value = entry.value().load(Ordering::Relaxed);
            out.push_str(&format!(
                "llm_calls_total{{provider=\"{provider}\",model=\"{model}\",status=\"{status}\"}} {value}\n"
            ));
        }

        out.push_str("# HELP llm_call_duration_seconds LLM call latency by provider.\n");
        out.push_str("# TYPE llm_call_duration_seconds histogram\n");
        for entry in self.llm_call_duration_seconds.iter() {
            let provider = entry.key();
            let hist = entry.value();
            for (bucket, limit) in hist.buckets.iter().zip(DURATION_BUCKETS) {
                let value = bucket.load(Ordering::Relaxed);
                out.push_str(&format!(
                    "llm_call_duration_seconds_bucket{{provider=\"{provider}\",le=\"{limit}\"}} {value}\n"
                ));
            }
            let count = hist.count.load(Ordering::Relaxed);
            out.push_str(&format!(
                "llm_call_duration_seconds_bucket{{provider=\"{provider}\",le=\"+Inf\"}} {count}\n"
            ));
            let sum = *hist.sum.lock().expect("metrics mutex poisoned");
            out.push_str(&format!("llm_call_duration_seconds_sum{{provider=\"{provider}\"}} {sum}\n"));
            out.push_str(&format!("llm_call_duration_seconds_count{{provider=\"{provider}\"}} {count}\n"));
        }

        out.push_str("# HELP token_usage_total Tokens consumed by provider and token type.\n");
        out.push_str("# TYPE token_usage_total counter\n");
        for entry in self.token_usage_total.iter() {
            let (provider, kind) = entry.key();
            let value = entry.value().load(Ordering::Relaxed);
            out.push_str(&format!("token_usage_total{{provider=\"{provider}\",type=\"{kind}\"}} {value}\n"));
        }

        out.push_str("# HELP active_sessions Currently active conversation sessions.\n");
        out.push_str("# TYPE active_sessions gauge\n");
        out.push_str(&format!("active_sessions {}\n", self.active_sessions.load(Ordering::Relaxed)));

        out.push_str("# HELP llm_errors_total Total LLM errors by provider and error code.\n");
        out.push_str("# TYPE llm_errors_total counter\n");
        for entry in self.llm_errors_total.iter() {
            let (provider, code) = entry.key();
            let value = entry.value().load(Ordering::Relaxed);
            out.push_str(&format!("llm_errors_total{{provider=\"{provider}\",code=\"{code}\"}} {value}\n"));
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_gauge() {
        let registry = MetricsRegistry::new();
        registry.record_call("anthropic", "claude-sonnet-4-6", "ok");
        registry.session_started();
        let text = registry.render();
        assert!(text.contains("llm_calls_total{provider=\"anthropic\",model=\"claude-sonnet-4-6\",status=\"ok\"} 1"));
        assert!(text.contains("active_sessions 1"));
    }

    #[test]
    fn histogram_buckets_accumulate_cumulatively() {
        let registry = MetricsRegistry::new();
        registry.observe_duration("anthropic", 0.2);
        let text = registry.render();
        assert!(text.contains("llm_call_duration_seconds_bucket{provider=\"anthropic\",le=\"0.25\"} 1"));
        assert!(text.contains("llm_call_duration_seconds_bucket{provider=\"anthropic\",le=\"10\"} 1"));
        assert!(text.contains("llm_call_duration_seconds_count{provider=\"anthropic\"} 1"));
    }

    #[test]
    fn token_usage_tracks_per_kind() {
        let registry = MetricsRegistry::new();
        registry.record_tokens("openai", "input", 100);
        registry.record_tokens("openai", "output", 40);
        let text = registry.render();
        assert!(text.contains("token_usage_total{provider=\"openai\",type=\"input\"} 100"));
        assert!(text.contains("token_usage_total{provider=\"openai\",type=\"output\"} 40"));
    }

    #[test]
    fn errors_increment_per_provider_and_code() {
        let registry = MetricsRegistry::new();
        registry.record_error("anthropic", "RATE_LIMIT_ERROR");
        registry.record_error("anthropic", "RATE_LIMIT_ERROR");
        let text = registry.render();
        assert!(text.contains("llm_errors_total{provider=\"anthropic\",code=\"RATE_LIMIT_ERROR\"} 2"));
    }

    #[test]
    fn session_count_decrements() {
        let registry = MetricsRegistry::new();
        registry.session_started();
        registry.session_started();
        registry.session_ended();
        let text = registry.render();
        assert!(text.contains("active_sessions 1"));
    }
}
