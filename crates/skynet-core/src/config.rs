use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Per-model pricing, in USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_write_per_million: f64,
    #[serde(default)]
    pub cache_read_per_million: f64,
}

/// Per-intent token budget (§4.10).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntentTokens {
    pub chat: u32,
    pub memory: u32,
    pub creative: u32,
    pub code: u32,
    pub search: u32,
    pub analysis: u32,
    pub media: u32,
}

impl Default for IntentTokens {
    fn default() -> Self {
        Self {
            chat: 1024,
            memory: 1024,
            creative: 1024,
            code: 4096,
            search: 2048,
            analysis: 4096,
            media: 1024,
        }
    }
}

/// The gateway configuration surface (§6).
///
/// Loaded via `figment`: a TOML file merged with `Env::prefixed("SKYNET_")`
/// overrides (env wins over file) against this component's flat field set.
/// All fields have defaults; none require a file on disk to operate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_fingerprint_messages")]
    pub cache_fingerprint_messages: usize,
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: u32,
    #[serde(default = "default_overflow_stage_b_factor")]
    pub overflow_stage_b_factor: f64,
    #[serde(default = "default_overflow_stage_c_pairs")]
    pub overflow_stage_c_pairs: usize,
    #[serde(default = "default_cost_cap_usd")]
    pub cost_cap_usd: f64,
    #[serde(default)]
    pub intent_max_tokens: IntentTokens,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: f64,
    #[serde(default = "default_overloaded_wait_secs")]
    pub overloaded_wait_secs: f64,
    #[serde(default = "default_retry_jitter_factor")]
    pub retry_jitter_factor: f64,
    #[serde(default = "default_tool_loop_max_iterations")]
    pub tool_loop_max_iterations: usize,
    #[serde(default = "default_tool_fanout_max")]
    pub tool_fanout_max: usize,
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
    #[serde(default = "default_circuit_breaker_errors")]
    pub circuit_breaker_errors: usize,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Fallback model per provider, consulted by cross-provider failover
    /// (§4.7) in the fixed preference order `anthropic`, `xai`, `google`.
    #[serde(default = "default_fallback_models")]
    pub fallback_models: HashMap<String, String>,
    #[serde(default = "default_pricing")]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            llm_timeout_secs: default_llm_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_fingerprint_messages: default_cache_fingerprint_messages(),
            compaction_threshold: default_compaction_threshold(),
            overflow_stage_b_factor: default_overflow_stage_b_factor(),
            overflow_stage_c_pairs: default_overflow_stage_c_pairs(),
            cost_cap_usd: default_cost_cap_usd(),
            intent_max_tokens: IntentTokens::default(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            overloaded_wait_secs: default_overloaded_wait_secs(),
            retry_jitter_factor: default_retry_jitter_factor(),
            tool_loop_max_iterations: default_tool_loop_max_iterations(),
            tool_fanout_max: default_tool_fanout_max(),
            loop_window: default_loop_window(),
            loop_threshold: default_loop_threshold(),
            circuit_breaker_errors: default_circuit_breaker_errors(),
            default_model: default_model(),
            fallback_models: default_fallback_models(),
            pricing: default_pricing(),
        }
    }
}

fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_stream_timeout_secs() -> u64 {
    180
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_cache_fingerprint_messages() -> usize {
    6
}
fn default_compaction_threshold() -> u32 {
    150_000
}
fn default_overflow_stage_b_factor() -> f64 {
    0.85
}
fn default_overflow_stage_c_pairs() -> usize {
    8
}
fn default_cost_cap_usd() -> f64 {
    50.0
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_secs() -> f64 {
    1.0
}
fn default_retry_max_delay_secs() -> f64 {
    30.0
}
fn default_overloaded_wait_secs() -> f64 {
    30.0
}
fn default_retry_jitter_factor() -> f64 {
    0.10
}
fn default_tool_loop_max_iterations() -> usize {
    12
}
fn default_tool_fanout_max() -> usize {
    4
}
fn default_loop_window() -> usize {
    6
}
fn default_loop_threshold() -> usize {
    3
}
fn default_circuit_breaker_errors() -> usize {
    3
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4-6".to_string()
}

fn default_fallback_models() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("anthropic".to_string(), "claude-sonnet-4-6".to_string());
    m.insert("xai".to_string(), "grok-2-latest".to_string());
    m.insert("google".to_string(), "gemini-2.0-flash".to_string());
    m
}

fn default_pricing() -> HashMap<String, ModelPricing> {
    let mut m = HashMap::new();
    m.insert(
        "claude-sonnet-4-6".to_string(),
        ModelPricing {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_write_per_million: 3.75,
            cache_read_per_million: 0.30,
        },
    );
    m.insert(
        "claude-opus-4-1".to_string(),
        ModelPricing {
            input_per_million: 15.0,
            output_per_million: 75.0,
            cache_write_per_million: 18.75,
            cache_read_per_million: 1.50,
        },
    );
    m.insert(
        "gpt-4o".to_string(),
        ModelPricing {
            input_per_million: 2.50,
            output_per_million: 10.0,
            cache_write_per_million: 0.0,
            cache_read_per_million: 1.25,
        },
    );
    m.insert(
        "grok-2-latest".to_string(),
        ModelPricing {
            input_per_million: 2.0,
            output_per_million: 10.0,
            cache_write_per_million: 0.0,
            cache_read_per_million: 0.0,
        },
    );
    m.insert(
        "gemini-2.0-flash".to_string(),
        ModelPricing {
            input_per_million: 0.10,
            output_per_million: 0.40,
            cache_write_per_million: 0.0,
            cache_read_per_million: 0.025,
        },
    );
    m
}

impl GatewayConfig {
    /// Load config from a TOML file with `SKYNET_*` env var overrides.
    ///
    /// Checks an explicit path first, then `~/.skynet/skynet.toml`. A missing
    /// file is not an error — every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.map(String::from).unwrap_or_else(default_config_path);

        // Every field here sits at the top level, so a plain prefix strip is
        // the correct match. `.split("_")` would be right for a nested
        // config (turning SKYNET_SECTION_FIELD into section.field), but on
        // this flat struct it would fragment a multi-word field like
        // `cost_cap_usd` into a three-level path that never lines up.
        Figment::from(figment::providers::Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SKYNET_"))
            .extract()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.skynet/skynet.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_require_no_file() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.tool_loop_max_iterations, 12);
        assert_eq!(cfg.loop_window, 6);
        assert_eq!(cfg.loop_threshold, 3);
        assert_eq!(cfg.retry_max_attempts, 3);
        assert!((cfg.overflow_stage_b_factor - 0.85).abs() < 1e-9);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = GatewayConfig::load(Some("/nonexistent/path/skynet.toml")).expect("load");
        assert_eq!(cfg.default_model, default_model());
    }

    #[test]
    fn load_merges_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("skynet.toml");
        std::fs::write(&path, "cost_cap_usd = 5.0\ntool_loop_max_iterations = 20\n")
            .expect("write");

        let cfg = GatewayConfig::load(Some(path.to_str().unwrap())).expect("load");
        assert!((cfg.cost_cap_usd - 5.0).abs() < 1e-9);
        assert_eq!(cfg.tool_loop_max_iterations, 20);
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("skynet.toml");
        std::fs::write(&path, "cost_cap_usd = 5.0\n").expect("write");

        std::env::set_var("SKYNET_COST_CAP_USD", "9.5");
        let cfg = GatewayConfig::load(Some(path.to_str().unwrap())).expect("load");
        std::env::remove_var("SKYNET_COST_CAP_USD");

        assert!((cfg.cost_cap_usd - 9.5).abs() < 1e-9);
    }
}
