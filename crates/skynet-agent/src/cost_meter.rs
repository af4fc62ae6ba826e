use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use skynet_core::{GatewayConfig, GatewayError, ModelId, Usage};

/// Per-model pricing keyed USD-per-million-tokens, plus a process-wide spend
/// counter. `check()` is consulted before every provider call; on exceed the
/// dispatcher returns an error instead of spending network I/O (§4.6).
///
/// Held as an explicit `Arc<CostMeter>` by the composition root and passed
/// into the `Dispatcher` — never a module-level `static` (§2.12).
pub struct CostMeter {
    cap_usd: f64,
    /// Spent-so-far, stored as hundred-thousandths of a dollar so it fits an
    /// atomic integer without floating-point races.
    spent_hundred_thousandths: AtomicU64,
    pricing: Mutex<std::collections::HashMap<String, skynet_core::ModelPricing>>,
}

const SCALE: f64 = 100_000.0;

impl CostMeter {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            cap_usd: config.cost_cap_usd,
            spent_hundred_thousandths: AtomicU64::new(0),
            pricing: Mutex::new(config.pricing.clone()),
        }
    }

    /// Cost of one call's usage record against the pricing table, in USD.
    /// An unpriced model id costs nothing — it's better to undercount than
    /// to block a call the operator forgot to price.
    pub fn cost_for(&self, model: &str, usage: &Usage) -> f64 {
        let bare = ModelId::parse(model).model_id;
        let pricing = self.pricing.lock().expect("cost meter pricing lock poisoned");
        let Some(price) = pricing.get(&bare) else {
            return 0.0;
        };
        let input_cost = usage.input as f64 * price.input_per_million / 1_000_000.0;
        let output_cost = usage.output as f64 * price.output_per_million / 1_000_000.0;
        let cache_write_cost = usage.cache_creation as f64 * price.cache_write_per_million / 1_000_000.0;
        let cache_read_cost = usage.cache_read as f64 * price.cache_read_per_million / 1_000_000.0;
        input_cost + output_cost + cache_write_cost + cache_read_cost
    }

    pub fn spent_usd(&self) -> f64 {
        self.spent_hundred_thousandths.load(Ordering::Relaxed) as f64 / SCALE
    }

    /// Raise `CostCapExceeded` if the cap has already been crossed.
    pub fn check(&self) -> Result<(), GatewayError> {
        let spent = self.spent_usd();
        if spent >= self.cap_usd {
            return Err(GatewayError::CostCapExceeded {
                cap_usd: self.cap_usd,
                spent_usd: spent,
            });
        }
        Ok(())
    }

    pub fn record(&self, model: &str, usage: &Usage) {
        let cost = self.cost_for(model, usage);
        let delta = (cost * SCALE).round() as u64;
        self.spent_hundred_thousandths.fetch_add(delta, Ordering::Relaxed);
    }
}
