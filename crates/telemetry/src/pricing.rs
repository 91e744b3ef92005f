//! Model pricing table.
//!
//! Prices are in USD per 1 million tokens. Built-in entries cover the models
//! the default tier mapping uses; `[pricing]` config entries override them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self { input_per_m, output_per_m }
    }

    /// Cost for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m) / 1_000_000.0
    }
}

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    /// A table with built-in model prices.
    pub fn with_defaults() -> Self {
        let defaults = [
            // OpenAI
            ("gpt-4o-mini", 0.15, 0.6),
            ("gpt-4o", 2.5, 10.0),
            ("gpt-4.1-mini", 0.4, 1.6),
            ("gpt-4.1", 2.0, 8.0),
            ("o1", 15.0, 60.0),
            ("o3-mini", 1.1, 4.4),
            // Anthropic
            ("claude-3.5-haiku", 0.8, 4.0),
            ("claude-sonnet-4", 3.0, 15.0),
            ("claude-opus-4", 15.0, 75.0),
            // Google
            ("gemini-2.0-flash", 0.1, 0.4),
            ("gemini-1.5-pro", 1.25, 5.0),
        ];
        let prices = defaults
            .into_iter()
            .map(|(model, input, output)| (model.to_string(), ModelPricing::new(input, output)))
            .collect();
        Self { prices: RwLock::new(prices) }
    }

    pub fn empty() -> Self {
        Self { prices: RwLock::new(HashMap::new()) }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ModelPricing>> {
        self.prices.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exact lookup.
    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        self.read().get(model).copied()
    }

    /// Add or update pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        let mut prices = self.prices.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        prices.insert(model.into(), pricing);
    }

    /// Cost of a model call, or 0.0 if the model is unknown.
    ///
    /// Tries an exact match, then the name without a vendor prefix
    /// (`openai/gpt-4o` → `gpt-4o`), then the longest known name that prefixes
    /// the model (`gpt-4o-mini-2024-07-18` → `gpt-4o-mini`).
    pub fn compute_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let prices = self.read();

        if let Some(p) = prices.get(model) {
            return p.cost(input_tokens, output_tokens);
        }

        let bare = model.rsplit('/').next().unwrap_or(model).to_lowercase();
        if let Some(p) = prices.get(bare.as_str()) {
            return p.cost(input_tokens, output_tokens);
        }

        prices
            .iter()
            .filter(|(key, _)| bare.starts_with(&key.to_lowercase()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, p)| p.cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }

    /// All known model names, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
