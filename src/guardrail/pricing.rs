use std::collections::BTreeMap;
use tracing::warn;

use crate::config::{BudgetConfig, ModelPrice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Primary,
    Fallback,
}

/// Fixed USD price per million units, by model name.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: BTreeMap<String, ModelPrice>,
    primary_model: String,
    fallback_model: String,
}

impl PriceTable {
    pub fn from_config(config: &BudgetConfig) -> Self {
        Self {
            prices: config.prices.clone(),
            primary_model: config.primary_model.clone(),
            fallback_model: config.fallback_model.clone(),
        }
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.primary_model,
            ModelTier::Fallback => &self.fallback_model,
        }
    }

    /// Cost of one call. Unknown models are billed at the primary tier's
    /// price so they are never under-counted against the budget.
    pub fn cost(&self, model: &str, input_units: u64, output_units: u64) -> f64 {
        let price = match self.prices.get(model) {
            Some(price) => price,
            None => {
                warn!(model, "No price configured for model, billing at primary tier");
                match self.prices.get(&self.primary_model) {
                    Some(price) => price,
                    None => return 0.0,
                }
            }
        };
        (input_units as f64 * price.input_per_million
            + output_units as f64 * price.output_per_million)
            / 1_000_000.0
    }
}
