use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, error, info, warn};

use super::{GuardrailService, ModelTier, PriceTable};
use crate::config::DispatchConfig;
use crate::error::GuardrailError;
use crate::observability::dispatch_metrics;
use crate::provider::{CompletionRequest, ComputeProvider};

/// A costed call as requested by a job handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostedCall {
    pub system: String,
    pub input: String,
    /// Explicit model; the primary tier when `None`
    pub model: Option<String>,
    pub max_output: u32,
    pub temperature: f32,
    pub agent: String,
    pub job_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostedCallOutcome {
    pub output: String,
    pub model: String,
    pub input_units: u64,
    pub output_units: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// The call ran on the fallback tier because the budget was exhausted
    pub downgraded: bool,
}

/// Wraps every costed provider call: budget pre-check, tier fallback,
/// transient-only retry with exponential backoff, and spend accounting.
pub struct GuardrailExecutor {
    service: Arc<GuardrailService>,
    provider: Arc<dyn ComputeProvider>,
    prices: PriceTable,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl GuardrailExecutor {
    pub fn new(
        config: &DispatchConfig,
        service: Arc<GuardrailService>,
        provider: Arc<dyn ComputeProvider>,
    ) -> Self {
        Self {
            service,
            provider,
            prices: PriceTable::from_config(&config.budget),
            max_attempts: config.retry.provider_attempts.max(1),
            backoff_base: Duration::from_millis(config.retry.provider_backoff_base_ms),
            backoff_max: Duration::from_millis(config.retry.provider_backoff_max_ms),
        }
    }

    pub fn service(&self) -> &Arc<GuardrailService> {
        &self.service
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        // base, 2*base, 4*base, ...
        let factor = (self.backoff_base.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.backoff_max)
            .take(self.max_attempts.saturating_sub(1) as usize)
    }

    pub async fn call(&self, call: CostedCall) -> Result<CostedCallOutcome, GuardrailError> {
        let now = Utc::now();

        // Fail open if the ledger cannot be read; the increment below still
        // lands once the store is back.
        let period = match self.service.ledger().current(now).await {
            Ok(period) => Some(period),
            Err(e) => {
                warn!(agent = %call.agent, error = %e, "Spend ledger unreadable, skipping budget pre-check");
                None
            }
        };

        let mut model = call
            .model
            .clone()
            .unwrap_or_else(|| self.prices.model_for(ModelTier::Primary).to_string());
        let mut downgraded = false;

        if let Some(period) = period.as_ref().filter(|p| p.is_exhausted()) {
            if !self.service.is_critical(&call.agent) {
                dispatch_metrics().record_budget_rejection();
                warn!(
                    agent = %call.agent,
                    job_type = %call.job_type,
                    spent = period.spent_amount,
                    limit = period.budget_limit,
                    "Budget exhausted, rejecting non-critical agent"
                );
                return Err(GuardrailError::BudgetExceeded {
                    agent: call.agent,
                    period: period.period.clone(),
                    spent: period.spent_amount,
                    limit: period.budget_limit,
                });
            }
            let fallback = self.prices.model_for(ModelTier::Fallback).to_string();
            if model != fallback {
                info!(agent = %call.agent, from = %model, to = %fallback, "Budget exhausted, critical agent downgraded to fallback tier");
                dispatch_metrics().record_fallback();
                model = fallback;
                downgraded = true;
            }
        }

        let request = CompletionRequest {
            system: call.system.clone(),
            input: call.input.clone(),
            model: model.clone(),
            max_output: call.max_output,
            temperature: call.temperature,
        };

        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        let response = RetryIf::spawn(
            self.retry_strategy(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(agent = %call.agent, attempt, model = %request.model, "Provider call");
                self.provider.complete(&request)
            },
            |e: &GuardrailError| {
                let retry = e.is_transient();
                if retry {
                    dispatch_metrics().record_provider_retry();
                    warn!(agent = %call.agent, error = %e, "Transient provider failure, retrying");
                }
                retry
            },
        )
        .await
        .inspect_err(|e| {
            error!(
                agent = %call.agent,
                job_type = %call.job_type,
                attempts = attempts.load(Ordering::SeqCst),
                error = %e,
                "Provider call failed"
            )
        })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let cost_usd = self
            .prices
            .cost(&model, response.input_units, response.output_units);

        match self.service.ledger().record_spend(cost_usd, now).await {
            Ok(updated) => {
                self.service
                    .track_agent_spend(&call.agent, cost_usd, updated.budget_limit, now);
            }
            Err(e) => {
                error!(agent = %call.agent, cost_usd, error = %e, "Failed to record spend");
            }
        }

        info!(
            agent = %call.agent,
            job_type = %call.job_type,
            model = %model,
            input_units = response.input_units,
            output_units = response.output_units,
            cost_usd,
            duration_ms,
            "Costed call completed"
        );

        Ok(CostedCallOutcome {
            output: response.output,
            model,
            input_units: response.input_units,
            output_units: response.output_units,
            cost_usd,
            duration_ms,
            downgraded,
        })
    }
}
