//! Guardrail service: spend ledger, failure streaks and the per-agent soft
//! spend counters, owned by one explicitly constructed instance.
//!
//! The worker pool uses it to track job outcomes, the executor uses it to
//! gate and account every costed call.

mod executor;
mod failure;
mod ledger;
mod pricing;

pub use executor::{CostedCall, CostedCallOutcome, GuardrailExecutor};
pub use failure::{FailureStreak, FailureTracker};
pub use ledger::SpendLedger;
pub use pricing::{ModelTier, PriceTable};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::alerts::{fire_and_forget, Alerter, FailureAlert};
use crate::config::DispatchConfig;
use crate::model::{period_key, Notification, NotificationKind};
use crate::store::Store;

/// Running spend of one agent in one period. Resets on restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSpendCounter {
    pub period: String,
    pub total_usd: f64,
    pub warned: bool,
}

pub struct GuardrailService {
    ledger: SpendLedger,
    failures: FailureTracker,
    agent_spend: Mutex<HashMap<String, AgentSpendCounter>>,
    critical_agents: HashSet<String>,
    agent_warning_ratio: f64,
    store: Arc<dyn Store>,
    alerter: Arc<dyn Alerter>,
    alert_timeout: Duration,
}

impl GuardrailService {
    pub fn new(
        config: &DispatchConfig,
        store: Arc<dyn Store>,
        alerter: Arc<dyn Alerter>,
        critical_agents: HashSet<String>,
    ) -> Self {
        let alert_timeout = Duration::from_millis(config.alerts.timeout_ms);
        let ledger = SpendLedger::new(
            store.clone(),
            alerter.clone(),
            config.budget.monthly_limit_usd,
            Duration::from_secs(config.budget.cache_ttl_seconds),
            alert_timeout,
        );
        let failures = FailureTracker::new(
            config.alerts.streak_threshold,
            chrono::Duration::seconds(config.alerts.cooldown_seconds as i64),
        );
        Self {
            ledger,
            failures,
            agent_spend: Mutex::new(HashMap::new()),
            critical_agents,
            agent_warning_ratio: config.budget.agent_warning_ratio,
            store,
            alerter,
            alert_timeout,
        }
    }

    pub fn ledger(&self) -> &SpendLedger {
        &self.ledger
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn is_critical(&self, agent: &str) -> bool {
        self.critical_agents.contains(agent)
    }

    /// Any success clears the agent's streak.
    pub fn record_job_success(&self, agent: &str) {
        self.failures.record_success(agent);
    }

    /// Count a failed attempt and send the throttled alert when it is due.
    pub async fn record_job_failure(&self, agent: &str, job_type: &str, error: &str) {
        self.record_job_failure_at(agent, job_type, error, Utc::now())
            .await
    }

    pub async fn record_job_failure_at(
        &self,
        agent: &str,
        job_type: &str,
        error: &str,
        now: DateTime<Utc>,
    ) {
        let Some(consecutive_failures) = self.failures.record_failure(agent, error, now) else {
            return;
        };

        warn!(agent, job_type, consecutive_failures, "Agent failure streak reached alert threshold");
        let alert = FailureAlert {
            agent: agent.to_string(),
            job_type: job_type.to_string(),
            error: error.to_string(),
            consecutive_failures,
        };

        let notification = Notification {
            kind: NotificationKind::FailureAlert,
            agent: Some(agent.to_string()),
            title: format!("{agent} failed {consecutive_failures} times in a row"),
            body: error.to_string(),
            created_at: now,
        };
        if let Err(e) = self.store.record_notification(&notification).await {
            warn!(error = %e, "Could not persist failure notification");
        }

        fire_and_forget(
            self.alert_timeout,
            "failure",
            self.alerter.send_failure_alert(&alert),
        )
        .await;
    }

    /// Soft, log-only warning when one agent passes its share of the budget.
    pub(crate) fn track_agent_spend(&self, agent: &str, cost: f64, budget_limit: f64, now: DateTime<Utc>) {
        let period = period_key(now);
        let mut counters = self.agent_spend.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(agent.to_string()).or_default();
        if counter.period != period {
            *counter = AgentSpendCounter {
                period,
                ..Default::default()
            };
        }
        counter.total_usd += cost;

        let soft_limit = budget_limit * self.agent_warning_ratio;
        if !counter.warned && counter.total_usd >= soft_limit {
            counter.warned = true;
            warn!(
                agent,
                total_usd = counter.total_usd,
                soft_limit_usd = soft_limit,
                "Agent spend passed its soft budget share"
            );
        }
    }

    pub fn agent_spend(&self, agent: &str) -> AgentSpendCounter {
        let counters = self.agent_spend.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(agent).cloned().unwrap_or_default()
    }

    /// Drop all per-process state. The durable ledger is untouched.
    pub async fn reset(&self) {
        self.failures.reset();
        self.agent_spend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.ledger.invalidate().await;
        info!("Guardrail in-process state reset");
    }
}
