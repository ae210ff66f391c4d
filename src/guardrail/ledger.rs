use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::alerts::{fire_and_forget, Alerter};
use crate::error::StoreError;
use crate::model::{period_key, BudgetThreshold, Notification, NotificationKind, SpendPeriod};
use crate::store::Store;

/// Monthly spend ledger.
///
/// Reads go through a short-lived cache; writes are always an atomic
/// increment in the store followed by a cache refresh with the returned row.
pub struct SpendLedger {
    store: Arc<dyn Store>,
    cache: Cache<String, SpendPeriod>,
    default_limit: f64,
    alerter: Arc<dyn Alerter>,
    alert_timeout: Duration,
}

impl SpendLedger {
    pub fn new(
        store: Arc<dyn Store>,
        alerter: Arc<dyn Alerter>,
        default_limit: f64,
        cache_ttl: Duration,
        alert_timeout: Duration,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(16)
            .time_to_live(cache_ttl)
            .build();
        Self {
            store,
            cache,
            default_limit,
            alerter,
            alert_timeout,
        }
    }

    /// Current period row, possibly up to one cache TTL stale.
    pub async fn current(&self, now: DateTime<Utc>) -> Result<SpendPeriod, StoreError> {
        let key = period_key(now);
        if let Some(cached) = self.cache.get(&key).await {
            debug!(period = %key, "Spend cache hit");
            return Ok(cached);
        }
        let period = self.store.spend_period(&key, self.default_limit).await?;
        self.cache.insert(key, period.clone()).await;
        Ok(period)
    }

    /// Add `amount` to the period's spend and fire any threshold alert that
    /// this update crossed first.
    pub async fn record_spend(&self, amount: f64, now: DateTime<Utc>) -> Result<SpendPeriod, StoreError> {
        let key = period_key(now);
        let period = self
            .store
            .increment_spend(&key, amount, self.default_limit)
            .await?;
        self.cache.insert(key, period.clone()).await;

        self.check_thresholds(&period).await;
        Ok(period)
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate_all();
    }

    async fn check_thresholds(&self, period: &SpendPeriod) {
        for threshold in [BudgetThreshold::EightyPercent, BudgetThreshold::HundredPercent] {
            if period.ratio() < threshold.ratio() || threshold.is_flagged(period) {
                continue;
            }
            // The store's check-and-set decides which concurrent writer alerts
            match self.store.mark_alert_sent(&period.period, threshold).await {
                Ok(true) => self.send_budget_alert(period, threshold).await,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Could not set budget alert flag"),
            }
        }
    }

    async fn send_budget_alert(&self, period: &SpendPeriod, threshold: BudgetThreshold) {
        let percent = (threshold.ratio() * 100.0) as u32;
        let text = format!(
            "Compute spend for {} reached {}% of budget: ${:.2} of ${:.2} ({:.1}%)",
            period.period,
            percent,
            period.spent_amount,
            period.budget_limit,
            period.ratio() * 100.0
        );
        info!(period = %period.period, threshold = percent, "Budget threshold crossed");

        let notification = Notification {
            kind: NotificationKind::BudgetAlert,
            agent: None,
            title: format!("Budget {percent}% reached"),
            body: text.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_notification(&notification).await {
            tracing::warn!(error = %e, "Could not persist budget notification");
        }

        fire_and_forget(self.alert_timeout, "budget", self.alerter.send_budget_alert(&text)).await;
    }
}
