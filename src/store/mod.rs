//! Durable store abstraction.
//!
//! Everything the dispatch core persists goes through [`Store`]: the per-agent
//! job queues, the monthly spend ledger and the audit surfaces read by the
//! dashboard. Spend is only ever changed through [`Store::increment_spend`],
//! which backends must implement as a single atomic increment.

mod memory;
#[cfg(feature = "database")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    BudgetThreshold, DeadLetter, EventRecord, Job, JobId, Notification, RunRecord, SpendPeriod,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a freshly dispatched job in the `waiting` state.
    async fn enqueue(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Move the oldest runnable waiting job of `queue` to `active` and count
    /// the attempt. Returns `None` when nothing is runnable at `now`.
    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// `active` -> `completed`.
    async fn complete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// `active` -> `waiting` (retry not before `run_at`) or `active` -> `failed`
    /// when `retry_at` is `None`.
    async fn fail_job(
        &self,
        id: &JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Whether `claim_next` would find a job of `queue` at `now`.
    async fn has_runnable(&self, queue: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Jobs of `queue` left `active`, typically by a process that died mid-job.
    async fn active_jobs(&self, queue: &str) -> Result<Vec<Job>, StoreError>;

    /// Retained `failed` jobs of `queue` that used every attempt but have no
    /// dead letter yet.
    async fn missing_dead_letters(&self, queue: &str) -> Result<Vec<Job>, StoreError>;

    /// Keep only the newest `keep_completed` / `keep_failed` terminal jobs.
    async fn prune_terminal(
        &self,
        queue: &str,
        keep_completed: usize,
        keep_failed: usize,
    ) -> Result<u64, StoreError>;

    /// Read the period row, creating it with `default_limit` on first access.
    async fn spend_period(&self, period: &str, default_limit: f64) -> Result<SpendPeriod, StoreError>;

    /// Atomically add `amount` to the period's spend and return the updated row.
    async fn increment_spend(
        &self,
        period: &str,
        amount: f64,
        default_limit: f64,
    ) -> Result<SpendPeriod, StoreError>;

    /// Check-and-set the one-shot alert flag. Returns `true` only for the
    /// caller that flipped it.
    async fn mark_alert_sent(&self, period: &str, threshold: BudgetThreshold) -> Result<bool, StoreError>;

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    async fn record_notification(&self, notification: &Notification) -> Result<(), StoreError>;

    /// Insert a dead letter keyed by job id. Returns `false` when one exists.
    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<bool, StoreError>;

    async fn record_event(&self, event: &EventRecord) -> Result<(), StoreError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError>;

    async fn notifications(&self) -> Result<Vec<Notification>, StoreError>;

    async fn runs_for(&self, job_id: &JobId) -> Result<Vec<RunRecord>, StoreError>;
}
