use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::Store;
use crate::error::StoreError;
use crate::model::{
    BudgetThreshold, DeadLetter, EventRecord, Job, JobId, JobState, Notification, RunRecord,
    SpendPeriod,
};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Insertion order, used for FIFO claiming
    order: Vec<JobId>,
    periods: HashMap<String, SpendPeriod>,
    runs: Vec<RunRecord>,
    notifications: Vec<Notification>,
    dead_letters: Vec<DeadLetter>,
    events: Vec<EventRecord>,
}

/// Single-process store. Every operation holds one lock, so each trait call
/// is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.inner.lock().await.events.clone()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.inner.lock().await.runs.clone()
    }

    pub async fn jobs_in(&self, queue: &str) -> Vec<Job> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| job.queue == queue)
            .cloned()
            .collect()
    }

    /// Overwrite a period row, for seeding ledger state.
    pub async fn put_period(&self, period: SpendPeriod) {
        self.inner
            .lock()
            .await
            .periods
            .insert(period.period.clone(), period);
    }
}

fn transition(job: &Job, to: JobState) -> StoreError {
    StoreError::InvalidTransition {
        job_id: job.id.to_string(),
        from: job.state.to_string(),
        to: to.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn enqueue(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.order.push(job.id.clone());
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(id).cloned())
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Inner { jobs, order, .. } = &mut *inner;

        let next = order.iter().find(|id| {
            jobs.get(*id).is_some_and(|job| {
                job.queue == queue
                    && job.state == JobState::Waiting
                    && job.run_at <= now
                    && job.has_attempts_left()
            })
        });

        let Some(id) = next.cloned() else {
            return Ok(None);
        };
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        if job.state != JobState::Active {
            return Err(transition(job, JobState::Completed));
        }
        job.state = JobState::Completed;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn fail_job(
        &self,
        id: &JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        if job.state != JobState::Active {
            return Err(transition(job, JobState::Failed));
        }
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        match retry_at {
            Some(at) => {
                job.state = JobState::Waiting;
                job.run_at = at;
            }
            None => job.state = JobState::Failed,
        }
        Ok(job.clone())
    }

    async fn has_runnable(&self, queue: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.values().any(|job| {
            job.queue == queue
                && job.state == JobState::Waiting
                && job.run_at <= now
                && job.has_attempts_left()
        }))
    }

    async fn missing_dead_letters(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| {
                job.queue == queue
                    && job.state == JobState::Failed
                    && job.is_exhausted()
                    && !inner.dead_letters.iter().any(|dead| dead.job_id == job.id)
            })
            .cloned()
            .collect())
    }

    async fn active_jobs(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.state == JobState::Active)
            .cloned()
            .collect())
    }

    async fn prune_terminal(
        &self,
        queue: &str,
        keep_completed: usize,
        keep_failed: usize,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Inner { jobs, order, .. } = &mut *inner;

        let mut doomed = Vec::new();
        for (state, keep) in [
            (JobState::Completed, keep_completed),
            (JobState::Failed, keep_failed),
        ] {
            let mut terminal: Vec<&Job> = jobs
                .values()
                .filter(|job| job.queue == queue && job.state == state)
                .collect();
            if terminal.len() <= keep {
                continue;
            }
            terminal.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            doomed.extend(terminal.into_iter().skip(keep).map(|job| job.id.clone()));
        }

        for id in &doomed {
            jobs.remove(id);
        }
        order.retain(|id| jobs.contains_key(id));
        Ok(doomed.len() as u64)
    }

    async fn spend_period(&self, period: &str, default_limit: f64) -> Result<SpendPeriod, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .periods
            .entry(period.to_string())
            .or_insert_with(|| SpendPeriod::new(period, default_limit))
            .clone())
    }

    async fn increment_spend(
        &self,
        period: &str,
        amount: f64,
        default_limit: f64,
    ) -> Result<SpendPeriod, StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .periods
            .entry(period.to_string())
            .or_insert_with(|| SpendPeriod::new(period, default_limit));
        row.spent_amount += amount.max(0.0);
        Ok(row.clone())
    }

    async fn mark_alert_sent(&self, period: &str, threshold: BudgetThreshold) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.periods.get_mut(period) else {
            return Ok(false);
        };
        let flag = match threshold {
            BudgetThreshold::EightyPercent => &mut row.alert_80_sent,
            BudgetThreshold::HundredPercent => &mut row.alert_100_sent,
        };
        if *flag {
            return Ok(false);
        }
        *flag = true;
        Ok(true)
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.inner.lock().await.runs.push(record.clone());
        Ok(())
    }

    async fn record_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }

    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .dead_letters
            .iter()
            .any(|existing| existing.job_id == dead_letter.job_id)
        {
            return Ok(false);
        }
        inner.dead_letters.push(dead_letter.clone());
        Ok(true)
    }

    async fn record_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        self.inner.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(self.inner.lock().await.dead_letters.clone())
    }

    async fn notifications(&self) -> Result<Vec<Notification>, StoreError> {
        Ok(self.inner.lock().await.notifications.clone())
    }

    async fn runs_for(&self, job_id: &JobId) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .runs
            .iter()
            .filter(|run| &run.job_id == job_id)
            .cloned()
            .collect())
    }
}
