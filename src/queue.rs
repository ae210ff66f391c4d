//! Queue fabric: one durable, retryable queue per agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};

use crate::config::DispatchConfig;
use crate::dead_letter::DeadLetterRecorder;
use crate::error::{DispatchError, StoreError};
use crate::model::{BackoffPolicy, Job, JobId, JobState};
use crate::observability::dispatch_metrics;
use crate::store::Store;

/// Upper bound for a dispatch delay, a backoff base and any computed retry delay.
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Per-dispatch overrides of the default job policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    /// Do not run before this much time has passed
    pub delay_ms: Option<u64>,
    /// Reaction depth of the event that caused this dispatch
    #[serde(default)]
    pub depth: u32,
}

impl DispatchOptions {
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }
}

/// Returned by `dispatch`; lets callers observe the job's state.
#[derive(Clone)]
pub struct JobHandle {
    pub id: JobId,
    pub agent: String,
    pub job_type: String,
    store: Arc<dyn Store>,
}

impl JobHandle {
    pub async fn job(&self) -> Result<Option<Job>, StoreError> {
        self.store.get_job(&self.id).await
    }

    pub async fn state(&self) -> Result<Option<JobState>, StoreError> {
        Ok(self.job().await?.map(|job| job.state))
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("job_type", &self.job_type)
            .finish()
    }
}

/// Job outcome notifications, published independently of the worker pool.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Completed { job: Job },
    /// `job.state` is `Failed` when no retries remain, `Waiting` otherwise
    Failed { job: Job, error: String },
}

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl QueuePolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            attempts: config.retry.job_attempts,
            backoff: BackoffPolicy::Exponential {
                base_ms: config.retry.job_backoff_base_ms,
            },
            keep_completed: config.queue.keep_completed,
            keep_failed: config.queue.keep_failed,
        }
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

pub struct QueueFabric {
    store: Arc<dyn Store>,
    /// Known agents and the wake-up signal for their workers
    queues: HashMap<String, Arc<Notify>>,
    policy: QueuePolicy,
    events: broadcast::Sender<JobEvent>,
    dead_letters: DeadLetterRecorder,
}

impl QueueFabric {
    pub fn new<I, S>(store: Arc<dyn Store>, agents: I, policy: QueuePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queues = agents
            .into_iter()
            .map(|agent| (agent.into(), Arc::new(Notify::new())))
            .collect();
        let (events, _) = broadcast::channel(1024);
        Self {
            dead_letters: DeadLetterRecorder::new(store.clone()),
            store,
            queues,
            policy,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn has_queue(&self, agent: &str) -> bool {
        self.queues.contains_key(agent)
    }

    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn dead_letters(&self) -> &DeadLetterRecorder {
        &self.dead_letters
    }

    /// Job outcomes for observers. Best effort: a lagging receiver misses
    /// events, dead letters do not depend on it.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn waker(&self, agent: &str) -> Option<Arc<Notify>> {
        self.queues.get(agent).cloned()
    }

    /// Enqueue one job on `agent`'s queue.
    ///
    /// An unknown agent is a configuration error and nothing is enqueued.
    pub async fn dispatch(
        &self,
        agent: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: DispatchOptions,
    ) -> Result<JobHandle, DispatchError> {
        let Some(waker) = self.queues.get(agent) else {
            warn!(agent, job_type, "Dispatch to unknown agent rejected");
            return Err(DispatchError::UnknownAgent(agent.to_string()));
        };

        let attempts = options.attempts.unwrap_or(self.policy.attempts);
        if attempts == 0 {
            return Err(DispatchError::InvalidOptions(
                "attempts must be at least 1".to_string(),
            ));
        }

        let backoff = options.backoff.unwrap_or(self.policy.backoff);
        if backoff.delay_after(1) > MAX_SCHEDULE_DELAY {
            return Err(DispatchError::InvalidOptions(format!(
                "backoff must not exceed {}s",
                MAX_SCHEDULE_DELAY.as_secs()
            )));
        }

        let now = Utc::now();
        let run_at = match options.delay_ms.map(Duration::from_millis) {
            Some(delay) if delay > MAX_SCHEDULE_DELAY => {
                return Err(DispatchError::InvalidOptions(format!(
                    "delay must not exceed {}s",
                    MAX_SCHEDULE_DELAY.as_secs()
                )));
            }
            Some(delay) => schedule_after(now, delay),
            None => now,
        };
        let job = Job {
            id: JobId::new(),
            queue: agent.to_string(),
            job_type: job_type.to_string(),
            payload,
            attempts_made: 0,
            max_attempts: attempts,
            backoff,
            state: JobState::Waiting,
            depth: options.depth,
            run_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.store.enqueue(&job).await?;
        dispatch_metrics().record_dispatch();
        info!(
            agent,
            job_type,
            job_id = %job.id,
            max_attempts = job.max_attempts,
            depth = job.depth,
            "Job dispatched"
        );
        waker.notify_one();

        Ok(JobHandle {
            id: job.id,
            agent: agent.to_string(),
            job_type: job_type.to_string(),
            store: self.store.clone(),
        })
    }

    /// Whether `agent` has a job that `claim` would take right now.
    pub async fn has_runnable(&self, agent: &str) -> Result<bool, StoreError> {
        self.store.has_runnable(agent, Utc::now()).await
    }

    /// Claim the next runnable job of `agent`, counting the attempt.
    pub async fn claim(&self, agent: &str) -> Result<Option<Job>, StoreError> {
        self.store.claim_next(agent, Utc::now()).await
    }

    pub async fn complete(&self, job: &Job) -> Result<Job, StoreError> {
        let done = self.store.complete_job(&job.id, Utc::now()).await?;
        self.publish(JobEvent::Completed { job: done.clone() });
        self.prune(&done.queue).await;
        Ok(done)
    }

    /// Record a failed attempt: schedule a retry with backoff while attempts
    /// remain, otherwise fail the job terminally.
    pub async fn fail(&self, job: &Job, error: &str) -> Result<Job, StoreError> {
        self.fail_at(job, error, Utc::now()).await
    }

    async fn fail_at(&self, job: &Job, error: &str, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let retry_at = if job.has_attempts_left() {
            Some(schedule_after(now, job.backoff.delay_after(job.attempts_made)))
        } else {
            None
        };

        let failed = self.store.fail_job(&job.id, error, retry_at, now).await?;
        match retry_at {
            Some(at) => {
                dispatch_metrics().record_retry();
                info!(
                    job_id = %failed.id,
                    agent = %failed.queue,
                    attempt = failed.attempts_made,
                    max_attempts = failed.max_attempts,
                    retry_at = %at,
                    "Job attempt failed, retry scheduled"
                );
                self.wake_at(&failed.queue, at, now);
            }
            None => {
                warn!(
                    job_id = %failed.id,
                    agent = %failed.queue,
                    attempts = failed.attempts_made,
                    "Job failed terminally"
                );
                // Reconciled on the next start if this write fails
                if let Err(e) = self.dead_letters.record(&failed, error).await {
                    error!(job_id = %failed.id, error = %e, "Failed to record dead letter");
                }
            }
        }

        self.publish(JobEvent::Failed {
            job: failed.clone(),
            error: error.to_string(),
        });
        if failed.state == JobState::Failed {
            self.prune(&failed.queue).await;
        }
        Ok(failed)
    }

    /// Return jobs a dead process left `active` to the queue, or fail them
    /// terminally when they have no attempts left.
    pub async fn recover_stalled(&self, agent: &str) -> Result<usize, StoreError> {
        let stalled = self.store.active_jobs(agent).await?;
        let count = stalled.len();
        for job in stalled {
            warn!(job_id = %job.id, agent, attempts = job.attempts_made, "Recovering stalled job");
            let now = Utc::now();
            if job.has_attempts_left() {
                self.store
                    .fail_job(&job.id, "stalled: worker stopped mid-job", Some(now), now)
                    .await?;
            } else {
                self.fail_at(&job, "stalled: worker stopped mid-job", now)
                    .await?;
            }
        }
        if count > 0 {
            if let Some(waker) = self.queues.get(agent) {
                waker.notify_waiters();
            }
        }
        Ok(count)
    }

    fn publish(&self, event: JobEvent) {
        // No receivers is fine: nobody is listening yet
        let _ = self.events.send(event);
    }

    fn wake_at(&self, agent: &str, at: DateTime<Utc>, now: DateTime<Utc>) {
        let Some(waker) = self.queues.get(agent).cloned() else {
            return;
        };
        let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            waker.notify_one();
        });
    }

    async fn prune(&self, agent: &str) {
        match self
            .store
            .prune_terminal(agent, self.policy.keep_completed, self.policy.keep_failed)
            .await
        {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(agent, removed, "Pruned terminal job history"),
            Err(e) => warn!(agent, error = %e, "Failed to prune job history"),
        }
    }
}

/// `now + delay`, with `delay` capped at [`MAX_SCHEDULE_DELAY`].
fn schedule_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay.min(MAX_SCHEDULE_DELAY))
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}
