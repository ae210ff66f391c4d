//! Records jobs that exhausted their retries.
//!
//! The queue fabric hands every terminal failure to the recorder before it
//! publishes the outcome or prunes history, so the write does not depend on
//! any subscriber keeping up or on the worker that ran the job. Failed jobs a
//! crash left without a record are swept up by [`DeadLetterRecorder::reconcile`]
//! on start.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::model::{DeadLetter, Job, JobState, Notification, NotificationKind};
use crate::observability::dispatch_metrics;
use crate::store::Store;

#[derive(Clone)]
pub struct DeadLetterRecorder {
    store: Arc<dyn Store>,
}

impl DeadLetterRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns true when this call wrote a new dead letter.
    ///
    /// Only terminal failures on the final attempt qualify. Repeats for the
    /// same job are no-ops.
    pub async fn record(&self, job: &Job, error: &str) -> Result<bool, StoreError> {
        if job.state != JobState::Failed || !job.is_exhausted() {
            return Ok(false);
        }

        let dead_letter = DeadLetter {
            job_id: job.id.clone(),
            agent: job.queue.clone(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempts_made: job.attempts_made,
            error: error.to_string(),
            failed_at: job.updated_at,
        };
        if !self.store.record_dead_letter(&dead_letter).await? {
            return Ok(false);
        }

        dispatch_metrics().record_dead_letter();
        warn!(
            job_id = %job.id,
            agent = %job.queue,
            job_type = %job.job_type,
            attempts = job.attempts_made,
            error = %error,
            "Job dead-lettered"
        );

        let notification = Notification {
            kind: NotificationKind::DeadLetter,
            agent: Some(job.queue.clone()),
            title: format!("{} job {} failed permanently", job.queue, job.job_type),
            body: format!("after {} attempts: {}", job.attempts_made, error),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_notification(&notification).await {
            warn!(job_id = %job.id, error = %e, "Could not persist dead-letter notification");
        }
        Ok(true)
    }

    /// Write the dead letters missing for `agent`'s exhausted failed jobs.
    pub async fn reconcile(&self, agent: &str) -> Result<usize, StoreError> {
        let mut written = 0;
        for job in self.store.missing_dead_letters(agent).await? {
            let error = job.last_error.as_deref().unwrap_or("unknown error");
            if self.record(&job, error).await? {
                written += 1;
            }
        }
        if written > 0 {
            info!(agent, written, "Reconciled missing dead letters");
        }
        Ok(written)
    }
}
