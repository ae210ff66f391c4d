//! Worker pool: per-agent job execution with bounded concurrency and a
//! per-agent start rate.

use chrono::Utc;
use futures::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use serde_json::json;
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::broadcast::Broadcaster;
use crate::config::AgentSettings;
use crate::error::{JobError, StoreError};
use crate::events::EventBus;
use crate::guardrail::{GuardrailExecutor, GuardrailService};
use crate::handler::{HandlerRegistry, JobContext};
use crate::model::{Job, RunRecord, RunStatus};
use crate::observability::{dispatch_metrics, OperationTimer};
use crate::queue::QueueFabric;
use crate::telemetry::create_dispatch_span;

/// What happened to one claimed job
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Completed(serde_json::Value),
    /// `retrying` is false when this was the last attempt
    Failed { error: String, retrying: bool },
}

pub struct WorkerPool {
    fabric: Arc<QueueFabric>,
    registry: Arc<HandlerRegistry>,
    guardrail: Arc<GuardrailService>,
    executor: Arc<GuardrailExecutor>,
    events: Arc<EventBus>,
    broadcaster: Arc<Broadcaster>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        fabric: Arc<QueueFabric>,
        registry: Arc<HandlerRegistry>,
        executor: Arc<GuardrailExecutor>,
        events: Arc<EventBus>,
        broadcaster: Arc<Broadcaster>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            fabric,
            registry,
            guardrail: executor.service().clone(),
            executor,
            events,
            broadcaster,
            poll_interval,
        }
    }

    /// Recover stalled jobs, then start `concurrency` workers per agent.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (agent, settings) in self.registry.agents() {
            match self.fabric.recover_stalled(agent).await {
                Ok(0) => {}
                Ok(recovered) => info!(agent, recovered, "Recovered stalled jobs"),
                Err(e) => error!(agent, error = %e, "Stalled job recovery failed"),
            }

            let limiter = Arc::new(rate_limiter(settings));
            for slot in 0..settings.concurrency {
                let pool = Arc::clone(self);
                let agent = agent.to_string();
                let limiter = limiter.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    pool.run_worker(agent, slot, limiter, shutdown).await;
                }));
            }
            info!(agent, concurrency = settings.concurrency, "Agent workers started");
        }
        handles
    }

    async fn run_worker(
        &self,
        agent: String,
        slot: usize,
        limiter: Arc<DefaultDirectRateLimiter>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(waker) = self.fabric.waker(&agent) else {
            error!(agent, "No queue for agent, worker exiting");
            return;
        };
        debug!(agent, slot, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.fabric.has_runnable(&agent).await {
                Ok(true) => {
                    // Claiming counts the attempt, so hold a start slot first
                    tokio::select! {
                        _ = limiter.until_ready() => {}
                        _ = shutdown.changed() => break,
                    }
                    match self.fabric.claim(&agent).await {
                        Ok(Some(job)) => {
                            self.execute(job).await;
                        }
                        // Taken by a sibling worker
                        Ok(None) => {}
                        Err(e) => error!(agent, slot, error = %e, "Failed to claim job"),
                    }
                    continue;
                }
                Ok(false) => {}
                Err(e) => error!(agent, slot, error = %e, "Failed to check queue"),
            }

            let idle = self.poll_interval + jitter(self.poll_interval);
            tokio::select! {
                _ = waker.notified() => {}
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(agent, slot, "Worker stopped");
    }

    /// Claim and run one job of `agent`, bypassing the rate limiter.
    pub async fn process_next(&self, agent: &str) -> Result<Option<Execution>, StoreError> {
        match self.fabric.claim(agent).await? {
            Some(job) => Ok(Some(self.execute(job).await)),
            None => Ok(None),
        }
    }

    async fn execute(&self, job: Job) -> Execution {
        let span = create_dispatch_span(&job.queue, &job.job_type, &job.id.0, job.attempts_made);
        self.execute_inner(job).instrument(span).await
    }

    async fn execute_inner(&self, job: Job) -> Execution {
        let timer = OperationTimer::new("job_attempt");
        let ctx = JobContext::new(job.clone(), self.executor.clone(), self.events.clone());

        let result = match self.registry.resolve(&job.queue, &job.job_type) {
            Ok(handler) => AssertUnwindSafe(handler.run(ctx.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(JobError::Handler("handler panicked".to_string()))),
            Err(e) => Err(e),
        };
        let duration_ms = timer.finish();
        let usage = ctx.usage();

        match result {
            Ok(output) => {
                if let Err(e) = self.fabric.complete(&job).await {
                    error!(job_id = %job.id, error = %e, "Could not mark job completed");
                }
                dispatch_metrics().record_completion();
                self.guardrail.record_job_success(&job.queue);
                self.record_run(&job, RunStatus::Completed, usage, duration_ms, None)
                    .await;
                info!(
                    job_id = %job.id,
                    agent = %job.queue,
                    job_type = %job.job_type,
                    attempt = job.attempts_made,
                    duration_ms,
                    cost_usd = usage.cost_usd,
                    "Job completed"
                );
                self.broadcaster.broadcast(
                    "job.completed",
                    json!({
                        "id": job.id,
                        "agent": job.queue,
                        "job_type": job.job_type,
                        "attempt": job.attempts_made,
                        "duration_ms": duration_ms,
                    }),
                );
                Execution::Completed(output)
            }
            Err(err) => {
                let error = err.to_string();
                dispatch_metrics().record_failed_attempt();
                warn!(
                    job_id = %job.id,
                    agent = %job.queue,
                    job_type = %job.job_type,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    transient = err.is_transient(),
                    error = %error,
                    "Job attempt failed"
                );

                let retrying = match self.fabric.fail(&job, &error).await {
                    Ok(failed) => !failed.state.is_terminal(),
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Could not mark job failed");
                        job.has_attempts_left()
                    }
                };
                self.record_run(&job, RunStatus::Failed, usage, duration_ms, Some(error.clone()))
                    .await;
                self.guardrail
                    .record_job_failure(&job.queue, &job.job_type, &error)
                    .await;
                self.broadcaster.broadcast(
                    "job.failed",
                    json!({
                        "id": job.id,
                        "agent": job.queue,
                        "job_type": job.job_type,
                        "attempt": job.attempts_made,
                        "retrying": retrying,
                        "error": error,
                    }),
                );
                Execution::Failed { error, retrying }
            }
        }
    }

    async fn record_run(
        &self,
        job: &Job,
        status: RunStatus,
        usage: crate::model::Usage,
        duration_ms: u64,
        error: Option<String>,
    ) {
        let record = RunRecord {
            job_id: job.id.clone(),
            agent: job.queue.clone(),
            job_type: job.job_type.clone(),
            status,
            attempt: job.attempts_made,
            usage,
            duration_ms,
            error,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.fabric.store().record_run(&record).await {
            warn!(job_id = %job.id, error = %e, "Could not persist run record");
        }
    }
}

/// At most `rate_limit_max` job starts per window, bursting up to the max.
fn rate_limiter(settings: &AgentSettings) -> DefaultDirectRateLimiter {
    let max = NonZeroU32::new(settings.rate_limit_max.max(1)).unwrap_or(NonZeroU32::MIN);
    let period = settings.rate_window() / max.get();
    let quota = Quota::with_period(period.max(Duration::from_millis(1)))
        .unwrap_or_else(|| Quota::per_second(max))
        .allow_burst(max);
    RateLimiter::direct(quota)
}

fn jitter(interval: Duration) -> Duration {
    let max_ms = (interval.as_millis() as u64 / 10).max(1);
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::handler::CallSpec;
    use crate::model::JobState;
    use crate::queue::{DispatchOptions, QueuePolicy};
    use crate::store::{MemoryStore, Store};
    use crate::testing::{RecordingAlerter, ScriptedProvider};
    use std::collections::HashSet;

    struct Fixture {
        store: Arc<MemoryStore>,
        alerter: Arc<RecordingAlerter>,
        provider: Arc<ScriptedProvider>,
        fabric: Arc<QueueFabric>,
        pool: WorkerPool,
    }

    fn fixture() -> Fixture {
        let config = DispatchConfig::default();
        let registry = HandlerRegistry::builder()
            .agent("inbound_conversion", AgentSettings::default())
            .handler_fn("inbound_conversion", "draft_reply", |ctx: JobContext| async move {
                let outcome = ctx.call(CallSpec::new("Be brief.", "hi")).await?;
                Ok::<_, JobError>(json!({ "reply": outcome.output }))
            })
            .handler_fn("inbound_conversion", "explode", |_ctx: JobContext| async move {
                Err::<serde_json::Value, _>(JobError::Handler("exploded".into()))
            })
            .build()
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let alerter = Arc::new(RecordingAlerter::default());
        let provider = Arc::new(ScriptedProvider::default());
        let service = Arc::new(GuardrailService::new(
            &config,
            store.clone(),
            alerter.clone(),
            HashSet::new(),
        ));
        let executor = Arc::new(GuardrailExecutor::new(&config, service, provider.clone()));
        let fabric = Arc::new(QueueFabric::new(
            store.clone(),
            ["inbound_conversion"],
            QueuePolicy::default(),
        ));
        let events = Arc::new(EventBus::new(store.clone(), 8));
        let pool = WorkerPool::new(
            fabric.clone(),
            Arc::new(registry),
            executor,
            events,
            Arc::new(Broadcaster::new()),
            Duration::from_millis(50),
        );
        Fixture {
            store,
            alerter,
            provider,
            fabric,
            pool,
        }
    }

    #[tokio::test]
    async fn success_records_usage_and_completes() {
        let f = fixture();
        f.provider.push_ok("hello there", 100, 20);
        let handle = f
            .fabric
            .dispatch("inbound_conversion", "draft_reply", json!({}), DispatchOptions::default())
            .await
            .unwrap();

        let execution = f.pool.process_next("inbound_conversion").await.unwrap().unwrap();
        assert_eq!(execution, Execution::Completed(json!({"reply": "hello there"})));
        assert_eq!(handle.state().await.unwrap(), Some(JobState::Completed));

        let runs = f.store.runs_for(&handle.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].usage.input_units, 100);
        assert_eq!(runs[0].usage.output_units, 20);
        assert!(runs[0].usage.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn failures_retry_and_count_toward_the_streak() {
        let f = fixture();
        let handle = f
            .fabric
            .dispatch("inbound_conversion", "explode", json!({}), DispatchOptions::default())
            .await
            .unwrap();

        let execution = f.pool.process_next("inbound_conversion").await.unwrap().unwrap();
        assert_eq!(
            execution,
            Execution::Failed {
                error: "handler failed: exploded".into(),
                retrying: true
            }
        );
        assert_eq!(handle.state().await.unwrap(), Some(JobState::Waiting));
        assert_eq!(f.pool.guardrail.failures().streak("inbound_conversion").count, 1);
        assert!(f.alerter.failure_alerts().is_empty());

        let runs = f.store.runs_for(&handle.id).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("handler failed: exploded"));
    }

    #[tokio::test]
    async fn unknown_job_type_fails_the_attempt() {
        let f = fixture();
        f.fabric
            .dispatch("inbound_conversion", "nonexistent_type", json!({}), DispatchOptions::default())
            .await
            .unwrap();

        let execution = f.pool.process_next("inbound_conversion").await.unwrap().unwrap();
        match execution {
            Execution::Failed { error, retrying } => {
                assert!(error.contains("nonexistent_type"));
                assert!(retrying);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let config = DispatchConfig::default();
        let registry = HandlerRegistry::builder()
            .agent("a", AgentSettings::default())
            .handler_fn("a", "boom", |ctx: JobContext| async move {
                if ctx.job().depth == 0 {
                    panic!("handler bug");
                }
                Ok::<_, JobError>(json!(null))
            })
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(GuardrailService::new(
            &config,
            store.clone(),
            Arc::new(RecordingAlerter::default()),
            HashSet::new(),
        ));
        let executor = Arc::new(GuardrailExecutor::new(
            &config,
            service,
            Arc::new(ScriptedProvider::default()),
        ));
        let fabric = Arc::new(QueueFabric::new(store.clone(), ["a"], QueuePolicy::default()));
        let pool = WorkerPool::new(
            fabric.clone(),
            Arc::new(registry),
            executor,
            Arc::new(EventBus::new(store.clone(), 8)),
            Arc::new(Broadcaster::new()),
            Duration::from_millis(50),
        );
        fabric
            .dispatch("a", "boom", json!({}), DispatchOptions::default())
            .await
            .unwrap();

        let execution = pool.process_next("a").await.unwrap().unwrap();
        assert!(matches!(execution, Execution::Failed { ref error, .. } if error.contains("panicked")));
    }

    #[tokio::test]
    async fn rate_limited_jobs_stay_unclaimed_until_a_slot_frees() {
        let config = DispatchConfig::default();
        let settings = AgentSettings {
            concurrency: 1,
            rate_limit_max: 1,
            rate_limit_window_ms: 3_600_000,
            ..AgentSettings::default()
        };
        let registry = HandlerRegistry::builder()
            .agent("a", settings)
            .handler_fn("a", "noop", |_ctx: JobContext| async move { Ok::<_, JobError>(json!(null)) })
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(GuardrailService::new(
            &config,
            store.clone(),
            Arc::new(RecordingAlerter::default()),
            HashSet::new(),
        ));
        let executor = Arc::new(GuardrailExecutor::new(
            &config,
            service,
            Arc::new(ScriptedProvider::default()),
        ));
        let fabric = Arc::new(QueueFabric::new(store.clone(), ["a"], QueuePolicy::default()));
        let pool = Arc::new(WorkerPool::new(
            fabric.clone(),
            Arc::new(registry),
            executor,
            Arc::new(EventBus::new(store.clone(), 8)),
            Arc::new(Broadcaster::new()),
            Duration::from_millis(20),
        ));
        let first = fabric
            .dispatch("a", "noop", json!({}), DispatchOptions::default())
            .await
            .unwrap();
        let second = fabric
            .dispatch("a", "noop", json!({}), DispatchOptions::default())
            .await
            .unwrap();

        let (stop, shutdown) = watch::channel(false);
        let handles = pool.start(shutdown).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while first.state().await.unwrap() != Some(JobState::Completed) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("first job should run");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Stopping while the worker waits for a slot must not cost an attempt
        stop.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("worker should stop while rate limited")
                .unwrap();
        }
        let job = second.job().await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
    }

    #[test]
    fn rate_limiter_allows_burst_up_to_max() {
        let settings = AgentSettings {
            rate_limit_max: 2,
            rate_limit_window_ms: 60_000,
            ..AgentSettings::default()
        };
        let limiter = rate_limiter(&settings);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
