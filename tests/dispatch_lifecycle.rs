//! Job lifecycle across the queue fabric, worker pool and dead-letter path.

mod fixtures;

use agent_dispatch::{
    AgentSettings, DispatchOptions, Execution, HandlerRegistry, JobContext, JobError, JobState,
    ShutdownCoordinator, Store,
};
use anyhow::Result;
use chrono::Utc;
use fixtures::{eventually, fast_config, harness};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn unknown_job_type_exhausts_retries_and_is_dead_lettered_once() -> Result<()> {
    let registry = HandlerRegistry::builder()
        .agent("seo_demand_capture", AgentSettings::default())
        .build()?;
    let h = harness(fast_config(), registry).await;

    let handle = h
        .runtime
        .fabric
        .dispatch(
            "seo_demand_capture",
            "nonexistent_type",
            json!({"keyword": "rust"}),
            DispatchOptions::default(),
        )
        .await?;

    for attempt in 1..=3u32 {
        let execution = h
            .runtime
            .workers
            .process_next("seo_demand_capture")
            .await?
            .expect("job should be claimable");
        match execution {
            Execution::Failed { error, retrying } => {
                assert!(error.contains("nonexistent_type"), "attempt {attempt}: {error}");
                assert_eq!(retrying, attempt < 3, "attempt {attempt}");
            }
            other => panic!("attempt {attempt} unexpectedly {other:?}"),
        }
    }
    assert!(h.runtime.workers.process_next("seo_demand_capture").await?.is_none());

    let job = handle.job().await?.expect("job kept");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);

    // Written as part of the final failure, not after it
    let dead = h.store.dead_letters().await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, handle.id);
    assert_eq!(dead[0].attempts_made, 3);

    // Every attempt left a failure record; the third failure in a row alerted
    let runs = h.store.runs_for(&handle.id).await?;
    assert_eq!(runs.len(), 3);
    assert_eq!(h.alerter.failure_alerts().len(), 1);
    Ok(())
}

#[tokio::test]
async fn job_failing_during_shutdown_drain_is_dead_lettered() -> Result<()> {
    let registry = HandlerRegistry::builder()
        .agent("inbound_conversion", AgentSettings::default())
        .handler_fn("inbound_conversion", "slow_sync", |_ctx: JobContext| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Err::<Value, _>(JobError::Handler("crm rejected the record".into()))
        })
        .build()?;
    let h = harness(fast_config(), registry).await;

    let shutdown = ShutdownCoordinator::new();
    let handles = h.runtime.start(shutdown.subscribe()).await;
    let handle = h
        .runtime
        .fabric
        .dispatch(
            "inbound_conversion",
            "slow_sync",
            json!({}),
            DispatchOptions::default().attempts(1),
        )
        .await?;

    let running = eventually(Duration::from_secs(2), || {
        let handle = handle.clone();
        async move { matches!(handle.state().await, Ok(Some(JobState::Active))) }
    })
    .await;
    assert!(running, "job should be picked up");

    // Shutdown starts while the final attempt is still in flight
    shutdown.drain(handles, Duration::from_secs(2)).await;

    assert_eq!(handle.state().await?, Some(JobState::Failed));
    let dead = h.store.dead_letters().await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, handle.id);
    assert_eq!(dead[0].error, "handler failed: crm rejected the record");
    Ok(())
}

#[tokio::test]
async fn failure_bursts_beyond_the_event_buffer_keep_every_dead_letter() -> Result<()> {
    let registry = HandlerRegistry::builder()
        .agent("seo_demand_capture", AgentSettings::default())
        .build()?;
    let h = harness(fast_config(), registry).await;
    // Subscribed but never read, so the event channel lags
    let _stalled = h.runtime.fabric.subscribe();

    for page in 0..1100 {
        h.runtime
            .fabric
            .dispatch(
                "seo_demand_capture",
                "nonexistent_type",
                json!({ "page": page }),
                DispatchOptions::default().attempts(1),
            )
            .await?;
        h.runtime.workers.process_next("seo_demand_capture").await?;
    }

    let dead = h.store.dead_letters().await?;
    assert_eq!(dead.len(), 1100);
    Ok(())
}

#[tokio::test]
async fn start_fills_in_dead_letters_a_previous_process_missed() -> Result<()> {
    let registry = HandlerRegistry::builder()
        .agent("inbound_conversion", AgentSettings::default())
        .build()?;
    let h = harness(fast_config(), registry).await;

    let handle = h
        .runtime
        .fabric
        .dispatch(
            "inbound_conversion",
            "ping",
            json!({}),
            DispatchOptions::default().attempts(1),
        )
        .await?;
    // A previous process failed it for good and died before the dead letter
    let claimed = h
        .store
        .claim_next("inbound_conversion", Utc::now())
        .await?
        .expect("claimable");
    h.store
        .fail_job(&claimed.id, "upstream 502", None, Utc::now())
        .await?;
    assert!(h.store.dead_letters().await?.is_empty());

    let shutdown = ShutdownCoordinator::new();
    let handles = h.runtime.start(shutdown.subscribe()).await;
    shutdown.drain(handles, Duration::from_secs(2)).await;

    let dead = h.store.dead_letters().await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, handle.id);
    assert_eq!(dead[0].error, "upstream 502");
    Ok(())
}

#[derive(Deserialize)]
struct SyncRequest {
    fail: bool,
}

async fn flaky(ctx: JobContext) -> Result<Value, JobError> {
    let request: SyncRequest = ctx.payload_as()?;
    if request.fail {
        Err(JobError::Transient("upstream timeout".into()))
    } else {
        Ok(json!({"ok": true}))
    }
}

#[tokio::test]
async fn success_resets_the_failure_streak() -> Result<()> {
    let registry = HandlerRegistry::builder()
        .agent("inbound_conversion", AgentSettings::default())
        .handler_fn("inbound_conversion", "sync_crm", flaky)
        .build()?;
    let h = harness(fast_config(), registry).await;
    let fabric = h.runtime.fabric.clone();

    for fail in [true, true, false, true, true] {
        fabric
            .dispatch(
                "inbound_conversion",
                "sync_crm",
                json!({ "fail": fail }),
                DispatchOptions::default().attempts(1),
            )
            .await?;
        h.runtime.workers.process_next("inbound_conversion").await?;
    }
    assert!(h.alerter.failure_alerts().is_empty());
    assert_eq!(
        h.runtime.guardrail.failures().streak("inbound_conversion").count,
        2
    );

    fabric
        .dispatch(
            "inbound_conversion",
            "sync_crm",
            json!({ "fail": true }),
            DispatchOptions::default().attempts(1),
        )
        .await?;
    h.runtime.workers.process_next("inbound_conversion").await?;
    let alerts = h.alerter.failure_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].consecutive_failures, 3);
    assert_eq!(alerts[0].error, "transient failure: upstream timeout");
    Ok(())
}

#[tokio::test]
async fn running_pool_completes_jobs_and_broadcasts() -> Result<()> {
    let registry = HandlerRegistry::builder()
        .agent("inbound_conversion", AgentSettings::default())
        .build()?;
    let h = harness(fast_config(), registry).await;
    let (_guard, mut frames) = h.runtime.broadcaster.subscribe(16);

    let shutdown = ShutdownCoordinator::new();
    let handles = h.runtime.start(shutdown.subscribe()).await;

    let handle = h
        .runtime
        .fabric
        .dispatch(
            "inbound_conversion",
            agent_dispatch::PING_JOB_TYPE,
            json!({"hello": "world"}),
            DispatchOptions::default(),
        )
        .await?;

    let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await?
        .expect("frame");
    assert_eq!(frame.event, "job.completed");
    assert_eq!(frame.data["id"], json!(handle.id));
    assert_eq!(handle.state().await?, Some(JobState::Completed));

    shutdown.drain(handles, Duration::from_secs(2)).await;
    Ok(())
}

#[tokio::test]
async fn concurrency_ceiling_bounds_in_flight_jobs() -> Result<()> {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let (in_flight_h, peak_h, done_h) = (in_flight.clone(), peak.clone(), done.clone());
    let registry = HandlerRegistry::builder()
        .agent(
            "seo_demand_capture",
            AgentSettings {
                rate_limit_max: 100,
                ..AgentSettings::default().with_concurrency(2)
            },
        )
        .handler_fn("seo_demand_capture", "crawl", move |_ctx: JobContext| {
            let (in_flight, peak, done) = (in_flight_h.clone(), peak_h.clone(), done_h.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, JobError>(Value::Null)
            }
        })
        .build()?;
    let h = harness(fast_config(), registry).await;

    for page in 0..6 {
        h.runtime
            .fabric
            .dispatch("seo_demand_capture", "crawl", json!({ "page": page }), DispatchOptions::default())
            .await?;
    }

    let shutdown = ShutdownCoordinator::new();
    let handles = h.runtime.start(shutdown.subscribe()).await;
    let finished = eventually(Duration::from_secs(5), || {
        let done = done.clone();
        async move { done.load(Ordering::SeqCst) == 6 }
    })
    .await;
    shutdown.drain(handles, Duration::from_secs(2)).await;

    assert!(finished, "all jobs should run");
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak in-flight was {peak}");
    Ok(())
}

#[tokio::test]
async fn stalled_job_is_recovered_on_start() -> Result<()> {
    let registry = HandlerRegistry::builder()
        .agent("inbound_conversion", AgentSettings::default())
        .build()?;
    let h = harness(fast_config(), registry).await;

    let handle = h
        .runtime
        .fabric
        .dispatch("inbound_conversion", "ping", json!({}), DispatchOptions::default())
        .await?;
    // A previous process claimed it and died
    let claimed = h.store.claim_next("inbound_conversion", Utc::now()).await?;
    assert!(claimed.is_some());

    let shutdown = ShutdownCoordinator::new();
    let handles = h.runtime.start(shutdown.subscribe()).await;
    let completed = eventually(Duration::from_secs(2), || {
        let handle = handle.clone();
        async move { matches!(handle.state().await, Ok(Some(JobState::Completed))) }
    })
    .await;
    shutdown.drain(handles, Duration::from_secs(2)).await;

    assert!(completed);
    let job = handle.job().await?.expect("job kept");
    assert_eq!(job.attempts_made, 2);
    Ok(())
}
