//! Costed calls made from job handlers against the monthly spend ledger.

mod fixtures;

use agent_dispatch::model::{period_key, SpendPeriod};
use agent_dispatch::{
    AgentSettings, CallSpec, Execution, HandlerRegistry, JobContext, JobError, Store,
};
use anyhow::Result;
use chrono::Utc;
use fixtures::{fast_config, harness, Harness};
use serde_json::{json, Value};

async fn draft(ctx: JobContext) -> Result<Value, JobError> {
    let outcome = ctx.call(CallSpec::new("You write follow-ups.", "lead: acme")).await?;
    Ok(json!({
        "model": outcome.model,
        "downgraded": outcome.downgraded,
        "output": outcome.output,
    }))
}

async fn setup() -> Result<Harness> {
    let registry = HandlerRegistry::builder()
        .agent("inbound_conversion", AgentSettings::default().critical())
        .agent("content_engine", AgentSettings::default())
        .handler_fn("inbound_conversion", "draft", draft)
        .handler_fn("content_engine", "draft", draft)
        .build()?;
    Ok(harness(fast_config(), registry).await)
}

async fn seed_spend(h: &Harness, spent: f64) {
    let mut period = SpendPeriod::new(period_key(Utc::now()), 500.0);
    period.spent_amount = spent;
    h.store.put_period(period).await;
}

async fn run_one(h: &Harness, agent: &str) -> Result<Execution> {
    h.runtime
        .fabric
        .dispatch(agent, "draft", json!({}), agent_dispatch::DispatchOptions::default().attempts(1))
        .await?;
    Ok(h.runtime
        .workers
        .process_next(agent)
        .await?
        .expect("job should be claimable"))
}

#[tokio::test]
async fn exhausted_budget_downgrades_critical_agents() -> Result<()> {
    let h = setup().await?;
    seed_spend(&h, 500.0).await;
    h.provider.push_ok("Hi Acme", 1_000, 200);

    match run_one(&h, "inbound_conversion").await? {
        Execution::Completed(result) => {
            assert_eq!(result["model"], "fallback");
            assert_eq!(result["downgraded"], true);
            assert_eq!(result["output"], "Hi Acme");
        }
        other => panic!("critical agent should still run, got {other:?}"),
    }
    let calls = h.provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].model, "fallback");
    Ok(())
}

#[tokio::test]
async fn exhausted_budget_rejects_other_agents_without_calling_out() -> Result<()> {
    let h = setup().await?;
    seed_spend(&h, 512.5).await;

    match run_one(&h, "content_engine").await? {
        Execution::Failed { error, retrying } => {
            assert!(!retrying);
            assert!(error.contains("monthly budget exhausted"), "{error}");
            assert!(error.contains("content_engine"), "{error}");
        }
        other => panic!("non-critical agent should be rejected, got {other:?}"),
    }
    assert!(h.provider.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn spend_is_recorded_and_the_first_crossing_alerts() -> Result<()> {
    let h = setup().await?;
    seed_spend(&h, 399.0).await;
    // 1M input units on the primary tier cost $3.00
    h.provider.push_ok("ok", 1_000_000, 0);
    h.provider.push_ok("ok", 1_000_000, 0);

    assert!(matches!(run_one(&h, "content_engine").await?, Execution::Completed(_)));
    let period = h
        .store
        .spend_period(&period_key(Utc::now()), 500.0)
        .await?;
    assert!((period.spent_amount - 402.0).abs() < 1e-9, "{}", period.spent_amount);
    assert!(period.alert_80_sent);

    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 1);
    assert!((runs[0].usage.cost_usd - 3.0).abs() < 1e-9);
    assert_eq!(runs[0].usage.input_units, 1_000_000);

    // A second call above the line does not alert again
    assert!(matches!(run_one(&h, "content_engine").await?, Execution::Completed(_)));
    let alerts = h.alerter.budget_alerts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("80%"), "{}", alerts[0]);
    Ok(())
}
