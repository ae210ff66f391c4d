//! Shared harness for integration tests: an in-memory runtime with recording
//! collaborators, so nothing leaves the process.
#![allow(dead_code)]

use agent_dispatch::testing::{RecordingAlerter, ScriptedProvider};
use agent_dispatch::{DispatchConfig, HandlerRegistry, MemoryStore, Runtime};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub runtime: Arc<Runtime>,
    pub store: Arc<MemoryStore>,
    pub alerter: Arc<RecordingAlerter>,
    pub provider: Arc<ScriptedProvider>,
}

/// Defaults with zero job backoff and fast idle polling
pub fn fast_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.retry.job_backoff_base_ms = 0;
    config.retry.provider_backoff_base_ms = 1;
    config.retry.provider_backoff_max_ms = 5;
    config.queue.poll_interval_ms = 20;
    config
}

pub async fn harness(config: DispatchConfig, registry: HandlerRegistry) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let alerter = Arc::new(RecordingAlerter::default());
    let provider = Arc::new(ScriptedProvider::default());
    let runtime = Runtime::builder(config)
        .registry(registry)
        .store(store.clone())
        .alerter(alerter.clone())
        .provider(provider.clone())
        .build()
        .await
        .expect("runtime builds");
    Harness {
        runtime: Arc::new(runtime),
        store,
        alerter,
        provider,
    }
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
