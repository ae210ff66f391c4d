//! In-process domain event bus.
//!
//! Emitting an event records it best-effort, then runs every subscriber in
//! registration order. Each subscriber runs in its own task so an error or a
//! panic in one reaction never reaches the emitter or the other reactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn, Instrument};

use crate::broadcast::Broadcaster;
use crate::model::EventRecord;
use crate::queue::{DispatchOptions, QueueFabric};
use crate::store::Store;
use crate::telemetry::{create_event_span, generate_correlation_id};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub name: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// 0 for events from outside; +1 for each event -> job -> event hop
    pub depth: u32,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: DomainEvent) -> anyhow::Result<()>;
}

pub struct FnEventHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: DomainEvent) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Enqueues a job carrying the event payload
struct DispatchReaction {
    fabric: Arc<QueueFabric>,
    agent: String,
    job_type: String,
}

#[async_trait]
impl EventHandler for DispatchReaction {
    async fn handle(&self, event: DomainEvent) -> anyhow::Result<()> {
        self.fabric
            .dispatch(
                &self.agent,
                &self.job_type,
                event.payload,
                DispatchOptions::default().depth(event.depth),
            )
            .await?;
        Ok(())
    }
}

/// Pushes the event to live observers
struct BroadcastReaction {
    broadcaster: Arc<Broadcaster>,
}

#[async_trait]
impl EventHandler for BroadcastReaction {
    async fn handle(&self, event: DomainEvent) -> anyhow::Result<()> {
        self.broadcaster.broadcast(&event.name, event.payload);
        Ok(())
    }
}

/// Outcome of one `emit`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitReport {
    pub delivered: usize,
    pub failed: usize,
    /// The event was past the reaction depth bound and nobody saw it
    pub suppressed: bool,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    store: Arc<dyn Store>,
    max_depth: u32,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>, max_depth: u32) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            store,
            max_depth,
        }
    }

    pub fn subscribe(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let name = name.into();
        debug!(event = %name, "Event subscriber registered");
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name)
            .or_default()
            .push(handler);
    }

    pub fn subscribe_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(name, Arc::new(FnEventHandler(f)));
    }

    /// React to `name` by dispatching `job_type` to `agent` with the event payload.
    pub fn dispatch_on(
        &self,
        name: impl Into<String>,
        fabric: Arc<QueueFabric>,
        agent: impl Into<String>,
        job_type: impl Into<String>,
    ) {
        self.subscribe(
            name,
            Arc::new(DispatchReaction {
                fabric,
                agent: agent.into(),
                job_type: job_type.into(),
            }),
        );
    }

    /// React to `name` by pushing it to every live observer.
    pub fn broadcast_on(&self, name: impl Into<String>, broadcaster: Arc<Broadcaster>) {
        self.subscribe(name, Arc::new(BroadcastReaction { broadcaster }));
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, Vec::len)
    }

    pub async fn emit(&self, name: &str, data: serde_json::Value) -> EmitReport {
        self.emit_with_depth(name, data, 0).await
    }

    pub async fn emit_with_depth(&self, name: &str, data: serde_json::Value, depth: u32) -> EmitReport {
        if depth > self.max_depth {
            warn!(
                event = name,
                depth,
                max_depth = self.max_depth,
                "Reaction chain too deep, event suppressed"
            );
            return EmitReport {
                suppressed: true,
                ..EmitReport::default()
            };
        }

        let event = DomainEvent {
            name: name.to_string(),
            payload: data,
            timestamp: Utc::now(),
            depth,
        };
        let span = create_event_span(name, depth, &generate_correlation_id());
        self.deliver(event).instrument(span).await
    }

    async fn deliver(&self, event: DomainEvent) -> EmitReport {
        let record = EventRecord {
            name: event.name.clone(),
            payload: event.payload.clone(),
            depth: event.depth,
            emitted_at: event.timestamp,
        };
        if let Err(e) = self.store.record_event(&record).await {
            warn!(event = %event.name, error = %e, "Could not record domain event");
        }

        // Snapshot so subscribers may subscribe further without deadlocking
        let handlers = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.name)
            .cloned()
            .unwrap_or_default();

        let mut report = EmitReport::default();
        for (index, handler) in handlers.into_iter().enumerate() {
            let event = event.clone();
            let name = event.name.clone();
            match tokio::spawn(async move { handler.handle(event).await }).await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!(event = %name, subscriber = index, error = %format!("{e:#}"), "Event subscriber failed");
                }
                Err(join) => {
                    report.failed += 1;
                    error!(event = %name, subscriber = index, error = %join, "Event subscriber panicked");
                }
            }
        }
        debug!(event = %event.name, delivered = report.delivered, failed = report.failed, "Event emitted");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn subscribers_run_in_order_and_failures_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone(), 8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        bus.subscribe_fn("lead.captured", move |_| {
            let seen = first.clone();
            async move {
                seen.lock().unwrap().push("first");
                Ok::<(), anyhow::Error>(())
            }
        });
        bus.subscribe_fn("lead.captured", |_| async {
            Err::<(), _>(anyhow::anyhow!("crm unavailable"))
        });
        bus.subscribe_fn("lead.captured", |event: DomainEvent| async move {
            if event.depth == 0 {
                panic!("bad reaction");
            }
            Ok::<(), anyhow::Error>(())
        });
        let last = seen.clone();
        bus.subscribe_fn("lead.captured", move |_| {
            let seen = last.clone();
            async move {
                seen.lock().unwrap().push("last");
                Ok::<(), anyhow::Error>(())
            }
        });
        assert_eq!(bus.subscriber_count("lead.captured"), 4);
        assert_eq!(bus.subscriber_count("content.drafted"), 0);

        let report = bus.emit("lead.captured", json!({"email": "a@b.c"})).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "last"]);
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn events_without_subscribers_are_still_recorded() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone(), 8);
        let report = bus.emit("content.published", json!({"slug": "x"})).await;
        assert_eq!(report, EmitReport::default());
        let events = store.events().await;
        assert_eq!(events[0].name, "content.published");
        assert_eq!(events[0].depth, 0);
    }

    #[tokio::test]
    async fn depth_bound_suppresses_runaway_chains() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone(), 2);
        bus.subscribe_fn("loop", |_| async { Ok::<(), anyhow::Error>(()) });

        assert_eq!(bus.emit_with_depth("loop", json!(null), 2).await.delivered, 1);
        let report = bus.emit_with_depth("loop", json!(null), 3).await;
        assert!(report.suppressed);
        assert_eq!(report.delivered, 0);
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_reaction_carries_payload_and_depth() {
        let store = Arc::new(MemoryStore::new());
        let fabric = Arc::new(QueueFabric::new(
            store.clone(),
            ["inbound_conversion"],
            crate::queue::QueuePolicy::default(),
        ));
        let bus = EventBus::new(store.clone(), 8);
        bus.dispatch_on("lead.captured", fabric, "inbound_conversion", "qualify");

        bus.emit_with_depth("lead.captured", json!({"lead": 1}), 3).await;
        let jobs = store.jobs_in("inbound_conversion").await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, "qualify");
        assert_eq!(jobs[0].payload, json!({"lead": 1}));
        assert_eq!(jobs[0].depth, 3);
    }
}
