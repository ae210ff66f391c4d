//! Wires the store, guardrail, queue fabric, event bus, broadcaster and
//! worker pool into one explicitly constructed runtime.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerts::{alerter_from_config, Alerter};
use crate::broadcast::Broadcaster;
use crate::config::DispatchConfig;
use crate::dead_letter::DeadLetterRecorder;
use crate::events::EventBus;
use crate::guardrail::{GuardrailExecutor, GuardrailService};
use crate::handler::HandlerRegistry;
use crate::provider::{ComputeProvider, HttpComputeProvider, UnconfiguredProvider};
use crate::queue::{QueueFabric, QueuePolicy};
use crate::store::{MemoryStore, Store};
use crate::worker::WorkerPool;

pub struct Runtime {
    pub config: Arc<DispatchConfig>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<HandlerRegistry>,
    pub fabric: Arc<QueueFabric>,
    pub guardrail: Arc<GuardrailService>,
    pub executor: Arc<GuardrailExecutor>,
    pub events: Arc<EventBus>,
    pub broadcaster: Arc<Broadcaster>,
    pub workers: Arc<WorkerPool>,
    pub dead_letters: DeadLetterRecorder,
}

impl Runtime {
    pub fn builder(config: DispatchConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            registry: None,
            store: None,
            alerter: None,
            provider: None,
        }
    }

    /// Fill in dead letters missed by an earlier process, then start the
    /// workers of every agent.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        for (agent, _) in self.registry.agents() {
            if let Err(e) = self.dead_letters.reconcile(agent).await {
                warn!(agent, error = %e, "Failed to reconcile dead letters");
            }
        }
        let handles = self.workers.start(shutdown).await;
        info!(tasks = handles.len(), "Dispatch runtime started");
        handles
    }
}

pub struct RuntimeBuilder {
    config: DispatchConfig,
    registry: Option<HandlerRegistry>,
    store: Option<Arc<dyn Store>>,
    alerter: Option<Arc<dyn Alerter>>,
    provider: Option<Arc<dyn ComputeProvider>>,
}

impl RuntimeBuilder {
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ComputeProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub async fn build(self) -> Result<Runtime> {
        let config = self.config;
        config.validate()?;

        let registry = match self.registry {
            Some(registry) => registry,
            // Only the built-in ping handler per configured agent
            None => HandlerRegistry::builder().agents(&config.agents).build()?,
        };
        let registry = Arc::new(registry);

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config).await?,
        };
        let alerter = match self.alerter {
            Some(alerter) => alerter,
            None => alerter_from_config(&config.alerts)?,
        };
        let provider: Arc<dyn ComputeProvider> = match (self.provider, &config.provider.endpoint) {
            (Some(provider), _) => provider,
            (None, Some(endpoint)) => Arc::new(HttpComputeProvider::new(endpoint.clone(), &config.provider)?),
            (None, None) => {
                warn!("No compute provider endpoint configured; costed calls will fail");
                Arc::new(UnconfiguredProvider)
            }
        };

        let guardrail = Arc::new(GuardrailService::new(
            &config,
            store.clone(),
            alerter,
            registry.critical_agents(),
        ));
        let executor = Arc::new(GuardrailExecutor::new(&config, guardrail.clone(), provider));
        let fabric = Arc::new(QueueFabric::new(
            store.clone(),
            registry.agents().map(|(name, _)| name.to_string()),
            QueuePolicy::from_config(&config),
        ));
        let events = Arc::new(EventBus::new(store.clone(), config.events.max_depth));
        let broadcaster = Arc::new(Broadcaster::new());
        let workers = Arc::new(WorkerPool::new(
            fabric.clone(),
            registry.clone(),
            executor.clone(),
            events.clone(),
            broadcaster.clone(),
            Duration::from_millis(config.queue.poll_interval_ms),
        ));

        info!(
            agents = registry.agents().count(),
            critical = registry.critical_agents().len(),
            "Dispatch runtime built"
        );

        Ok(Runtime {
            config: Arc::new(config),
            dead_letters: fabric.dead_letters().clone(),
            store,
            registry,
            fabric,
            guardrail,
            executor,
            events,
            broadcaster,
            workers,
        })
    }
}

#[cfg(feature = "database")]
async fn open_store(config: &DispatchConfig) -> Result<Arc<dyn Store>> {
    match &config.database {
        Some(db) => {
            let store =
                crate::store::SqliteStore::connect(&db.url, db.max_connections, db.auto_migrate).await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "database"))]
async fn open_store(config: &DispatchConfig) -> Result<Arc<dyn Store>> {
    if config.database.is_some() {
        warn!("Database configured but the 'database' feature is disabled; using in-memory store");
    }
    Ok(Arc::new(MemoryStore::new()))
}
