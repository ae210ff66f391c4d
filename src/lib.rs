// agent-dispatch library - job dispatch and spend guardrails for background agents
// This exposes the core components for the binary, integration tests and embedding

pub mod alerts;
pub mod api;
pub mod broadcast;
pub mod config;
pub mod dead_letter;
pub mod edge;
pub mod error;
pub mod events;
pub mod guardrail;
pub mod handler;
pub mod model;
pub mod observability;
pub mod provider;
pub mod queue;
pub mod runtime;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod testing;
pub mod worker;

// Re-export key types for easy access
pub use alerts::{Alerter, FailureAlert, LogAlerter, WebhookAlerter};
pub use api::{router, AppState};
pub use broadcast::{Broadcaster, ChannelSink, Frame, SinkError, SinkGuard, StreamSink};
pub use config::{AgentSettings, DeployEnvironment, DispatchConfig};
pub use dead_letter::DeadLetterRecorder;
pub use edge::{EdgeRejection, EdgeState};
pub use error::{
    ConfigError, DispatchError, GuardrailError, JobError, ProviderErrorKind, RegistryError,
    StoreError,
};
pub use events::{DomainEvent, EmitReport, EventBus, EventHandler};
pub use guardrail::{CostedCall, CostedCallOutcome, GuardrailExecutor, GuardrailService, SpendLedger};
pub use handler::{CallSpec, HandlerRegistry, JobContext, JobHandler, PING_JOB_TYPE};
pub use model::{BackoffPolicy, Job, JobId, JobState, SpendPeriod, Usage};
pub use observability::{dispatch_metrics, DispatchMetrics, OperationTimer};
pub use provider::{ComputeProvider, HttpComputeProvider};
pub use queue::{DispatchOptions, JobEvent, JobHandle, QueueFabric};
pub use runtime::Runtime;
pub use shutdown::ShutdownCoordinator;
pub use store::{MemoryStore, Store};
pub use telemetry::{init_telemetry, shutdown_telemetry, generate_correlation_id};
pub use worker::{Execution, WorkerPool};
