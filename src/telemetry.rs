use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize structured JSON logging.
///
/// `RUST_LOG` overrides the default `info` level.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init()?;

    tracing::info!("agent-dispatch telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span shared by a job's dispatch and every attempt a worker makes on it
pub fn create_dispatch_span(agent: &str, job_type: &str, job_id: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "agent_job",
        agent = agent,
        job_type = job_type,
        job.id = job_id,
        job.attempt = attempt,
        otel.kind = "consumer"
    )
}

/// Span around one emitted domain event and its reactions
pub fn create_event_span(name: &str, depth: u32, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "domain_event",
        event.name = name,
        event.depth = depth,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

pub fn shutdown_telemetry() {
    tracing::info!("agent-dispatch telemetry shutdown complete");
}
