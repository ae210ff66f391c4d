use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Process-wide dispatch counters
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub budget_rejections: AtomicU64,
    pub fallback_downgrades: AtomicU64,
    pub provider_retries: AtomicU64,
    pub sink_drops: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_dispatch, dispatched);
    counter!(record_completion, completed);
    counter!(record_failed_attempt, failed_attempts);
    counter!(record_retry, retried);
    counter!(record_dead_letter, dead_lettered);
    counter!(record_budget_rejection, budget_rejections);
    counter!(record_fallback, fallback_downgrades);
    counter!(record_provider_retry, provider_retries);
    counter!(record_sink_drop, sink_drops);

    pub fn get_stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
            fallback_downgrades: self.fallback_downgrades.load(Ordering::Relaxed),
            provider_retries: self.provider_retries.load(Ordering::Relaxed),
            sink_drops: self.sink_drops.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            dispatched = stats.dispatched,
            completed = stats.completed,
            failed_attempts = stats.failed_attempts,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            budget_rejections = stats.budget_rejections,
            fallback_downgrades = stats.fallback_downgrades,
            provider_retries = stats.provider_retries,
            sink_drops = stats.sink_drops,
            "Dispatch metrics"
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed_attempts: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub budget_rejections: u64,
    pub fallback_downgrades: u64,
    pub provider_retries: u64,
    pub sink_drops: u64,
}

/// Global metrics instance
static DISPATCH_METRICS: std::sync::LazyLock<DispatchMetrics> =
    std::sync::LazyLock::new(DispatchMetrics::new);

pub fn dispatch_metrics() -> &'static DispatchMetrics {
    &DISPATCH_METRICS
}

/// Time an operation and log its duration on `finish`
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn finish(self) -> u64 {
        let duration_ms = self.elapsed_ms();
        info!(
            operation = %self.operation,
            duration_ms,
            "Operation completed"
        );
        duration_ms
    }
}
