use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::observability::dispatch_metrics;

/// Graceful shutdown coordinator for agent-dispatch.
///
/// Workers and background tasks hold a receiver and stop claiming work once
/// the flag flips to `true`.
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn wait_for_signal(&self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on SIGINT/SIGTERM");

        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        self.trigger();
        Ok(())
    }

    /// Let in-flight jobs finish, up to `grace`, then abort what is left.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, grace: Duration) {
        self.trigger();
        info!(tasks = handles.len(), "Waiting for workers to finish current jobs...");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = timeout(grace, futures::future::join_all(handles)).await;
        match joined {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    warn!(panicked, "Some workers did not exit cleanly");
                }
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Workers still busy after grace period, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        dispatch_metrics().log_stats();
        info!("Graceful shutdown completed successfully");
    }
}
