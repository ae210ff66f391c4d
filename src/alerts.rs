//! Alerting collaborator.
//!
//! Alerts are fire-and-forget: a failing or slow alert channel is logged and
//! otherwise ignored, it never changes a job's outcome.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAlert {
    pub agent: String,
    pub job_type: String,
    pub error: String,
    pub consecutive_failures: u32,
}

#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send_failure_alert(&self, alert: &FailureAlert) -> anyhow::Result<()>;

    async fn send_budget_alert(&self, text: &str) -> anyhow::Result<()>;
}

/// Deliver an alert without letting its failure escape.
pub async fn fire_and_forget<F>(timeout: Duration, what: &str, send: F)
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(timeout, send).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(alert = what, error = %e, "Alert delivery failed"),
        Err(_) => warn!(alert = what, timeout_ms = timeout.as_millis() as u64, "Alert delivery timed out"),
    }
}

/// Writes alerts to the log only
#[derive(Debug, Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send_failure_alert(&self, alert: &FailureAlert) -> anyhow::Result<()> {
        warn!(
            agent = %alert.agent,
            job_type = %alert.job_type,
            consecutive_failures = alert.consecutive_failures,
            error = %alert.error,
            "Agent failure alert"
        );
        Ok(())
    }

    async fn send_budget_alert(&self, text: &str) -> anyhow::Result<()> {
        warn!(text, "Budget alert");
        Ok(())
    }
}

/// Posts alerts to a Slack-compatible incoming webhook
#[derive(Debug, Clone)]
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, text: String) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn send_failure_alert(&self, alert: &FailureAlert) -> anyhow::Result<()> {
        let text = format!(
            ":rotating_light: Agent `{}` failed {} times in a row (last job type `{}`): {}",
            alert.agent, alert.consecutive_failures, alert.job_type, alert.error
        );
        self.post(text).await?;
        info!(agent = %alert.agent, "Failure alert delivered");
        Ok(())
    }

    async fn send_budget_alert(&self, text: &str) -> anyhow::Result<()> {
        self.post(format!(":moneybag: {text}")).await
    }
}

/// Pick the configured alerter: webhook when a URL is set, log otherwise.
pub fn alerter_from_config(config: &crate::config::AlertConfig) -> anyhow::Result<Arc<dyn Alerter>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookAlerter::new(
            url.clone(),
            Duration::from_millis(config.timeout_ms),
        )?)),
        None => Ok(Arc::new(LogAlerter)),
    }
}
