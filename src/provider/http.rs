use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{CompletionRequest, CompletionResponse, ComputeProvider};
use crate::config::ProviderConfig;
use crate::error::{GuardrailError, ProviderErrorKind};

/// JSON-over-HTTP compute provider with client-side rate limiting.
///
/// The endpoint receives a [`CompletionRequest`] body and must answer with a
/// [`CompletionResponse`] body.
#[derive(Debug)]
pub struct HttpComputeProvider {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpComputeProvider {
    pub fn new(endpoint: impl Into<String>, config: &ProviderConfig) -> anyhow::Result<Self> {
        let per_second = NonZeroU32::new(config.requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_second).allow_burst(per_second);
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            rate_limiter,
            endpoint: endpoint.into(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GuardrailError> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(100)))
            .await;

        debug!(model = %request.model, "Sending completion request");

        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ProviderErrorKind::Server
            } else {
                ProviderErrorKind::Network
            };
            GuardrailError::provider(kind, None, e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GuardrailError::from_status(status.as_u16(), body));
        }

        response
            .json::<CompletionResponse>()
            .await
            .map_err(|e| GuardrailError::provider(ProviderErrorKind::Client, None, e.to_string()))
    }
}
