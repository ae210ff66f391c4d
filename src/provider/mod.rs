//! Compute provider seam. The guardrail executor is the only caller.

mod http;

pub use http::HttpComputeProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GuardrailError;

/// A single completion request as sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub input: String,
    pub model: String,
    pub max_output: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub output: String,
    pub input_units: u64,
    pub output_units: u64,
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Errors must be classified: rate limiting and 5xx as transient,
    /// everything else as permanent.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GuardrailError>;
}

/// Provider used when no endpoint is configured; every call fails permanently.
#[derive(Debug, Default)]
pub struct UnconfiguredProvider;

#[async_trait]
impl ComputeProvider for UnconfiguredProvider {
    async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, GuardrailError> {
        Err(GuardrailError::provider(
            crate::error::ProviderErrorKind::Client,
            None,
            "no compute provider endpoint configured",
        ))
    }
}
