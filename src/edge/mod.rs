//! Request-level protections in front of the dispatch-triggering API.

pub mod auth;
pub mod cors;
pub mod filter;
pub mod rate_limit;
pub mod signature;

pub use auth::{require_internal_token, require_trigger_key};
pub use cors::cors_layer;
pub use filter::{guardrail_filter, ContentFilter};
pub use rate_limit::{caller_identity, rate_limit, FixedWindowLimiter};
pub use signature::{sign, verify, verify_signature};

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DeployEnvironment, DispatchConfig, EdgeConfig};
use crate::error::ConfigError;

/// Largest request body the edge will buffer for inspection
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct EdgeState {
    pub config: Arc<EdgeConfig>,
    pub environment: DeployEnvironment,
    pub limiter: Arc<FixedWindowLimiter>,
    pub filter: Arc<ContentFilter>,
}

impl EdgeState {
    pub fn from_config(config: &DispatchConfig) -> Result<Self, ConfigError> {
        let edge = &config.edge;
        let filter = ContentFilter::new(&edge.disabled_features, &edge.blocked_terms)
            .map_err(|e| ConfigError::Invalid(format!("edge.blocked_terms: {e}")))?;
        Ok(Self {
            config: Arc::new(edge.clone()),
            environment: config.server.environment,
            limiter: Arc::new(FixedWindowLimiter::new(
                Duration::from_secs(edge.rate_limit_window_seconds),
                edge.rate_limit_max_requests,
            )),
            filter: Arc::new(filter),
        })
    }
}

/// Why the edge turned a request away
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeRejection {
    RateLimited { retry_after: Duration },
    InvalidSignature,
    Unauthorized,
    /// A route group switched off for this deployment
    Disabled(&'static str),
    FeatureDisabled(String),
    BlockedContent(String),
    PayloadTooLarge,
}

impl IntoResponse for EdgeRejection {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            EdgeRejection::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please slow down.".to_string(),
            ),
            EdgeRejection::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, "Invalid webhook signature".to_string())
            }
            EdgeRejection::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            EdgeRejection::Disabled(what) => {
                (StatusCode::SERVICE_UNAVAILABLE, format!("{what} disabled"))
            }
            EdgeRejection::FeatureDisabled(feature) => {
                (StatusCode::FORBIDDEN, format!("Feature {feature} is disabled"))
            }
            EdgeRejection::BlockedContent(term) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Payload contains blocked term '{term}'"),
            ),
            EdgeRejection::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
            }
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let EdgeRejection::RateLimited { retry_after } = self {
            let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds.max(1)));
        }
        response
    }
}
