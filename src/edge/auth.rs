use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use super::{EdgeRejection, EdgeState};
use crate::config::DeployEnvironment;

pub const API_KEY_HEADER: &str = "x-api-key";

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Byte-wise comparison that does not stop at the first mismatch
fn same_secret(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Internal routes require `Authorization: Bearer <internal_token>`.
/// Without a configured token they are closed.
pub async fn require_internal_token(
    State(edge): State<EdgeState>,
    req: Request,
    next: Next,
) -> Result<Response, EdgeRejection> {
    let Some(expected) = edge.config.internal_token.as_deref() else {
        warn!(path = %req.uri().path(), "Internal route called but no internal token is configured");
        return Err(EdgeRejection::Disabled("internal API"));
    };
    match bearer(req.headers()) {
        Some(token) if same_secret(token, expected) => Ok(next.run(req).await),
        _ => Err(EdgeRejection::Unauthorized),
    }
}

/// Manual triggers require `x-api-key`. An unset key leaves them open in
/// development and switches them off in production.
pub async fn require_trigger_key(
    State(edge): State<EdgeState>,
    req: Request,
    next: Next,
) -> Result<Response, EdgeRejection> {
    let Some(expected) = edge.config.trigger_api_key.as_deref() else {
        return match edge.environment {
            DeployEnvironment::Development => Ok(next.run(req).await),
            DeployEnvironment::Production => Err(EdgeRejection::Disabled("manual triggers")),
        };
    };
    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok());
    match provided {
        Some(key) if same_secret(key, expected) => Ok(next.run(req).await),
        _ => Err(EdgeRejection::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert("authorization", "Bearer abc ".parse().unwrap());
        assert_eq!(bearer(&headers), Some("abc"));
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer(&headers), None);
    }

    #[test]
    fn secret_comparison() {
        assert!(same_secret("token", "token"));
        assert!(!same_secret("token", "tokem"));
        assert!(!same_secret("token", "token2"));
    }
}
