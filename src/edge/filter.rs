use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use regex::{Regex, RegexBuilder};
use tracing::warn;

use super::{EdgeRejection, EdgeState, MAX_BODY_BYTES};

/// Static request guardrail: switched-off features and forbidden terms.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    disabled_prefixes: Vec<String>,
    blocked: Option<Regex>,
}

impl ContentFilter {
    pub fn new(disabled_features: &[String], blocked_terms: &[String]) -> Result<Self, regex::Error> {
        let terms: Vec<String> = blocked_terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(regex::escape)
            .collect();
        let blocked = if terms.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&format!(r"\b(?:{})\b", terms.join("|")))
                    .case_insensitive(true)
                    .build()?,
            )
        };

        let disabled_prefixes = disabled_features
            .iter()
            .map(|f| {
                let f = f.trim().trim_end_matches('/');
                if f.starts_with('/') {
                    f.to_string()
                } else {
                    format!("/{f}")
                }
            })
            .collect();

        Ok(Self {
            disabled_prefixes,
            blocked,
        })
    }

    /// The disabled feature `path` falls under, if any
    pub fn disabled_feature(&self, path: &str) -> Option<&str> {
        self.disabled_prefixes
            .iter()
            .find(|prefix| {
                path == prefix.as_str()
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(String::as_str)
    }

    /// First blocked term found in any string of the JSON document
    pub fn blocked_term(&self, value: &serde_json::Value) -> Option<String> {
        let regex = self.blocked.as_ref()?;
        match value {
            serde_json::Value::String(s) => regex.find(s).map(|m| m.as_str().to_lowercase()),
            serde_json::Value::Array(items) => items.iter().find_map(|v| self.blocked_term(v)),
            serde_json::Value::Object(map) => map.values().find_map(|v| self.blocked_term(v)),
            _ => None,
        }
    }

    fn scans_bodies(&self) -> bool {
        self.blocked.is_some()
    }
}

pub async fn guardrail_filter(
    State(edge): State<EdgeState>,
    req: Request,
    next: Next,
) -> Result<Response, EdgeRejection> {
    if let Some(feature) = edge.filter.disabled_feature(req.uri().path()) {
        warn!(path = %req.uri().path(), feature, "Request to disabled feature rejected");
        return Err(EdgeRejection::FeatureDisabled(feature.to_string()));
    }

    let has_body = matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH);
    if !has_body || !edge.filter.scans_bodies() {
        return Ok(next.run(req).await);
    }

    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| EdgeRejection::PayloadTooLarge)?;
    // Non-JSON bodies are left to the route to reject
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        if let Some(term) = edge.filter.blocked_term(&value) {
            warn!(path = %parts.uri.path(), term = %term, "Payload with blocked term rejected");
            return Err(EdgeRejection::BlockedContent(term));
        }
    }
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> ContentFilter {
        ContentFilter::new(
            &["video".to_string(), "/beta/".to_string()],
            &["guaranteed results".to_string(), "cure".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn disabled_prefixes_match_whole_segments() {
        let f = filter();
        assert_eq!(f.disabled_feature("/video"), Some("/video"));
        assert_eq!(f.disabled_feature("/video/render"), Some("/video"));
        assert_eq!(f.disabled_feature("/beta/x"), Some("/beta"));
        assert_eq!(f.disabled_feature("/videos"), None);
        assert_eq!(f.disabled_feature("/trigger/a/b"), None);
    }

    #[test]
    fn blocked_terms_found_anywhere_in_payload() {
        let f = filter();
        let payload = json!({"post": {"paragraphs": ["fine", "We promise GUARANTEED Results!"]}});
        assert_eq!(f.blocked_term(&payload).as_deref(), Some("guaranteed results"));
        assert_eq!(f.blocked_term(&json!({"text": "secure the cluster"})), None);
        assert_eq!(f.blocked_term(&json!({"n": 5})), None);
    }

    #[test]
    fn no_terms_means_no_scanning() {
        let f = ContentFilter::new(&[], &[" ".to_string()]).unwrap();
        assert!(!f.scans_bodies());
        assert_eq!(f.blocked_term(&json!("anything")), None);
    }
}
