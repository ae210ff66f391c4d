//! HTTP surface behind the edge middleware, driven in-process with `oneshot`.

mod fixtures;

use agent_dispatch::edge::{sign, EdgeState};
use agent_dispatch::{router, AgentSettings, AppState, DeployEnvironment, DispatchConfig, HandlerRegistry};
use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use fixtures::{fast_config, harness, Harness};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn app(config: DispatchConfig) -> Result<(Router, Harness)> {
    let registry = HandlerRegistry::builder()
        .agent("inbound_conversion", AgentSettings::default())
        .build()?;
    let edge = EdgeState::from_config(&config)?;
    let h = harness(config, registry).await;
    let app = router(AppState {
        runtime: h.runtime.clone(),
        edge,
    });
    Ok((app, h))
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_version() -> Result<()> {
    let (app, _h) = app(fast_config()).await?;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[tokio::test]
async fn webhook_requires_a_valid_signature_when_configured() -> Result<()> {
    let mut config = fast_config();
    config.edge.webhook_secret = Some("whsec".into());
    let (app, h) = app(config).await?;
    let payload = json!({"email": "lead@example.com"});
    let uri = "/webhooks/inbound_conversion/ping";

    let unsigned = app.clone().oneshot(post_json(uri, &payload)).await?;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let mut forged = post_json(uri, &payload);
    forged
        .headers_mut()
        .insert("x-signature", sign("wrong", payload.to_string().as_bytes()).parse()?);
    assert_eq!(app.clone().oneshot(forged).await?.status(), StatusCode::UNAUTHORIZED);
    assert!(h.store.jobs_in("inbound_conversion").await.is_empty());

    let mut signed = post_json(uri, &payload);
    signed.headers_mut().insert(
        "x-signature",
        format!("sha256={}", sign("whsec", payload.to_string().as_bytes())).parse()?,
    );
    let accepted = app.oneshot(signed).await?;
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let body = body_json(accepted).await;
    assert_eq!(body["agent"], "inbound_conversion");

    let jobs = h.store.jobs_in("inbound_conversion").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload, payload);
    Ok(())
}

#[tokio::test]
async fn unsigned_webhooks_pass_when_no_secret_is_set() -> Result<()> {
    let (app, _h) = app(fast_config()).await?;
    let response = app
        .oneshot(post_json("/webhooks/inbound_conversion/ping", &json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    Ok(())
}

#[tokio::test]
async fn unknown_agent_is_rejected_synchronously() -> Result<()> {
    let (app, h) = app(fast_config()).await?;
    let response = app
        .oneshot(post_json("/trigger/ghost/ping", &json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(h.store.jobs_in("ghost").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn trigger_key_rules_depend_on_environment() -> Result<()> {
    // Development without a key: open
    let (dev, _h) = app(fast_config()).await?;
    let response = dev
        .oneshot(post_json("/trigger/inbound_conversion/ping", &json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Production without a key: switched off
    let mut config = fast_config();
    config.server.environment = DeployEnvironment::Production;
    let (prod, _h) = app(config.clone()).await?;
    let response = prod
        .oneshot(post_json("/trigger/inbound_conversion/ping", &json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Key set: must match
    config.edge.trigger_api_key = Some("k-123".into());
    let (keyed, _h) = app(config).await?;
    let wrong = keyed
        .clone()
        .oneshot(post_json("/trigger/inbound_conversion/ping", &json!({})))
        .await?;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let mut right = post_json("/trigger/inbound_conversion/ping", &json!({}));
    right.headers_mut().insert("x-api-key", "k-123".parse()?);
    assert_eq!(keyed.oneshot(right).await?.status(), StatusCode::ACCEPTED);
    Ok(())
}

#[tokio::test]
async fn internal_routes_need_the_bearer_token() -> Result<()> {
    let (closed, _h) = app(fast_config()).await?;
    let response = closed
        .oneshot(Request::get("/internal/spend").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let mut config = fast_config();
    config.edge.internal_token = Some("tok".into());
    let (app, h) = app(config).await?;

    let anonymous = app
        .clone()
        .oneshot(Request::get("/internal/spend").body(Body::empty())?)
        .await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let spend = app
        .clone()
        .oneshot(
            Request::get("/internal/spend")
                .header(header::AUTHORIZATION, "Bearer tok")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(spend.status(), StatusCode::OK);
    let body = body_json(spend).await;
    assert_eq!(body["budget_limit"], 500.0);

    let mut dispatch = post_json(
        "/internal/dispatch",
        &json!({
            "agent": "inbound_conversion",
            "job_type": "ping",
            "payload": {"n": 1},
            "options": {"attempts": 5}
        }),
    );
    dispatch
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer tok".parse()?);
    assert_eq!(app.clone().oneshot(dispatch).await?.status(), StatusCode::ACCEPTED);
    assert_eq!(h.store.jobs_in("inbound_conversion").await[0].max_attempts, 5);

    let mut emit = post_json("/internal/events/lead.captured", &json!({"x": 1}));
    emit.headers_mut()
        .insert(header::AUTHORIZATION, "Bearer tok".parse()?);
    let emitted = app.oneshot(emit).await?;
    assert_eq!(emitted.status(), StatusCode::OK);
    assert_eq!(body_json(emitted).await["suppressed"], false);
    assert_eq!(h.store.events().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn rate_limit_returns_retry_after() -> Result<()> {
    let mut config = fast_config();
    config.edge.rate_limit_max_requests = 2;
    config.edge.trust_proxy = true;
    let (app, _h) = app(config).await?;

    let request = || {
        Request::get("/health")
            .header("x-forwarded-for", "198.51.100.7")
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(app.clone().oneshot(request()).await?.status(), StatusCode::OK);
    assert_eq!(app.clone().oneshot(request()).await?.status(), StatusCode::OK);

    let limited = app.clone().oneshot(request()).await?;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited.headers()[header::RETRY_AFTER].to_str()?.parse()?;
    assert!((1..=60).contains(&retry_after));

    // A different caller has its own window
    let other = Request::get("/health")
        .header("x-forwarded-for", "198.51.100.8")
        .body(Body::empty())?;
    assert_eq!(app.oneshot(other).await?.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn forwarded_headers_cannot_reset_the_window_by_default() -> Result<()> {
    let mut config = fast_config();
    config.edge.rate_limit_max_requests = 2;
    let (app, _h) = app(config).await?;

    let spoofed = |ip: &str| {
        Request::get("/health")
            .header("x-forwarded-for", ip)
            .header("x-real-ip", ip)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(app.clone().oneshot(spoofed("198.51.100.1")).await?.status(), StatusCode::OK);
    assert_eq!(app.clone().oneshot(spoofed("198.51.100.2")).await?.status(), StatusCode::OK);
    let limited = app.oneshot(spoofed("198.51.100.3")).await?;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    Ok(())
}

#[tokio::test]
async fn guardrail_filter_blocks_features_and_terms() -> Result<()> {
    let mut config = fast_config();
    config.edge.disabled_features = vec!["webhooks".into()];
    config.edge.blocked_terms = vec!["miracle cure".into()];
    let (app, h) = app(config).await?;

    let disabled = app
        .clone()
        .oneshot(post_json("/webhooks/inbound_conversion/ping", &json!({})))
        .await?;
    assert_eq!(disabled.status(), StatusCode::FORBIDDEN);

    let blocked = app
        .clone()
        .oneshot(post_json(
            "/trigger/inbound_conversion/ping",
            &json!({"draft": {"body": "Try this Miracle Cure today"}}),
        ))
        .await?;
    assert_eq!(blocked.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(h.store.jobs_in("inbound_conversion").await.is_empty());

    let clean = app
        .oneshot(post_json(
            "/trigger/inbound_conversion/ping",
            &json!({"draft": {"body": "A practical guide"}}),
        ))
        .await?;
    assert_eq!(clean.status(), StatusCode::ACCEPTED);
    Ok(())
}

#[tokio::test]
async fn cors_preflight_allows_configured_origin_only() -> Result<()> {
    let (app, _h) = app(fast_config()).await?;
    let preflight = |origin: &str| {
        Request::builder()
            .method("OPTIONS")
            .uri("/trigger/inbound_conversion/ping")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap()
    };

    let allowed = app.clone().oneshot(preflight("http://localhost:3000")).await?;
    assert_eq!(
        allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:3000"
    );

    let denied = app.oneshot(preflight("https://evil.example")).await?;
    assert!(denied
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_none());
    Ok(())
}
