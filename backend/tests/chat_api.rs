use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use consult_backend::{
    config::Config,
    handlers,
    models::party::Party,
    state::AppState,
    types::{ClientId, ProviderId},
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;

#[path = "support/mod.rs"]
mod support;

use support::{harness, token_for, Harness, JWT_SECRET};

fn api_config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        jwt_expiration_hours: 1,
        bind_addr: "127.0.0.1:0".to_string(),
        billing_interval_secs: 60,
        request_timeout_secs: 30,
        free_trial_enabled: false,
        free_trial_secs: 300,
        disconnect_grace_secs: 20,
        time_zone: chrono_tz::UTC,
        financial_year_start_month: 4,
        billing_starts_on_join: false,
        push_webhook_url: None,
    }
}

fn app(h: &Harness) -> Router {
    handlers::router(AppState::new(
        api_config(),
        h.chat.clone(),
        h.realtime.clone(),
    ))
}

fn request(method: &str, uri: &str, party: Option<Party>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(party) = party {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token_for(party)));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("build request"),
        None => builder.body(Body::empty()).expect("build request"),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("call router");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn create(app: &Router, client: ClientId, provider: ProviderId) -> (StatusCode, Value) {
    send(
        app,
        request(
            "POST",
            "/api/chat/requests",
            Some(Party::Client(client)),
            Some(json!({ "provider_id": provider.to_string() })),
        ),
    )
    .await
}

#[tokio::test]
async fn chat_routes_require_a_token() {
    let h = harness();
    let app = app(&h);

    let (status, _) = send(&app, request("GET", "/api/chat/sessions/active", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/chat/sessions/active")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .expect("build request");
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_is_public() {
    let h = harness();
    let (status, body) = send(&app(&h), request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let h = harness();
    let (status, body) = send(&app(&h), request("GET", "/api-docs/openapi.json", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body
        .pointer("/paths/~1api~1chat~1requests")
        .is_some());
}

#[tokio::test]
async fn client_creates_request_and_provider_accepts() {
    let h = harness();
    let app = app(&h);
    let client = h.add_client(dec!(100), dec!(0));
    let provider = h.add_provider(dec!(10));

    let (status, body) = create(&app, client, provider).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["client_id"], client.to_string());
    let id = body["id"].as_str().expect("session id").to_string();

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/chat/sessions/{id}/accept"),
            Some(Party::Provider(provider)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ACTIVE");
    assert!(body["start_time"].is_string());

    let (status, body) = send(
        &app,
        request(
            "GET",
            "/api/chat/sessions/active",
            Some(Party::Client(client)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());

    // Too late to cancel once the provider has accepted.
    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/chat/sessions/{id}/cancel"),
            Some(Party::Client(client)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/chat/sessions/{id}/end"),
            Some(Party::Client(client)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ENDED");
    assert_eq!(body["end_reason"], "USER_END");
    assert_eq!(body["ended_by"], "client");
}

#[tokio::test]
async fn providers_cannot_request_and_clients_cannot_accept() {
    let h = harness();
    let app = app(&h);
    let client = h.add_client(dec!(100), dec!(0));
    let provider = h.add_provider(dec!(10));

    let (status, _) = send(
        &app,
        request(
            "POST",
            "/api/chat/requests",
            Some(Party::Provider(provider)),
            Some(json!({ "provider_id": provider.to_string() })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, body) = create(&app, client, provider).await;
    let id = body["id"].as_str().expect("session id").to_string();
    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/api/chat/sessions/{id}/accept"),
            Some(Party::Client(client)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn business_refusals_carry_their_codes() {
    let h = harness();
    let app = app(&h);
    let poor = h.add_client(dec!(1), dec!(0));
    let provider = h.add_provider(dec!(10));

    let (status, body) = create(&app, poor, provider).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "INSUFFICIENT_BALANCE");

    let client = h.add_client(dec!(100), dec!(0));
    let (status, _) = create(&app, client, provider).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = create(&app, client, provider).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DUPLICATE_PENDING_REQUEST");

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/chat/requests",
            Some(Party::Client(client)),
            Some(json!({ "provider_id": "short" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn accepting_a_cancelled_request_is_gone() {
    let h = harness();
    let app = app(&h);
    let client = h.add_client(dec!(100), dec!(0));
    let provider = h.add_provider(dec!(10));

    let (_, body) = create(&app, client, provider).await;
    let id = body["id"].as_str().expect("session id").to_string();

    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/api/chat/sessions/{id}/cancel"),
            Some(Party::Client(client)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/chat/sessions/{id}/accept"),
            Some(Party::Provider(provider)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "REQUEST_UNAVAILABLE");
}

#[tokio::test]
async fn session_details_are_visible_to_participants_only() {
    let h = harness();
    let app = app(&h);
    let client = h.add_client(dec!(100), dec!(0));
    let stranger = h.add_client(dec!(100), dec!(0));
    let provider = h.add_provider(dec!(10));
    let session = h.start_session(client, provider).await;
    let id = session.id.to_string();

    let (status, body) = send(
        &app,
        request(
            "GET",
            &format!("/api/chat/sessions/{id}"),
            Some(Party::Provider(provider)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rate_per_minute"], "10");

    let (status, body) = send(
        &app,
        request(
            "GET",
            &format!("/api/chat/sessions/{id}"),
            Some(Party::Client(stranger)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "NOT_PARTICIPANT");

    let (status, body) = send(
        &app,
        request(
            "GET",
            &format!("/api/chat/sessions/{id}/transactions"),
            Some(Party::Client(client)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = send(
        &app,
        request(
            "GET",
            "/api/chat/sessions/not-a-uuid",
            Some(Party::Client(client)),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
