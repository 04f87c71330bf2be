pub mod chat;
pub mod events;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{docs::ApiDoc, middleware::auth, state::AppState};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Full HTTP surface: authenticated chat routes, public health and docs.
pub fn router(state: AppState) -> Router {
    let chat_routes = Router::new()
        .route("/api/chat/requests", post(chat::create_request))
        .route("/api/chat/sessions/active", get(chat::active_session))
        .route("/api/chat/sessions/{id}", get(chat::get_session))
        .route("/api/chat/sessions/{id}/accept", post(chat::accept))
        .route("/api/chat/sessions/{id}/reject", post(chat::reject))
        .route("/api/chat/sessions/{id}/cancel", post(chat::cancel))
        .route("/api/chat/sessions/{id}/end", post(chat::end))
        .route("/api/chat/sessions/{id}/join", post(chat::join))
        .route(
            "/api/chat/sessions/{id}/transactions",
            get(chat::session_transactions),
        )
        .route("/api/chat/events", get(events::events))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), auth));

    Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(chat_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
