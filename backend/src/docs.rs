#![allow(dead_code)] // OpenAPI doc stubs are only referenced by utoipa macros.

use crate::models::{
    party::Role,
    session::{CreateChatRequestPayload, EndReason, SessionResponse, SessionStatus},
    transaction::{Direction, LedgerTransaction, TransactionKind, TransactionStatus},
};
use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        create_request_doc,
        accept_doc,
        reject_doc,
        cancel_doc,
        end_doc,
        join_doc,
        active_session_doc,
        get_session_doc,
        session_transactions_doc,
        events_doc
    ),
    components(schemas(
        CreateChatRequestPayload,
        SessionResponse,
        SessionStatus,
        EndReason,
        Role,
        LedgerTransaction,
        TransactionKind,
        TransactionStatus,
        Direction
    )),
    modifiers(&SecuritySchemes),
    tags(
        (name = "Chat", description = "Metered chat session lifecycle"),
        (name = "Events", description = "Real-time session events")
    ),
    security(("BearerAuth" = []))
)]
pub struct ApiDoc;

struct SecuritySchemes;

impl Modify for SecuritySchemes {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_default();

        let mut bearer = Http::new(HttpAuthScheme::Bearer);
        bearer.bearer_format = Some("JWT".to_string());

        components.add_security_scheme("BearerAuth", SecurityScheme::Http(bearer));
    }
}

#[utoipa::path(
    post,
    path = "/api/chat/requests",
    request_body = CreateChatRequestPayload,
    responses(
        (status = 201, description = "Request created, provider notified", body = SessionResponse),
        (status = 402, description = "INSUFFICIENT_BALANCE"),
        (status = 409, description = "PROVIDER_BUSY, PROVIDER_OFFLINE or DUPLICATE_PENDING_REQUEST")
    ),
    tag = "Chat"
)]
fn create_request_doc() {}

#[utoipa::path(
    post,
    path = "/api/chat/sessions/{id}/accept",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session is ACTIVE", body = SessionResponse),
        (status = 410, description = "Request was cancelled or expired")
    ),
    tag = "Chat"
)]
fn accept_doc() {}

#[utoipa::path(
    post,
    path = "/api/chat/sessions/{id}/reject",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionResponse),
        (status = 410, description = "Request was cancelled or expired")
    ),
    tag = "Chat"
)]
fn reject_doc() {}

#[utoipa::path(
    post,
    path = "/api/chat/sessions/{id}/cancel",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionResponse),
        (status = 410, description = "Request was already accepted, rejected or expired")
    ),
    tag = "Chat"
)]
fn cancel_doc() {}

#[utoipa::path(
    post,
    path = "/api/chat/sessions/{id}/end",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session ENDED with final totals", body = SessionResponse),
        (status = 409, description = "Session is not ACTIVE")
    ),
    tag = "Chat"
)]
fn end_doc() {}

#[utoipa::path(
    post,
    path = "/api/chat/sessions/{id}/join",
    params(("id" = String, Path, description = "Session id")),
    responses((status = 200, body = SessionResponse)),
    tag = "Chat"
)]
fn join_doc() {}

#[utoipa::path(
    get,
    path = "/api/chat/sessions/active",
    responses((status = 200, description = "Open session or null", body = Option<SessionResponse>)),
    tag = "Chat"
)]
fn active_session_doc() {}

#[utoipa::path(
    get,
    path = "/api/chat/sessions/{id}",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionResponse),
        (status = 403, description = "Not a participant")
    ),
    tag = "Chat"
)]
fn get_session_doc() {}

#[utoipa::path(
    get,
    path = "/api/chat/sessions/{id}/transactions",
    params(("id" = String, Path, description = "Session id")),
    responses((status = 200, body = Vec<LedgerTransaction>)),
    tag = "Chat"
)]
fn session_transactions_doc() {}

#[utoipa::path(
    get,
    path = "/api/chat/events",
    params(("access_token" = Option<String>, Query, description = "JWT when headers cannot be set")),
    responses((status = 101, description = "WebSocket upgrade; JSON events tagged by `type`")),
    tag = "Events"
)]
fn events_doc() {}
