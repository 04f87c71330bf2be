use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::{
    error::AppError,
    models::{
        party::Party,
        session::{CreateChatRequestPayload, SessionResponse},
        transaction::LedgerTransaction,
    },
    state::AppState,
    types::{ProviderId, SessionId},
};

fn parse_session_id(raw: &str) -> Result<SessionId, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest("Invalid session id".to_string()))
}

pub async fn create_request(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
    Json(payload): Json<CreateChatRequestPayload>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let Party::Client(client_id) = party else {
        return Err(AppError::Forbidden(
            "Only clients can request a chat".to_string(),
        ));
    };
    payload.validate()?;

    let provider_id: ProviderId = payload
        .provider_id
        .parse()
        .map_err(|_| AppError::BadRequest("Invalid provider id".to_string()))?;
    let previous_session_id = payload
        .previous_session_id
        .as_deref()
        .map(parse_session_id)
        .transpose()?;

    let session = state
        .chat
        .create_request(client_id, provider_id, previous_session_id)
        .await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

pub async fn accept(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let Party::Provider(provider_id) = party else {
        return Err(AppError::Forbidden(
            "Only providers can accept a chat".to_string(),
        ));
    };
    let session = state.chat.accept(provider_id, parse_session_id(&id)?).await?;
    Ok(Json(session.into()))
}

pub async fn reject(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let Party::Provider(provider_id) = party else {
        return Err(AppError::Forbidden(
            "Only providers can reject a chat".to_string(),
        ));
    };
    let session = state.chat.reject(provider_id, parse_session_id(&id)?).await?;
    Ok(Json(session.into()))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let Party::Client(client_id) = party else {
        return Err(AppError::Forbidden(
            "Only the requesting client can cancel".to_string(),
        ));
    };
    let session = state.chat.cancel(client_id, parse_session_id(&id)?).await?;
    Ok(Json(session.into()))
}

pub async fn end(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.chat.end(party, parse_session_id(&id)?).await?;
    Ok(Json(session.into()))
}

pub async fn join(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.chat.join(party, parse_session_id(&id)?).await?;
    Ok(Json(session.into()))
}

pub async fn active_session(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
) -> Result<Json<Option<SessionResponse>>, AppError> {
    let session = state.chat.get_active_session_for(party).await?;
    Ok(Json(session.map(SessionResponse::from)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.chat.get_session(party, parse_session_id(&id)?).await?;
    Ok(Json(session.into()))
}

pub async fn session_transactions(
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LedgerTransaction>>, AppError> {
    let transactions = state
        .chat
        .list_transactions(party, parse_session_id(&id)?)
        .await?;
    Ok(Json(transactions))
}
