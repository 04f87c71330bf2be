use axum::http::StatusCode;
use thiserror::Error;

use crate::models::session::SessionStatus;

/// Failures raised by the ledger store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The client already has a PENDING request.
    #[error("client already has a pending request")]
    DuplicatePending,
    #[error("{0} row disappeared mid-transaction")]
    Missing(&'static str),
    #[error("illegal session transition {from} -> {to}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// Typed failure reasons of the chat session engine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("provider not found")]
    ProviderNotFound,
    #[error("client not found")]
    ClientNotFound,
    #[error("not a participant of this session")]
    NotParticipant,
    #[error("provider is offline")]
    ProviderOffline,
    #[error("provider is not approved")]
    ProviderNotApproved,
    #[error("provider is busy with another session")]
    ProviderBusy,
    #[error("provider availability is inconsistent; manual intervention required")]
    ProviderStateInconsistent,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("free trial already used")]
    FreeTrialUsed,
    #[error("a pending request already exists")]
    DuplicatePending,
    #[error("session is {actual}, expected {expected}")]
    InvalidState {
        expected: SessionStatus,
        actual: SessionStatus,
    },
    /// Lost an accept/cancel/timeout race: the request was cancelled or has expired.
    #[error("request was cancelled or has expired")]
    RequestUnavailable,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Validation(_) => "VALIDATION_ERROR",
            SessionError::SessionNotFound => "SESSION_NOT_FOUND",
            SessionError::ProviderNotFound => "PROVIDER_NOT_FOUND",
            SessionError::ClientNotFound => "CLIENT_NOT_FOUND",
            SessionError::NotParticipant => "NOT_PARTICIPANT",
            SessionError::ProviderOffline => "PROVIDER_OFFLINE",
            SessionError::ProviderNotApproved => "PROVIDER_NOT_APPROVED",
            SessionError::ProviderBusy => "PROVIDER_BUSY",
            SessionError::ProviderStateInconsistent => "PROVIDER_STATE_INCONSISTENT",
            SessionError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            SessionError::FreeTrialUsed => "FREE_TRIAL_ALREADY_USED",
            SessionError::DuplicatePending => "DUPLICATE_PENDING_REQUEST",
            SessionError::InvalidState { .. } => "INVALID_STATE",
            SessionError::RequestUnavailable => "REQUEST_UNAVAILABLE",
            SessionError::Store(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::Validation(_) => StatusCode::BAD_REQUEST,
            SessionError::SessionNotFound
            | SessionError::ProviderNotFound
            | SessionError::ClientNotFound => StatusCode::NOT_FOUND,
            SessionError::NotParticipant => StatusCode::FORBIDDEN,
            SessionError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
            SessionError::RequestUnavailable => StatusCode::GONE,
            SessionError::ProviderOffline
            | SessionError::ProviderNotApproved
            | SessionError::ProviderBusy
            | SessionError::ProviderStateInconsistent
            | SessionError::DuplicatePending
            | SessionError::FreeTrialUsed
            | SessionError::InvalidState { .. } => StatusCode::CONFLICT,
            SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Business-rule refusal or lost race, as opposed to an internal failure.
    pub fn is_business(&self) -> bool {
        !matches!(self, SessionError::Store(_))
    }
}
