//! Chat session record and its lifecycle states.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

use crate::models::party::{Party, Role};
use crate::types::{ClientId, ProviderId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
    Rejected,
}

text_enum!(SessionStatus {
    Pending => "PENDING",
    Active => "ACTIVE",
    Ended => "ENDED",
    Rejected => "REJECTED",
});

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Rejected)
    }

    /// Legal edges: PENDING -> ACTIVE | REJECTED | ENDED, ACTIVE -> ENDED.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Pending, SessionStatus::Active)
                | (SessionStatus::Pending, SessionStatus::Rejected)
                | (SessionStatus::Pending, SessionStatus::Ended)
                | (SessionStatus::Active, SessionStatus::Ended)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Machine-readable reason carried by every terminal session.
pub enum EndReason {
    /// Client ended (or cancelled) the session.
    UserEnd,
    /// Provider ended the session.
    ProviderEnd,
    /// Provider rejected the request.
    Rejected,
    /// Nobody answered the request in time.
    Timeout,
    /// Client ran out of funds.
    InsufficientBalance,
    /// Free trial duration elapsed.
    FreeTrialEnded,
    /// A party dropped off and did not come back within the grace period.
    Disconnect,
}

text_enum!(EndReason {
    UserEnd => "USER_END",
    ProviderEnd => "PROVIDER_END",
    Rejected => "REJECTED",
    Timeout => "TIMEOUT",
    InsufficientBalance => "INSUFFICIENT_BALANCE",
    FreeTrialEnded => "FREE_TRIAL_ENDED",
    Disconnect => "DISCONNECT",
});

impl EndReason {
    /// Reason recorded when a party explicitly ends an active session.
    pub fn ended_by(role: Role) -> Self {
        match role {
            Role::Client => EndReason::UserEnd,
            Role::Provider => EndReason::ProviderEnd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChatSession {
    pub id: SessionId,
    pub client_id: ClientId,
    pub provider_id: ProviderId,
    /// Locked at creation from the provider's rate.
    pub rate_per_minute: Decimal,
    pub status: SessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Party that triggered the end; `None` for system-triggered ends.
    pub ended_by: Option<Role>,
    pub total_minutes: Decimal,
    pub total_amount: Decimal,
    /// Gross provider share credited by committed charges (pre-tax).
    pub provider_earnings: Decimal,
    pub user_joined: bool,
    pub provider_joined: bool,
    pub is_free_trial: bool,
    pub trial_duration_secs: Option<i64>,
    pub is_continuation: bool,
    pub previous_session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new_pending(
        client_id: ClientId,
        provider_id: ProviderId,
        rate_per_minute: Decimal,
        trial_duration_secs: Option<i64>,
        previous_session_id: Option<SessionId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            client_id,
            provider_id,
            rate_per_minute,
            status: SessionStatus::Pending,
            start_time: None,
            end_time: None,
            end_reason: None,
            ended_by: None,
            total_minutes: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            provider_earnings: Decimal::ZERO,
            user_joined: false,
            provider_joined: false,
            is_free_trial: trial_duration_secs.is_some(),
            trial_duration_secs,
            is_continuation: previous_session_id.is_some(),
            previous_session_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_participant(&self, party: &Party) -> bool {
        match party {
            Party::Client(id) => *id == self.client_id,
            Party::Provider(id) => *id == self.provider_id,
        }
    }

    pub fn counterpart(&self, party: &Party) -> Party {
        match party {
            Party::Client(_) => Party::Provider(self.provider_id),
            Party::Provider(_) => Party::Client(self.client_id),
        }
    }

    pub fn client(&self) -> Party {
        Party::Client(self.client_id)
    }

    pub fn provider(&self) -> Party {
        Party::Provider(self.provider_id)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Public view of a session returned by every engine operation.
pub struct SessionResponse {
    #[schema(value_type = String)]
    pub id: SessionId,
    #[schema(value_type = String)]
    pub client_id: ClientId,
    #[schema(value_type = String)]
    pub provider_id: ProviderId,
    pub status: SessionStatus,
    pub rate_per_minute: Decimal,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub ended_by: Option<Role>,
    pub total_minutes: Decimal,
    pub total_amount: Decimal,
    pub provider_earnings: Decimal,
    pub user_joined: bool,
    pub provider_joined: bool,
    pub is_free_trial: bool,
    pub trial_duration_secs: Option<i64>,
    pub is_continuation: bool,
    #[schema(value_type = Option<String>)]
    pub previous_session_id: Option<SessionId>,
}

impl From<ChatSession> for SessionResponse {
    fn from(session: ChatSession) -> Self {
        SessionResponse {
            id: session.id,
            client_id: session.client_id,
            provider_id: session.provider_id,
            status: session.status,
            rate_per_minute: session.rate_per_minute,
            created_at: session.created_at,
            start_time: session.start_time,
            end_time: session.end_time,
            end_reason: session.end_reason,
            ended_by: session.ended_by,
            total_minutes: session.total_minutes,
            total_amount: session.total_amount,
            provider_earnings: session.provider_earnings,
            user_joined: session.user_joined,
            provider_joined: session.provider_joined,
            is_free_trial: session.is_free_trial,
            trial_duration_secs: session.trial_duration_secs,
            is_continuation: session.is_continuation,
            previous_session_id: session.previous_session_id,
        }
    }
}

/// Body of `POST /api/chat/requests`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateChatRequestPayload {
    #[validate(length(min = 32, max = 36))]
    pub provider_id: String,
    /// Ended session with the same provider this one continues.
    #[validate(length(min = 32, max = 36))]
    pub previous_session_id: Option<String>,
}
