//! Real-time events pushed to session participants.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::party::Role;
use crate::models::session::EndReason;
use crate::types::{ClientId, ProviderId, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// New request waiting for the provider.
    ChatRequest {
        session_id: SessionId,
        client_id: ClientId,
        client_name: String,
        rate_per_minute: Decimal,
        is_free_trial: bool,
        is_continuation: bool,
        expires_in_secs: u64,
    },
    RequestAccepted {
        session_id: SessionId,
        provider_id: ProviderId,
        /// Unset while metering waits for both parties to join.
        start_time: Option<DateTime<Utc>>,
        rate_per_minute: Decimal,
        is_free_trial: bool,
        trial_duration_secs: Option<i64>,
    },
    RequestRejected {
        session_id: SessionId,
    },
    RequestCancelled {
        session_id: SessionId,
    },
    RequestTimedOut {
        session_id: SessionId,
    },
    /// Client-side view after a committed billing cycle.
    BillingUpdate {
        session_id: SessionId,
        total_minutes: Decimal,
        total_amount: Decimal,
        charged: Decimal,
        real_balance: Decimal,
        bonus_balance: Decimal,
    },
    /// Provider-side view after a committed billing cycle.
    EarningsUpdate {
        session_id: SessionId,
        total_minutes: Decimal,
        session_earnings: Decimal,
        credited: Decimal,
        tax_withheld: Decimal,
        withdrawable_earnings: Decimal,
    },
    LowBalance {
        session_id: SessionId,
        combined_balance: Decimal,
        rate_per_minute: Decimal,
    },
    PartyJoined {
        session_id: SessionId,
        role: Role,
    },
    PartyDisconnected {
        session_id: SessionId,
        role: Role,
        grace_secs: u64,
    },
    /// Both parties are in the room; the billing or trial clock runs from here.
    MeteringStarted {
        session_id: SessionId,
        start_time: DateTime<Utc>,
        is_free_trial: bool,
    },
    SessionEnded {
        session_id: SessionId,
        reason: EndReason,
        ended_by: Option<Role>,
        end_time: DateTime<Utc>,
        total_minutes: Decimal,
        total_amount: Decimal,
        provider_earnings: Decimal,
    },
}

impl ChatEvent {
    /// Wire name of the event, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::ChatRequest { .. } => "chat_request",
            ChatEvent::RequestAccepted { .. } => "request_accepted",
            ChatEvent::RequestRejected { .. } => "request_rejected",
            ChatEvent::RequestCancelled { .. } => "request_cancelled",
            ChatEvent::RequestTimedOut { .. } => "request_timed_out",
            ChatEvent::BillingUpdate { .. } => "billing_update",
            ChatEvent::EarningsUpdate { .. } => "earnings_update",
            ChatEvent::LowBalance { .. } => "low_balance",
            ChatEvent::PartyJoined { .. } => "party_joined",
            ChatEvent::PartyDisconnected { .. } => "party_disconnected",
            ChatEvent::MeteringStarted { .. } => "metering_started",
            ChatEvent::SessionEnded { .. } => "session_ended",
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            ChatEvent::ChatRequest { session_id, .. }
            | ChatEvent::RequestAccepted { session_id, .. }
            | ChatEvent::RequestRejected { session_id }
            | ChatEvent::RequestCancelled { session_id }
            | ChatEvent::RequestTimedOut { session_id }
            | ChatEvent::BillingUpdate { session_id, .. }
            | ChatEvent::EarningsUpdate { session_id, .. }
            | ChatEvent::LowBalance { session_id, .. }
            | ChatEvent::PartyJoined { session_id, .. }
            | ChatEvent::PartyDisconnected { session_id, .. }
            | ChatEvent::MeteringStarted { session_id, .. }
            | ChatEvent::SessionEnded { session_id, .. } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_matches_name() {
        let events = [
            ChatEvent::RequestRejected {
                session_id: SessionId::new(),
            },
            ChatEvent::PartyJoined {
                session_id: SessionId::new(),
                role: Role::Client,
            },
            ChatEvent::LowBalance {
                session_id: SessionId::new(),
                combined_balance: Decimal::new(1500, 2),
                rate_per_minute: Decimal::new(1000, 2),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.name());
            assert_eq!(json["session_id"], event.session_id().to_string());
        }
    }
}
