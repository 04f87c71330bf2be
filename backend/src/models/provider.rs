//! Provider profile: availability lock, rate and earnings ledger.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{ProviderId, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ProviderProfile {
    pub id: ProviderId,
    pub display_name: String,
    pub rate_per_minute: Decimal,
    pub is_online: bool,
    pub is_approved: bool,
    pub is_verified: bool,
    /// Always written together with `active_session_id`.
    pub is_busy: bool,
    pub active_session_id: Option<SessionId>,
    pub missed_requests: i64,
    pub total_sessions: i64,
    /// Net-of-tax balance available for withdrawal.
    pub withdrawable_earnings: Decimal,
    pub ytd_gross_earnings: Decimal,
    pub ytd_tax_withheld: Decimal,
    /// First day of the financial year the YTD counters belong to.
    pub tax_year_start: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Availability derived from the busy flag pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Free,
    BusyWith(SessionId),
    /// `is_busy` without a recorded session (or the reverse).
    Inconsistent,
}

impl ProviderProfile {
    pub fn new(display_name: impl Into<String>, rate_per_minute: Decimal, tax_year_start: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: ProviderId::new(),
            display_name: display_name.into(),
            rate_per_minute,
            is_online: true,
            is_approved: true,
            is_verified: true,
            is_busy: false,
            active_session_id: None,
            missed_requests: 0,
            total_sessions: 0,
            withdrawable_earnings: Decimal::ZERO,
            ytd_gross_earnings: Decimal::ZERO,
            ytd_tax_withheld: Decimal::ZERO,
            tax_year_start,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn availability(&self) -> Availability {
        match (self.is_busy, self.active_session_id) {
            (false, None) => Availability::Free,
            (true, Some(session_id)) => Availability::BusyWith(session_id),
            _ => Availability::Inconsistent,
        }
    }

    pub fn accepts_requests(&self) -> bool {
        self.is_approved && self.is_verified
    }
}
