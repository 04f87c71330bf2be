//! Append-only ledger entries written by billing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::models::party::Role;
use crate::types::{ClientId, ProviderId, SessionId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Debit,
    Credit,
}

text_enum!(Direction {
    Debit => "debit",
    Credit => "credit",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// One full billing cycle.
    BillingCycle,
    /// Sub-cycle remainder charged when the session ends.
    FinalSettlement,
}

text_enum!(TransactionKind {
    BillingCycle => "billing_cycle",
    FinalSettlement => "final_settlement",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
}

text_enum!(TransactionStatus {
    Completed => "completed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct LedgerTransaction {
    #[schema(value_type = String)]
    pub id: TransactionId,
    #[schema(value_type = String)]
    pub session_id: SessionId,
    #[schema(value_type = String)]
    pub client_id: ClientId,
    #[schema(value_type = String)]
    pub provider_id: ProviderId,
    pub kind: TransactionKind,
    pub direction: Direction,
    /// Whose balance this entry moves.
    pub party_role: Role,
    pub amount: Decimal,
    pub real_amount: Decimal,
    pub bonus_amount: Decimal,
    pub tax_withheld: Decimal,
    pub description: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}
