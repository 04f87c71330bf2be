//! Client account with its two wallets.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::ClientId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ClientAccount {
    pub id: ClientId,
    pub display_name: String,
    /// Real-money wallet; never negative.
    pub real_balance: Decimal,
    /// Promotional bonus wallet; never negative.
    pub bonus_balance: Decimal,
    pub free_trial_used: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClientAccount {
    pub fn new(display_name: impl Into<String>, real_balance: Decimal, bonus_balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: ClientId::new(),
            display_name: display_name.into(),
            real_balance,
            bonus_balance,
            free_trial_used: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn combined_balance(&self) -> Decimal {
        self.real_balance + self.bonus_balance
    }

    pub fn can_afford(&self, amount: Decimal) -> bool {
        self.combined_balance() >= amount
    }
}
