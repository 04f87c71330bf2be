//! Business settings consumed by billing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSettings {
    /// Share of each charge drawn from the bonus wallet, in percent.
    pub bonus_usage_percent: Decimal,
    /// Provider's share of real-money charges, in percent.
    pub commission_percent: Decimal,
    /// Year-to-date gross earnings above which tax is withheld.
    pub tax_threshold: Decimal,
    pub tax_rate_percent: Decimal,
    /// Floor kept on provider earnings by withdrawals.
    pub min_balance_to_maintain: Decimal,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            bonus_usage_percent: dec!(20),
            commission_percent: dec!(60),
            tax_threshold: dec!(20000),
            tax_rate_percent: dec!(10),
            min_balance_to_maintain: dec!(500),
        }
    }
}
