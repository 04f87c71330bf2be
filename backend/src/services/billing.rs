//! Pure billing arithmetic shared by every ledger store.
//!
//! Nothing in here touches persistence: stores load and lock the rows, hand
//! them to these functions, and write back whatever plan comes out.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::models::{
    account::ClientAccount,
    party::Role,
    provider::ProviderProfile,
    session::ChatSession,
    settings::BillingSettings,
    transaction::{Direction, LedgerTransaction, TransactionKind, TransactionStatus},
};
use crate::types::TransactionId;

const HUNDRED: Decimal = dec!(100);
const MILLIS_PER_MINUTE: Decimal = dec!(60000);

/// Rounds a monetary amount to two decimal places, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Portion of a charge drawn from each wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletSplit {
    pub bonus: Decimal,
    pub real: Decimal,
}

impl WalletSplit {
    pub fn total(&self) -> Decimal {
        self.bonus + self.real
    }
}

/// Splits `charge` between the bonus and real wallets.
///
/// The bonus share is `bonus_percent` of the charge, capped by what the bonus
/// wallet actually holds; the shortfall moves to the real wallet.
pub fn split_charge(charge: Decimal, bonus_available: Decimal, bonus_percent: Decimal) -> WalletSplit {
    let wanted = round_money(charge * bonus_percent / HUNDRED);
    let bonus = wanted.min(bonus_available.max(Decimal::ZERO)).max(Decimal::ZERO);
    WalletSplit {
        bonus,
        real: charge - bonus,
    }
}

/// Provider's gross share of the real-money part of a charge.
pub fn provider_share(real_deduction: Decimal, commission_percent: Decimal) -> Decimal {
    round_money(real_deduction * commission_percent / HUNDRED)
}

/// Tax withheld on a credit of `gross` given the year-to-date gross before it.
///
/// The cycle that first pushes the running total over `threshold` withholds
/// on the whole post-cycle total; cycles already above it withhold only on
/// their own increment.
pub fn withhold_tax(
    ytd_gross_before: Decimal,
    gross: Decimal,
    threshold: Decimal,
    rate_percent: Decimal,
) -> Decimal {
    if gross <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let after = ytd_gross_before + gross;
    if after <= threshold {
        return Decimal::ZERO;
    }
    let taxable = if ytd_gross_before <= threshold {
        after
    } else {
        gross
    };
    round_money(taxable * rate_percent / HUNDRED)
}

/// First day of the financial year containing `at`, evaluated in `tz`.
pub fn financial_year_start(at: DateTime<Utc>, tz: Tz, start_month: u32) -> NaiveDate {
    let start_month = start_month.clamp(1, 12);
    let local = at.with_timezone(&tz).date_naive();
    let year = if local.month() >= start_month {
        local.year()
    } else {
        local.year() - 1
    };
    NaiveDate::from_ymd_opt(year, start_month, 1).unwrap_or(local)
}

/// Exact elapsed wall-clock time in fractional minutes (millisecond precision).
pub fn elapsed_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> Decimal {
    let millis = (end - start).num_milliseconds().max(0);
    Decimal::from(millis) / MILLIS_PER_MINUTE
}

/// Amount still owed when a metered session ends at `end`.
pub fn settlement_remainder(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rate_per_minute: Decimal,
    already_charged: Decimal,
) -> Decimal {
    let expected = round_money(elapsed_minutes(start, end) * rate_per_minute);
    (expected - already_charged).max(Decimal::ZERO)
}

/// Effect of one credit on a provider's earnings ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarningsCredit {
    pub gross: Decimal,
    pub tax: Decimal,
    pub net: Decimal,
    pub ytd_gross_after: Decimal,
    pub ytd_tax_after: Decimal,
    pub withdrawable_after: Decimal,
    pub tax_year_start: NaiveDate,
}

/// Credits `gross` to the provider, rolling the YTD counters over when the
/// charge lands in a later financial year.
pub fn credit_earnings(
    provider: &ProviderProfile,
    gross: Decimal,
    settings: &BillingSettings,
    tax_year_start: NaiveDate,
) -> EarningsCredit {
    let (ytd_gross, ytd_tax, year) = if provider.tax_year_start < tax_year_start {
        (Decimal::ZERO, Decimal::ZERO, tax_year_start)
    } else {
        (
            provider.ytd_gross_earnings,
            provider.ytd_tax_withheld,
            provider.tax_year_start,
        )
    };
    let tax = withhold_tax(
        ytd_gross,
        gross,
        settings.tax_threshold,
        settings.tax_rate_percent,
    );
    let net = gross - tax;
    EarningsCredit {
        gross,
        tax,
        net,
        ytd_gross_after: ytd_gross + gross,
        ytd_tax_after: ytd_tax + tax,
        withdrawable_after: provider.withdrawable_earnings + net,
        tax_year_start: year,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeRefusal {
    /// Combined wallets, or the real wallet's share, cannot cover the charge.
    InsufficientFunds,
}

/// Fully computed effect of one charge on the client and provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargePlan {
    /// Amount actually collected from the client.
    pub charged: Decimal,
    /// Amount owed but not collectable (final settlement only).
    pub uncollected: Decimal,
    pub split: WalletSplit,
    pub earnings: EarningsCredit,
    pub real_balance_after: Decimal,
    pub bonus_balance_after: Decimal,
}

impl ChargePlan {
    pub fn apply_to(&self, client: &mut ClientAccount, provider: &mut ProviderProfile) {
        client.real_balance = self.real_balance_after;
        client.bonus_balance = self.bonus_balance_after;
        provider.withdrawable_earnings = self.earnings.withdrawable_after;
        provider.ytd_gross_earnings = self.earnings.ytd_gross_after;
        provider.ytd_tax_withheld = self.earnings.ytd_tax_after;
        provider.tax_year_start = self.earnings.tax_year_start;
    }
}

fn finish_plan(
    charged: Decimal,
    uncollected: Decimal,
    split: WalletSplit,
    client: &ClientAccount,
    provider: &ProviderProfile,
    settings: &BillingSettings,
    tax_year_start: NaiveDate,
) -> ChargePlan {
    let gross = provider_share(split.real, settings.commission_percent);
    ChargePlan {
        charged,
        uncollected,
        split,
        earnings: credit_earnings(provider, gross, settings, tax_year_start),
        real_balance_after: client.real_balance - split.real,
        bonus_balance_after: client.bonus_balance - split.bonus,
    }
}

/// Plans one full billing cycle. All or nothing: a plan is only produced when
/// both wallets can cover their share.
pub fn plan_cycle_charge(
    amount: Decimal,
    client: &ClientAccount,
    provider: &ProviderProfile,
    settings: &BillingSettings,
    tax_year_start: NaiveDate,
) -> Result<ChargePlan, ChargeRefusal> {
    if !client.can_afford(amount) {
        return Err(ChargeRefusal::InsufficientFunds);
    }
    let split = split_charge(amount, client.bonus_balance, settings.bonus_usage_percent);
    if split.real > client.real_balance {
        return Err(ChargeRefusal::InsufficientFunds);
    }
    Ok(finish_plan(
        amount,
        Decimal::ZERO,
        split,
        client,
        provider,
        settings,
        tax_year_start,
    ))
}

/// Plans the final partial-cycle charge. The session is ending regardless, so
/// instead of refusing, the charge is capped at what the wallets hold: real
/// shortfall is first covered by remaining bonus, anything left is reported
/// as uncollected.
pub fn plan_settlement(
    amount: Decimal,
    client: &ClientAccount,
    provider: &ProviderProfile,
    settings: &BillingSettings,
    tax_year_start: NaiveDate,
) -> ChargePlan {
    let mut split = split_charge(amount, client.bonus_balance, settings.bonus_usage_percent);
    let real_available = client.real_balance.max(Decimal::ZERO);
    if split.real > real_available {
        let shortfall = split.real - real_available;
        let spare_bonus = (client.bonus_balance - split.bonus).max(Decimal::ZERO);
        split.bonus += shortfall.min(spare_bonus);
        split.real = real_available;
    }
    let charged = split.total();
    finish_plan(
        charged,
        amount - charged,
        split,
        client,
        provider,
        settings,
        tax_year_start,
    )
}

/// Ledger rows recording one executed plan: a client debit and, when the
/// provider earned anything, a provider credit.
pub fn ledger_entries(
    session: &ChatSession,
    kind: TransactionKind,
    plan: &ChargePlan,
    at: DateTime<Utc>,
) -> Vec<LedgerTransaction> {
    let label = match kind {
        TransactionKind::BillingCycle => "Chat billing cycle",
        TransactionKind::FinalSettlement => "Chat final settlement",
    };
    let mut entries = Vec::with_capacity(2);
    if plan.charged > Decimal::ZERO {
        entries.push(LedgerTransaction {
            id: TransactionId::new(),
            session_id: session.id,
            client_id: session.client_id,
            provider_id: session.provider_id,
            kind,
            direction: Direction::Debit,
            party_role: Role::Client,
            amount: plan.charged,
            real_amount: plan.split.real,
            bonus_amount: plan.split.bonus,
            tax_withheld: Decimal::ZERO,
            description: format!("{} debit at {}/min", label, session.rate_per_minute),
            status: TransactionStatus::Completed,
            created_at: at,
        });
    }
    if plan.earnings.gross > Decimal::ZERO {
        entries.push(LedgerTransaction {
            id: TransactionId::new(),
            session_id: session.id,
            client_id: session.client_id,
            provider_id: session.provider_id,
            kind,
            direction: Direction::Credit,
            party_role: Role::Provider,
            amount: plan.earnings.net,
            real_amount: plan.split.real,
            bonus_amount: Decimal::ZERO,
            tax_withheld: plan.earnings.tax,
            description: format!("{} earnings (gross {})", label, plan.earnings.gross),
            status: TransactionStatus::Completed,
            created_at: at,
        });
    }
    entries
}
