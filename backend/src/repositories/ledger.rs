//! Ledger store contract.
//!
//! Every method that mutates more than one record is atomic: either all of
//! its writes land or none do. Status transitions are compare-and-swap on the
//! session's current status, so concurrent callers (possibly in different
//! processes) resolve races by whoever commits first.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::models::{
    account::ClientAccount,
    party::{Party, Role},
    provider::ProviderProfile,
    session::{ChatSession, EndReason, SessionStatus},
    settings::BillingSettings,
    transaction::LedgerTransaction,
};
use crate::services::billing::ChargePlan;
use crate::types::{ClientId, ProviderId, SessionId};

/// Result of the PENDING -> ACTIVE compare-and-swap paired with the provider lock.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    Activated(ChatSession),
    /// Provider lock already held; carries the recorded blocking session.
    ProviderBusy(Option<SessionId>),
    /// Session left PENDING before the swap (cancelled, rejected or timed out).
    NotPending,
    /// Trial session whose client already consumed the one-time trial.
    TrialAlreadyUsed,
}

/// Result of marking a party present in the room of an ACTIVE session.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub session: ChatSession,
    /// This join flipped the last missing flag; both parties are now present.
    pub completed_pair: bool,
}

/// Terminal resolution of a PENDING session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingResolution {
    pub status: SessionStatus,
    pub reason: EndReason,
    pub ended_by: Option<Role>,
    pub at: DateTime<Utc>,
    /// Only resolve when the session belongs to this client.
    pub client_guard: Option<ClientId>,
    /// Bump the provider's missed-request counter in the same write.
    pub count_missed: bool,
}

impl PendingResolution {
    /// Refuses target states that are not a terminal edge out of PENDING.
    pub fn ensure_legal(&self) -> Result<(), StoreError> {
        if self.status.is_terminal() && SessionStatus::Pending.can_transition_to(self.status) {
            Ok(())
        } else {
            Err(StoreError::IllegalTransition {
                from: SessionStatus::Pending,
                to: self.status,
            })
        }
    }
}

/// Parameters for one full billing cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleCharge {
    /// Length of one cycle in minutes; the charge is `rate * cycle_minutes`.
    pub cycle_minutes: Decimal,
    pub settings: BillingSettings,
    pub tax_year_start: NaiveDate,
    pub at: DateTime<Utc>,
}

/// Committed effect of a charge, with the post-commit rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeReceipt {
    pub session: ChatSession,
    pub client: ClientAccount,
    pub provider: ProviderProfile,
    pub plan: ChargePlan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    Charged(Box<ChargeReceipt>),
    /// Session is no longer ACTIVE; nothing was written.
    SessionInactive,
    /// Wallets cannot cover the cycle; nothing was written.
    InsufficientFunds,
}

/// Parameters for closing an ACTIVE session.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub reason: EndReason,
    pub ended_by: Option<Role>,
    pub at: DateTime<Utc>,
    pub settings: BillingSettings,
    pub tax_year_start: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedSession {
    pub session: ChatSession,
    /// Final partial-cycle charge, when one was due.
    pub settlement: Option<ChargePlan>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_session(&self, id: SessionId) -> Result<Option<ChatSession>, StoreError>;

    async fn find_client(&self, id: ClientId) -> Result<Option<ClientAccount>, StoreError>;

    async fn find_provider(&self, id: ProviderId) -> Result<Option<ProviderProfile>, StoreError>;

    async fn find_pending_for_client(
        &self,
        client_id: ClientId,
    ) -> Result<Option<ChatSession>, StoreError>;

    /// Most recent PENDING or ACTIVE session the party takes part in.
    async fn find_open_for(&self, party: Party) -> Result<Option<ChatSession>, StoreError>;

    /// All PENDING and ACTIVE sessions, oldest first.
    async fn list_open_sessions(&self) -> Result<Vec<ChatSession>, StoreError>;

    async fn list_transactions(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<LedgerTransaction>, StoreError>;

    /// Inserts a PENDING session; fails with `DuplicatePending` when the client
    /// already has one.
    async fn insert_pending(&self, session: &ChatSession) -> Result<(), StoreError>;

    /// Takes the provider lock and swaps PENDING -> ACTIVE in one unit. A trial
    /// session also claims the client's one-time trial in the same unit. When
    /// the swap loses, neither the lock nor the claim is left behind.
    ///
    /// `start_clock` sets `start_time` to `at`; otherwise it stays unset until
    /// both parties have joined.
    async fn activate(
        &self,
        session_id: SessionId,
        provider_id: ProviderId,
        at: DateTime<Utc>,
        start_clock: bool,
    ) -> Result<ActivationOutcome, StoreError>;

    /// Compare-and-swap out of PENDING into a terminal state. `None` means the
    /// swap lost; a resolution that is not a legal terminal edge is an error.
    async fn resolve_pending(
        &self,
        session_id: SessionId,
        resolution: PendingResolution,
    ) -> Result<Option<ChatSession>, StoreError>;

    /// Clears a provider lock that still points at `session_id`. Returns
    /// whether anything changed.
    async fn release_provider_lock(
        &self,
        provider_id: ProviderId,
        session_id: SessionId,
    ) -> Result<bool, StoreError>;

    /// Sets the join flag for `role` on an ACTIVE session. With `start_clock`,
    /// the join that completes the pair also sets `start_time` to `at`.
    async fn mark_joined(
        &self,
        session_id: SessionId,
        role: Role,
        at: DateTime<Utc>,
        start_clock: bool,
    ) -> Result<Option<JoinOutcome>, StoreError>;

    /// Debits the client, credits the provider, bumps session totals and
    /// appends ledger rows, all guarded on the session still being ACTIVE.
    async fn apply_cycle_charge(
        &self,
        session_id: SessionId,
        charge: CycleCharge,
    ) -> Result<ChargeOutcome, StoreError>;

    /// ACTIVE -> ENDED: final settlement, provider lock release and counters
    /// in one unit. `None` when the session was not ACTIVE.
    async fn close_active(
        &self,
        session_id: SessionId,
        request: CloseRequest,
    ) -> Result<Option<ClosedSession>, StoreError>;
}
