//! In-process ledger store.
//!
//! One mutex guards every record, so each trait method is trivially atomic.
//! Used for single-process deployments and to drive the engine in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::models::{
    account::ClientAccount,
    party::{Party, Role},
    provider::ProviderProfile,
    session::{ChatSession, SessionStatus},
    transaction::{LedgerTransaction, TransactionKind},
};
use crate::repositories::ledger::{
    ActivationOutcome, ChargeOutcome, ChargeReceipt, CloseRequest, ClosedSession, CycleCharge,
    JoinOutcome, LedgerStore, PendingResolution,
};
use crate::services::billing::{self, ChargeRefusal};
use crate::types::{ClientId, ProviderId, SessionId};

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, ChatSession>,
    clients: HashMap<ClientId, ClientAccount>,
    providers: HashMap<ProviderId, ProviderProfile>,
    transactions: Vec<LedgerTransaction>,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<Inner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_client(&self, client: ClientAccount) {
        self.inner.lock().clients.insert(client.id, client);
    }

    pub fn upsert_provider(&self, provider: ProviderProfile) {
        self.inner.lock().providers.insert(provider.id, provider);
    }

    /// Writes a session row as-is, bypassing the state machine.
    pub fn upsert_session(&self, session: ChatSession) {
        self.inner.lock().sessions.insert(session.id, session);
    }

    pub fn update_client(&self, id: ClientId, f: impl FnOnce(&mut ClientAccount)) {
        if let Some(client) = self.inner.lock().clients.get_mut(&id) {
            f(client);
        }
    }

    pub fn update_provider(&self, id: ProviderId, f: impl FnOnce(&mut ProviderProfile)) {
        if let Some(provider) = self.inner.lock().providers.get_mut(&id) {
            f(provider);
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.lock().transactions.len()
    }
}

impl Inner {
    fn open_session_for(&self, party: Party) -> Option<&ChatSession> {
        self.sessions
            .values()
            .filter(|s| matches!(s.status, SessionStatus::Pending | SessionStatus::Active))
            .filter(|s| s.is_participant(&party))
            .max_by_key(|s| s.created_at)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_session(&self, id: SessionId) -> Result<Option<ChatSession>, StoreError> {
        Ok(self.inner.lock().sessions.get(&id).cloned())
    }

    async fn find_client(&self, id: ClientId) -> Result<Option<ClientAccount>, StoreError> {
        Ok(self.inner.lock().clients.get(&id).cloned())
    }

    async fn find_provider(&self, id: ProviderId) -> Result<Option<ProviderProfile>, StoreError> {
        Ok(self.inner.lock().providers.get(&id).cloned())
    }

    async fn find_pending_for_client(
        &self,
        client_id: ClientId,
    ) -> Result<Option<ChatSession>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sessions
            .values()
            .find(|s| s.client_id == client_id && s.status == SessionStatus::Pending)
            .cloned())
    }

    async fn find_open_for(&self, party: Party) -> Result<Option<ChatSession>, StoreError> {
        Ok(self.inner.lock().open_session_for(party).cloned())
    }

    async fn list_open_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
        let inner = self.inner.lock();
        let mut open: Vec<ChatSession> = inner
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|s| s.created_at);
        Ok(open)
    }

    async fn list_transactions(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        Ok(self
            .inner
            .lock()
            .transactions
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_pending(&self, session: &ChatSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let duplicate = inner
            .sessions
            .values()
            .any(|s| s.client_id == session.client_id && s.status == SessionStatus::Pending);
        if duplicate {
            return Err(StoreError::DuplicatePending);
        }
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn activate(
        &self,
        session_id: SessionId,
        provider_id: ProviderId,
        at: DateTime<Utc>,
        start_clock: bool,
    ) -> Result<ActivationOutcome, StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let provider = inner
            .providers
            .get_mut(&provider_id)
            .ok_or(StoreError::Missing("provider"))?;
        if provider.is_busy {
            return Ok(ActivationOutcome::ProviderBusy(provider.active_session_id));
        }
        let session = match inner.sessions.get_mut(&session_id) {
            Some(s) if s.status.can_transition_to(SessionStatus::Active) => s,
            _ => return Ok(ActivationOutcome::NotPending),
        };

        if session.is_free_trial {
            let client = inner
                .clients
                .get_mut(&session.client_id)
                .ok_or(StoreError::Missing("client"))?;
            if client.free_trial_used {
                return Ok(ActivationOutcome::TrialAlreadyUsed);
            }
            client.free_trial_used = true;
            client.updated_at = at;
        }

        provider.is_busy = true;
        provider.active_session_id = Some(session_id);
        provider.updated_at = at;

        session.status = SessionStatus::Active;
        session.start_time = start_clock.then_some(at);
        session.updated_at = at;
        Ok(ActivationOutcome::Activated(session.clone()))
    }

    async fn resolve_pending(
        &self,
        session_id: SessionId,
        resolution: PendingResolution,
    ) -> Result<Option<ChatSession>, StoreError> {
        resolution.ensure_legal()?;
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Ok(None);
        };
        if session.status != SessionStatus::Pending {
            return Ok(None);
        }
        if let Some(client_id) = resolution.client_guard {
            if session.client_id != client_id {
                return Ok(None);
            }
        }
        session.status = resolution.status;
        session.end_reason = Some(resolution.reason);
        session.ended_by = resolution.ended_by;
        session.end_time = Some(resolution.at);
        session.updated_at = resolution.at;
        let resolved = session.clone();

        if resolution.count_missed {
            if let Some(provider) = inner.providers.get_mut(&resolved.provider_id) {
                provider.missed_requests += 1;
                provider.updated_at = resolution.at;
            }
        }
        Ok(Some(resolved))
    }

    async fn release_provider_lock(
        &self,
        provider_id: ProviderId,
        session_id: SessionId,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.providers.get_mut(&provider_id) {
            Some(provider) if provider.active_session_id == Some(session_id) => {
                provider.is_busy = false;
                provider.active_session_id = None;
                provider.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_joined(
        &self,
        session_id: SessionId,
        role: Role,
        at: DateTime<Utc>,
        start_clock: bool,
    ) -> Result<Option<JoinOutcome>, StoreError> {
        let mut inner = self.inner.lock();
        let session = match inner.sessions.get_mut(&session_id) {
            Some(s) if s.status == SessionStatus::Active => s,
            _ => return Ok(None),
        };
        let flag = match role {
            Role::Client => &mut session.user_joined,
            Role::Provider => &mut session.provider_joined,
        };
        let newly_joined = !*flag;
        *flag = true;
        let completed_pair = newly_joined && session.user_joined && session.provider_joined;
        if completed_pair && start_clock {
            session.start_time = Some(at);
        }
        session.updated_at = at;
        Ok(Some(JoinOutcome {
            session: session.clone(),
            completed_pair,
        }))
    }

    async fn apply_cycle_charge(
        &self,
        session_id: SessionId,
        charge: CycleCharge,
    ) -> Result<ChargeOutcome, StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = match inner.sessions.get_mut(&session_id) {
            Some(s) if s.status == SessionStatus::Active => s,
            _ => return Ok(ChargeOutcome::SessionInactive),
        };
        let client = inner
            .clients
            .get_mut(&session.client_id)
            .ok_or(StoreError::Missing("client"))?;
        let provider = inner
            .providers
            .get_mut(&session.provider_id)
            .ok_or(StoreError::Missing("provider"))?;

        let amount = billing::round_money(session.rate_per_minute * charge.cycle_minutes);
        let plan = match billing::plan_cycle_charge(
            amount,
            client,
            provider,
            &charge.settings,
            charge.tax_year_start,
        ) {
            Ok(plan) => plan,
            Err(ChargeRefusal::InsufficientFunds) => return Ok(ChargeOutcome::InsufficientFunds),
        };

        plan.apply_to(client, provider);
        client.updated_at = charge.at;
        provider.updated_at = charge.at;
        session.total_minutes += charge.cycle_minutes;
        session.total_amount += plan.charged;
        session.provider_earnings += plan.earnings.gross;
        session.updated_at = charge.at;

        let entries =
            billing::ledger_entries(session, TransactionKind::BillingCycle, &plan, charge.at);
        let receipt = ChargeReceipt {
            session: session.clone(),
            client: client.clone(),
            provider: provider.clone(),
            plan,
        };
        inner.transactions.extend(entries);
        Ok(ChargeOutcome::Charged(Box::new(receipt)))
    }

    async fn close_active(
        &self,
        session_id: SessionId,
        request: CloseRequest,
    ) -> Result<Option<ClosedSession>, StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = match inner.sessions.get_mut(&session_id) {
            Some(s) if s.status == SessionStatus::Active => s,
            _ => return Ok(None),
        };
        let client = inner
            .clients
            .get_mut(&session.client_id)
            .ok_or(StoreError::Missing("client"))?;
        let provider = inner
            .providers
            .get_mut(&session.provider_id)
            .ok_or(StoreError::Missing("provider"))?;

        let start = session.start_time.unwrap_or(request.at);
        let mut settlement = None;
        if !session.is_free_trial {
            let remainder = billing::settlement_remainder(
                start,
                request.at,
                session.rate_per_minute,
                session.total_amount,
            );
            if remainder > Decimal::ZERO {
                let plan = billing::plan_settlement(
                    remainder,
                    client,
                    provider,
                    &request.settings,
                    request.tax_year_start,
                );
                plan.apply_to(client, provider);
                session.total_amount += plan.charged;
                session.provider_earnings += plan.earnings.gross;
                let entries = billing::ledger_entries(
                    session,
                    TransactionKind::FinalSettlement,
                    &plan,
                    request.at,
                );
                inner.transactions.extend(entries);
                settlement = Some(plan);
            }
            client.updated_at = request.at;
        }

        session.status = SessionStatus::Ended;
        session.end_time = Some(request.at);
        session.end_reason = Some(request.reason);
        session.ended_by = request.ended_by;
        session.total_minutes = billing::elapsed_minutes(start, request.at).round_dp(2);
        session.updated_at = request.at;

        if provider.active_session_id == Some(session_id) {
            provider.is_busy = false;
            provider.active_session_id = None;
        }
        provider.total_sessions += 1;
        provider.updated_at = request.at;

        Ok(Some(ClosedSession {
            session: session.clone(),
            settlement,
        }))
    }
}
