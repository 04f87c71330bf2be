//! Session engine: lifecycle, provider lock, billing loop and timers.
//!
//! All contested transitions go through the ledger store's atomic
//! operations; this layer decides what to ask for, arms and disarms timers,
//! and tells the parties what happened.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{SessionError, StoreError};
use crate::models::{
    event::ChatEvent,
    party::{Party, Role},
    provider::Availability,
    session::{ChatSession, EndReason, SessionStatus},
    transaction::LedgerTransaction,
};
use crate::repositories::ledger::{
    ActivationOutcome, ChargeOutcome, CloseRequest, CycleCharge, LedgerStore, PendingResolution,
};
use crate::services::billing;
use crate::services::clock::{Clock, SystemClock};
use crate::services::notifier::EventDispatcher;
use crate::services::settings::SettingsProvider;
use crate::services::timers::{TickControl, TimerKind, TimerRegistry};
use crate::types::{ClientId, ProviderId, SessionId};

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub billing_interval: Duration,
    pub request_timeout: Duration,
    pub free_trial_enabled: bool,
    pub free_trial_duration: Duration,
    pub disconnect_grace: Duration,
    pub time_zone: Tz,
    pub financial_year_start_month: u32,
    /// Defer the billing or trial clock from accept until both parties have
    /// joined the room.
    pub billing_starts_on_join: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            billing_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            free_trial_enabled: true,
            free_trial_duration: Duration::from_secs(300),
            disconnect_grace: Duration::from_secs(60),
            time_zone: chrono_tz::Asia::Kolkata,
            financial_year_start_month: 4,
            billing_starts_on_join: false,
        }
    }
}

impl ChatConfig {
    /// Length of one billing cycle in minutes.
    pub fn cycle_minutes(&self) -> Decimal {
        Decimal::from(self.billing_interval.as_millis() as u64) / dec!(60000)
    }

    /// Amount one full cycle costs at `rate_per_minute`.
    pub fn cycle_charge(&self, rate_per_minute: Decimal) -> Decimal {
        billing::round_money(rate_per_minute * self.cycle_minutes())
    }
}

/// Result of one billing tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Charged,
    /// Transient failure; the cycle is retried on the next tick.
    Skipped,
    /// Session already left ACTIVE.
    Stopped,
    Ended(EndReason),
}

impl TickOutcome {
    fn control(self) -> TickControl {
        match self {
            TickOutcome::Charged | TickOutcome::Skipped => TickControl::Continue,
            TickOutcome::Stopped | TickOutcome::Ended(_) => TickControl::Stop,
        }
    }
}

pub struct ChatService {
    store: Arc<dyn LedgerStore>,
    settings: Arc<dyn SettingsProvider>,
    events: EventDispatcher,
    timers: Arc<TimerRegistry>,
    clock: Arc<dyn Clock>,
    config: ChatConfig,
    this: Weak<ChatService>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        settings: Arc<dyn SettingsProvider>,
        events: EventDispatcher,
        config: ChatConfig,
    ) -> Arc<Self> {
        Self::with_clock(store, settings, events, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn LedgerStore>,
        settings: Arc<dyn SettingsProvider>,
        events: EventDispatcher,
        config: ChatConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            settings,
            events,
            timers: TimerRegistry::new(),
            clock,
            config,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    fn tax_year_start(&self, at: DateTime<Utc>) -> NaiveDate {
        billing::financial_year_start(
            at,
            self.config.time_zone,
            self.config.financial_year_start_month,
        )
    }

    async fn load_session(&self, session_id: SessionId) -> Result<ChatSession, SessionError> {
        self.store
            .find_session(session_id)
            .await?
            .ok_or(SessionError::SessionNotFound)
    }

    async fn load_participant_session(
        &self,
        party: Party,
        session_id: SessionId,
    ) -> Result<ChatSession, SessionError> {
        let session = self.load_session(session_id).await?;
        if !session.is_participant(&party) {
            return Err(SessionError::NotParticipant);
        }
        Ok(session)
    }

    /// Error for a PENDING-only operation on a session in another state.
    fn not_pending(session: &ChatSession) -> SessionError {
        if session.status.is_terminal() {
            SessionError::RequestUnavailable
        } else {
            SessionError::InvalidState {
                expected: SessionStatus::Pending,
                actual: session.status,
            }
        }
    }

    fn not_active(status: SessionStatus) -> SessionError {
        SessionError::InvalidState {
            expected: SessionStatus::Active,
            actual: status,
        }
    }

    // ---- request lifecycle ----

    /// Client asks a provider for a session.
    pub async fn create_request(
        &self,
        client_id: ClientId,
        provider_id: ProviderId,
        previous_session_id: Option<SessionId>,
    ) -> Result<ChatSession, SessionError> {
        let client = self
            .store
            .find_client(client_id)
            .await?
            .ok_or(SessionError::ClientNotFound)?;
        let provider = self
            .store
            .find_provider(provider_id)
            .await?
            .ok_or(SessionError::ProviderNotFound)?;

        if !provider.is_online {
            return Err(SessionError::ProviderOffline);
        }
        if !provider.accepts_requests() {
            return Err(SessionError::ProviderNotApproved);
        }

        if let Some(previous_id) = previous_session_id {
            let previous = self
                .store
                .find_session(previous_id)
                .await?
                .ok_or_else(|| SessionError::Validation("previous session not found".into()))?;
            if previous.client_id != client_id || previous.provider_id != provider_id {
                return Err(SessionError::Validation(
                    "previous session belongs to a different client or provider".into(),
                ));
            }
            if previous.status != SessionStatus::Ended {
                return Err(SessionError::Validation(
                    "only an ended session can be continued".into(),
                ));
            }
        }

        if self.store.find_pending_for_client(client_id).await?.is_some() {
            return Err(SessionError::DuplicatePending);
        }

        match provider.availability() {
            Availability::Free => {}
            Availability::Inconsistent => {
                tracing::warn!(
                    provider_id = %provider_id,
                    is_busy = provider.is_busy,
                    active_session_id = ?provider.active_session_id,
                    "Provider lock is inconsistent, refusing request"
                );
                return Err(SessionError::ProviderStateInconsistent);
            }
            Availability::BusyWith(blocking) => {
                self.heal_stale_lock(client_id, provider_id, blocking).await?;
            }
        }

        let trial_eligible = self.config.free_trial_enabled
            && !client.free_trial_used
            && previous_session_id.is_none();
        if !trial_eligible && !client.can_afford(self.config.cycle_charge(provider.rate_per_minute)) {
            return Err(SessionError::InsufficientBalance);
        }
        let trial_secs = trial_eligible.then(|| self.config.free_trial_duration.as_secs() as i64);

        let mut session = ChatSession::new_pending(
            client_id,
            provider_id,
            provider.rate_per_minute,
            trial_secs,
            previous_session_id,
        );
        let now = self.clock.now();
        session.created_at = now;
        session.updated_at = now;

        match self.store.insert_pending(&session).await {
            Ok(()) => {}
            Err(StoreError::DuplicatePending) => return Err(SessionError::DuplicatePending),
            Err(err) => return Err(err.into()),
        }

        self.arm_request_timeout(session.id, self.config.request_timeout);

        tracing::info!(
            session_id = %session.id,
            client_id = %client_id,
            provider_id = %provider_id,
            rate_per_minute = %session.rate_per_minute,
            is_free_trial = session.is_free_trial,
            is_continuation = session.is_continuation,
            "Chat request created"
        );

        let event = ChatEvent::ChatRequest {
            session_id: session.id,
            client_id,
            client_name: client.display_name.clone(),
            rate_per_minute: session.rate_per_minute,
            is_free_trial: session.is_free_trial,
            is_continuation: session.is_continuation,
            expires_in_secs: self.config.request_timeout.as_secs(),
        };
        self.events.notify_and_push(session.provider(), &event).await;

        Ok(session)
    }

    /// Provider is locked by `blocking`. A lock left behind by the same
    /// client's own session is released; anything else stays busy.
    async fn heal_stale_lock(
        &self,
        client_id: ClientId,
        provider_id: ProviderId,
        blocking: SessionId,
    ) -> Result<(), SessionError> {
        let Some(stale) = self.store.find_session(blocking).await? else {
            tracing::warn!(
                provider_id = %provider_id,
                blocking_session_id = %blocking,
                "Provider locked by a missing session; needs manual intervention"
            );
            return Err(SessionError::ProviderBusy);
        };
        if stale.client_id != client_id {
            return Err(SessionError::ProviderBusy);
        }

        match stale.status {
            SessionStatus::Active => {
                tracing::info!(
                    session_id = %stale.id,
                    client_id = %client_id,
                    provider_id = %provider_id,
                    "Force-ending stale session held by the same client"
                );
                self.finish(stale.id, EndReason::UserEnd, Some(Role::Client))
                    .await?;
            }
            SessionStatus::Ended | SessionStatus::Rejected => {
                tracing::info!(
                    session_id = %stale.id,
                    provider_id = %provider_id,
                    "Releasing provider lock left by a closed session"
                );
                self.store.release_provider_lock(provider_id, stale.id).await?;
            }
            SessionStatus::Pending => return Err(SessionError::ProviderBusy),
        }

        let provider = self
            .store
            .find_provider(provider_id)
            .await?
            .ok_or(SessionError::ProviderNotFound)?;
        if provider.is_busy {
            return Err(SessionError::ProviderBusy);
        }
        Ok(())
    }

    pub async fn accept(
        &self,
        provider_id: ProviderId,
        session_id: SessionId,
    ) -> Result<ChatSession, SessionError> {
        let session = self
            .load_participant_session(Party::Provider(provider_id), session_id)
            .await?;
        if session.status != SessionStatus::Pending {
            return Err(Self::not_pending(&session));
        }

        if !session.is_free_trial {
            let client = self
                .store
                .find_client(session.client_id)
                .await?
                .ok_or(SessionError::ClientNotFound)?;
            if !client.can_afford(self.config.cycle_charge(session.rate_per_minute)) {
                return Err(SessionError::InsufficientBalance);
            }
        }

        let deferred = self.config.billing_starts_on_join;
        let session = match self
            .store
            .activate(session_id, provider_id, self.clock.now(), !deferred)
            .await?
        {
            ActivationOutcome::Activated(session) => session,
            ActivationOutcome::ProviderBusy(blocking) => {
                tracing::debug!(
                    session_id = %session_id,
                    provider_id = %provider_id,
                    blocking_session_id = ?blocking,
                    "Accept refused, provider already busy"
                );
                return Err(SessionError::ProviderBusy);
            }
            ActivationOutcome::NotPending => {
                tracing::debug!(
                    session_id = %session_id,
                    provider_id = %provider_id,
                    "Accept lost the race; request no longer pending"
                );
                return Err(SessionError::RequestUnavailable);
            }
            ActivationOutcome::TrialAlreadyUsed => {
                tracing::warn!(
                    session_id = %session_id,
                    client_id = %session.client_id,
                    "Accept refused, client already consumed the free trial"
                );
                return Err(SessionError::FreeTrialUsed);
            }
        };

        self.timers.cancel(session_id, TimerKind::RequestTimeout);
        if deferred {
            tracing::debug!(session_id = %session.id, "Metering waits for both parties to join");
        } else {
            self.start_metering(&session, Duration::ZERO);
        }

        tracing::info!(
            session_id = %session.id,
            client_id = %session.client_id,
            provider_id = %session.provider_id,
            is_free_trial = session.is_free_trial,
            "Chat session started"
        );

        let event = ChatEvent::RequestAccepted {
            session_id: session.id,
            provider_id: session.provider_id,
            start_time: session.start_time,
            rate_per_minute: session.rate_per_minute,
            is_free_trial: session.is_free_trial,
            trial_duration_secs: session.trial_duration_secs,
        };
        self.events.notify_or_push(session.client(), &event).await;
        self.events.notify(session.provider(), &event);

        Ok(session)
    }

    pub async fn reject(
        &self,
        provider_id: ProviderId,
        session_id: SessionId,
    ) -> Result<ChatSession, SessionError> {
        let session = self
            .load_participant_session(Party::Provider(provider_id), session_id)
            .await?;
        if session.status != SessionStatus::Pending {
            return Err(Self::not_pending(&session));
        }

        let resolution = PendingResolution {
            status: SessionStatus::Rejected,
            reason: EndReason::Rejected,
            ended_by: Some(Role::Provider),
            at: self.clock.now(),
            client_guard: None,
            count_missed: false,
        };
        let Some(session) = self.store.resolve_pending(session_id, resolution).await? else {
            tracing::debug!(session_id = %session_id, "Reject lost the race");
            return Err(SessionError::RequestUnavailable);
        };
        self.timers.cancel(session_id, TimerKind::RequestTimeout);

        tracing::info!(
            session_id = %session.id,
            client_id = %session.client_id,
            provider_id = %session.provider_id,
            "Chat request rejected"
        );
        self.events
            .notify_or_push(session.client(), &ChatEvent::RequestRejected { session_id })
            .await;

        Ok(session)
    }

    /// Client withdraws a request that is still PENDING.
    pub async fn cancel(
        &self,
        client_id: ClientId,
        session_id: SessionId,
    ) -> Result<ChatSession, SessionError> {
        let session = self
            .load_participant_session(Party::Client(client_id), session_id)
            .await?;
        if session.status != SessionStatus::Pending {
            return Err(Self::not_pending(&session));
        }

        let resolution = PendingResolution {
            status: SessionStatus::Ended,
            reason: EndReason::UserEnd,
            ended_by: Some(Role::Client),
            at: self.clock.now(),
            client_guard: Some(client_id),
            count_missed: false,
        };
        let Some(session) = self.store.resolve_pending(session_id, resolution).await? else {
            tracing::debug!(session_id = %session_id, "Cancel lost the race");
            return Err(SessionError::RequestUnavailable);
        };
        self.timers.cancel(session_id, TimerKind::RequestTimeout);

        tracing::info!(
            session_id = %session.id,
            client_id = %session.client_id,
            provider_id = %session.provider_id,
            "Chat request cancelled"
        );
        self.events
            .notify(session.provider(), &ChatEvent::RequestCancelled { session_id });

        Ok(session)
    }

    /// Auto-reject for a request nobody answered. No-op if the request was
    /// already resolved.
    pub async fn expire_request(
        &self,
        session_id: SessionId,
    ) -> Result<Option<ChatSession>, SessionError> {
        self.timers.cancel(session_id, TimerKind::RequestTimeout);
        let resolution = PendingResolution {
            status: SessionStatus::Ended,
            reason: EndReason::Timeout,
            ended_by: None,
            at: self.clock.now(),
            client_guard: None,
            count_missed: true,
        };
        let Some(session) = self.store.resolve_pending(session_id, resolution).await? else {
            tracing::debug!(session_id = %session_id, "Request already resolved before timeout");
            return Ok(None);
        };

        tracing::info!(
            session_id = %session.id,
            client_id = %session.client_id,
            provider_id = %session.provider_id,
            "Chat request timed out"
        );
        let event = ChatEvent::RequestTimedOut { session_id };
        self.events.notify_or_push(session.client(), &event).await;
        self.events.notify(session.provider(), &event);

        Ok(Some(session))
    }

    // ---- active session ----

    /// Either party ends an ACTIVE session.
    pub async fn end(
        &self,
        party: Party,
        session_id: SessionId,
    ) -> Result<ChatSession, SessionError> {
        let session = self.load_participant_session(party, session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(Self::not_active(session.status));
        }

        let role = party.role();
        match self
            .finish(session_id, EndReason::ended_by(role), Some(role))
            .await?
        {
            Some(ended) => Ok(ended),
            None => {
                let current = self.load_session(session_id).await?;
                Err(Self::not_active(current.status))
            }
        }
    }

    /// The single way out of ACTIVE, used by explicit and forced ends alike.
    /// Cancels every timer for the session first. Returns `None` if the
    /// session was already closed by someone else.
    pub async fn finish(
        &self,
        session_id: SessionId,
        reason: EndReason,
        ended_by: Option<Role>,
    ) -> Result<Option<ChatSession>, SessionError> {
        self.timers.cancel_all(session_id);

        let at = self.clock.now();
        let request = CloseRequest {
            reason,
            ended_by,
            at,
            settings: self.settings.current().await,
            tax_year_start: self.tax_year_start(at),
        };
        let Some(closed) = self.store.close_active(session_id, request).await? else {
            tracing::debug!(session_id = %session_id, %reason, "Session already closed");
            return Ok(None);
        };
        let session = closed.session;

        if let Some(plan) = closed
            .settlement
            .as_ref()
            .filter(|plan| plan.uncollected > Decimal::ZERO)
        {
            tracing::warn!(
                session_id = %session.id,
                client_id = %session.client_id,
                uncollected = %plan.uncollected,
                "Final settlement exceeded wallet balance"
            );
        }

        tracing::info!(
            session_id = %session.id,
            client_id = %session.client_id,
            provider_id = %session.provider_id,
            %reason,
            ended_by = ?ended_by,
            total_minutes = %session.total_minutes,
            total_amount = %session.total_amount,
            "Chat session ended"
        );

        let event = ChatEvent::SessionEnded {
            session_id,
            reason,
            ended_by,
            end_time: at,
            total_minutes: session.total_minutes,
            total_amount: session.total_amount,
            provider_earnings: session.provider_earnings,
        };
        self.events.notify_or_push(session.client(), &event).await;
        self.events.notify_or_push(session.provider(), &event).await;

        Ok(Some(session))
    }

    /// One billing cycle for a metered session.
    pub async fn run_billing_tick(&self, session_id: SessionId) -> TickOutcome {
        let session = match self.store.find_session(session_id).await {
            Ok(Some(session)) if session.status == SessionStatus::Active => session,
            Ok(_) => return TickOutcome::Stopped,
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Billing tick could not load session");
                return TickOutcome::Skipped;
            }
        };
        let client = match self.store.find_client(session.client_id).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                tracing::warn!(session_id = %session_id, client_id = %session.client_id, "Billing tick found no client");
                return self.force_end(session_id, EndReason::InsufficientBalance).await;
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Billing tick could not load client");
                return TickOutcome::Skipped;
            }
        };

        let cycle_charge = self.config.cycle_charge(session.rate_per_minute);
        if !client.can_afford(cycle_charge) {
            tracing::warn!(
                session_id = %session_id,
                client_id = %session.client_id,
                combined_balance = %client.combined_balance(),
                "Balance below one cycle, ending session"
            );
            return self.force_end(session_id, EndReason::InsufficientBalance).await;
        }

        let at = self.clock.now();
        let charge = CycleCharge {
            cycle_minutes: self.config.cycle_minutes(),
            settings: self.settings.current().await,
            tax_year_start: self.tax_year_start(at),
            at,
        };
        let receipt = match self.store.apply_cycle_charge(session_id, charge).await {
            Ok(ChargeOutcome::Charged(receipt)) => receipt,
            Ok(ChargeOutcome::SessionInactive) => return TickOutcome::Stopped,
            Ok(ChargeOutcome::InsufficientFunds) => {
                tracing::warn!(
                    session_id = %session_id,
                    client_id = %session.client_id,
                    "Cycle payment refused, ending session"
                );
                return self.force_end(session_id, EndReason::InsufficientBalance).await;
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Billing cycle aborted");
                return TickOutcome::Skipped;
            }
        };

        let session = &receipt.session;
        tracing::debug!(
            session_id = %session.id,
            charged = %receipt.plan.charged,
            real = %receipt.plan.split.real,
            bonus = %receipt.plan.split.bonus,
            provider_gross = %receipt.plan.earnings.gross,
            tax_withheld = %receipt.plan.earnings.tax,
            "Billing cycle committed"
        );

        self.events.notify(
            session.client(),
            &ChatEvent::BillingUpdate {
                session_id,
                total_minutes: session.total_minutes,
                total_amount: session.total_amount,
                charged: receipt.plan.charged,
                real_balance: receipt.client.real_balance,
                bonus_balance: receipt.client.bonus_balance,
            },
        );
        self.events.notify(
            session.provider(),
            &ChatEvent::EarningsUpdate {
                session_id,
                total_minutes: session.total_minutes,
                session_earnings: session.provider_earnings,
                credited: receipt.plan.earnings.net,
                tax_withheld: receipt.plan.earnings.tax,
                withdrawable_earnings: receipt.provider.withdrawable_earnings,
            },
        );

        let remaining = receipt.client.combined_balance();
        if remaining <= Decimal::ZERO {
            return self.force_end(session_id, EndReason::InsufficientBalance).await;
        }
        if remaining < cycle_charge * dec!(2) {
            self.events.notify(
                session.client(),
                &ChatEvent::LowBalance {
                    session_id,
                    combined_balance: remaining,
                    rate_per_minute: session.rate_per_minute,
                },
            );
        }
        TickOutcome::Charged
    }

    async fn force_end(&self, session_id: SessionId, reason: EndReason) -> TickOutcome {
        match self.finish(session_id, reason, None).await {
            Ok(Some(_)) => TickOutcome::Ended(reason),
            Ok(None) => TickOutcome::Stopped,
            Err(err) => {
                tracing::warn!(session_id = %session_id, %reason, error = %err, "Forced end failed");
                TickOutcome::Skipped
            }
        }
    }

    /// Ends a free-trial session once its duration has run out.
    pub async fn expire_trial(
        &self,
        session_id: SessionId,
    ) -> Result<Option<ChatSession>, SessionError> {
        self.finish(session_id, EndReason::FreeTrialEnded, None).await
    }

    /// Marks `party` as present in the session room. When metering is
    /// deferred to the room, the join that completes the pair starts it.
    pub async fn join(&self, party: Party, session_id: SessionId) -> Result<ChatSession, SessionError> {
        let session = self.load_participant_session(party, session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(Self::not_active(session.status));
        }

        let role = party.role();
        let deferred = self.config.billing_starts_on_join;
        let had_grace = self.timers.cancel(session_id, TimerKind::DisconnectGrace(role));
        let at = self.clock.now();
        let Some(joined) = self
            .store
            .mark_joined(session_id, role, at, deferred)
            .await?
        else {
            let current = self.load_session(session_id).await?;
            return Err(Self::not_active(current.status));
        };
        let session = joined.session;

        tracing::info!(
            session_id = %session.id,
            party = %party,
            reconnected = had_grace,
            "Party joined chat session"
        );
        self.events.notify(
            session.counterpart(&party),
            &ChatEvent::PartyJoined { session_id, role },
        );

        if deferred && joined.completed_pair {
            self.start_metering(&session, Duration::ZERO);
            tracing::info!(
                session_id = %session.id,
                is_free_trial = session.is_free_trial,
                "Both parties joined, metering started"
            );
            let event = ChatEvent::MeteringStarted {
                session_id,
                start_time: session.start_time.unwrap_or(at),
                is_free_trial: session.is_free_trial,
            };
            self.events.notify(session.client(), &event);
            self.events.notify(session.provider(), &event);
        }
        Ok(session)
    }

    /// Real-time channel of `party` dropped. Starts the grace timer if the
    /// session is still running; returns whether one was armed.
    pub async fn disconnect(&self, party: Party, session_id: SessionId) -> Result<bool, SessionError> {
        let session = self.load_participant_session(party, session_id).await?;
        if session.status != SessionStatus::Active {
            return Ok(false);
        }

        let role = party.role();
        let grace = self.config.disconnect_grace;
        let this = self.this.clone();
        self.timers
            .schedule_once(session_id, TimerKind::DisconnectGrace(role), grace, move || async move {
                let Some(service) = this.upgrade() else {
                    return;
                };
                if let Err(err) = service
                    .finish(session_id, EndReason::Disconnect, Some(role))
                    .await
                {
                    tracing::warn!(session_id = %session_id, error = %err, "Disconnect end failed");
                }
            });

        tracing::info!(
            session_id = %session_id,
            party = %party,
            grace_secs = grace.as_secs(),
            "Party disconnected, grace period started"
        );
        self.events.notify(
            session.counterpart(&party),
            &ChatEvent::PartyDisconnected {
                session_id,
                role,
                grace_secs: grace.as_secs(),
            },
        );
        Ok(true)
    }

    // ---- queries ----

    pub async fn get_active_session_for(
        &self,
        party: Party,
    ) -> Result<Option<ChatSession>, SessionError> {
        Ok(self.store.find_open_for(party).await?)
    }

    pub async fn get_session(
        &self,
        party: Party,
        session_id: SessionId,
    ) -> Result<ChatSession, SessionError> {
        self.load_participant_session(party, session_id).await
    }

    pub async fn list_transactions(
        &self,
        party: Party,
        session_id: SessionId,
    ) -> Result<Vec<LedgerTransaction>, SessionError> {
        self.load_participant_session(party, session_id).await?;
        Ok(self.store.list_transactions(session_id).await?)
    }

    // ---- timers ----

    fn arm_request_timeout(&self, session_id: SessionId, delay: Duration) {
        let this = self.this.clone();
        self.timers
            .schedule_once(session_id, TimerKind::RequestTimeout, delay, move || async move {
                let Some(service) = this.upgrade() else {
                    return;
                };
                if let Err(err) = service.expire_request(session_id).await {
                    tracing::warn!(session_id = %session_id, error = %err, "Request timeout failed");
                }
            });
    }

    /// Arms the trial or billing timer for an ACTIVE session. `already_elapsed`
    /// is how long the session has been running, for sessions picked back up
    /// after a restart.
    fn start_metering(&self, session: &ChatSession, already_elapsed: Duration) {
        let session_id = session.id;
        let this = self.this.clone();

        if session.is_free_trial {
            let total = Duration::from_secs(session.trial_duration_secs.unwrap_or(0).max(0) as u64);
            let remaining = total.saturating_sub(already_elapsed);
            self.timers
                .schedule_once(session_id, TimerKind::TrialExpiry, remaining, move || async move {
                    let Some(service) = this.upgrade() else {
                        return;
                    };
                    if let Err(err) = service.expire_trial(session_id).await {
                        tracing::warn!(session_id = %session_id, error = %err, "Trial expiry failed");
                    }
                });
            return;
        }

        let interval = self.config.billing_interval;
        let first_delay = self.next_tick_delay(session, already_elapsed);
        self.timers.schedule_every(
            session_id,
            TimerKind::Billing,
            first_delay,
            interval,
            move || {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(service) => service.run_billing_tick(session_id).await.control(),
                        None => TickControl::Stop,
                    }
                }
            },
        );
    }

    /// Delay until the next cycle boundary not yet charged.
    fn next_tick_delay(&self, session: &ChatSession, already_elapsed: Duration) -> Duration {
        let interval = self.config.billing_interval;
        if already_elapsed.is_zero() {
            return interval;
        }
        let cycle_minutes = self.config.cycle_minutes();
        let committed = if cycle_minutes > Decimal::ZERO {
            (session.total_minutes / cycle_minutes).floor()
        } else {
            Decimal::ZERO
        };
        let committed = committed.to_u32().unwrap_or(u32::MAX);
        interval
            .saturating_mul(committed.saturating_add(1))
            .saturating_sub(already_elapsed)
    }

    /// Re-arms timers for every open session, e.g. after a restart. Requests
    /// and trials already past their deadline are resolved immediately.
    pub async fn resume_open_sessions(&self) -> Result<usize, SessionError> {
        let open = self.store.list_open_sessions().await?;
        let now = self.clock.now();
        let mut resumed = 0;

        for session in open {
            match session.status {
                SessionStatus::Pending => {
                    let age = (now - session.created_at).to_std().unwrap_or(Duration::ZERO);
                    match self.config.request_timeout.checked_sub(age) {
                        Some(remaining) if !remaining.is_zero() => {
                            self.arm_request_timeout(session.id, remaining);
                        }
                        _ => {
                            self.expire_request(session.id).await?;
                            continue;
                        }
                    }
                }
                SessionStatus::Active => {
                    // No start time yet: waiting for both parties, the completing
                    // join arms metering.
                    let Some(start) = session.start_time else {
                        resumed += 1;
                        continue;
                    };
                    let elapsed = (now - start).to_std().unwrap_or(Duration::ZERO);
                    let trial_over = session.is_free_trial
                        && elapsed.as_secs() >= session.trial_duration_secs.unwrap_or(0).max(0) as u64;
                    if trial_over {
                        self.expire_trial(session.id).await?;
                        continue;
                    }
                    // Never resume with a zero offset; that means "fresh start".
                    self.start_metering(&session, elapsed.max(Duration::from_millis(1)));
                }
                SessionStatus::Ended | SessionStatus::Rejected => continue,
            }
            resumed += 1;
        }

        tracing::info!(resumed, "Resumed open chat sessions");
        Ok(resumed)
    }
}
