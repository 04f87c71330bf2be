//! PostgreSQL ledger store.
//!
//! Contested transitions are conditional `UPDATE ... WHERE status = ...`
//! statements; multi-row effects run inside one transaction with the
//! session, client and provider rows locked in that order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgTransaction;
use sqlx::PgPool;

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
use crate::repositories::transaction::{begin_transaction, commit_transaction, rollback_transaction};
use crate::services::billing::{self, ChargePlan, ChargeRefusal};
use crate::types::{ClientId, ProviderId, SessionId};

const SESSION_COLUMNS: &str = "id, client_id, provider_id, rate_per_minute, status, start_time, \
     end_time, end_reason, ended_by, total_minutes, total_amount, provider_earnings, user_joined, \
     provider_joined, is_free_trial, trial_duration_secs, is_continuation, previous_session_id, \
     created_at, updated_at";

const CLIENT_COLUMNS: &str =
    "id, display_name, real_balance, bonus_balance, free_trial_used, created_at, updated_at";

const PROVIDER_COLUMNS: &str = "id, display_name, rate_per_minute, is_online, is_approved, \
     is_verified, is_busy, active_session_id, missed_requests, total_sessions, \
     withdrawable_earnings, ytd_gross_earnings, ytd_tax_withheld, tax_year_start, created_at, \
     updated_at";

const TRANSACTION_COLUMNS: &str = "id, session_id, client_id, provider_id, kind, direction, \
     party_role, amount, real_amount, bonus_amount, tax_withheld, description, status, created_at";

const ONE_PENDING_PER_CLIENT: &str = "chat_sessions_one_pending_per_client";

#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn lock_session(
    tx: &mut PgTransaction<'_>,
    id: SessionId,
) -> Result<Option<ChatSession>, StoreError> {
    let query = format!("SELECT {} FROM chat_sessions WHERE id = $1 FOR UPDATE", SESSION_COLUMNS);
    Ok(sqlx::query_as::<_, ChatSession>(&query)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?)
}

async fn lock_client(tx: &mut PgTransaction<'_>, id: ClientId) -> Result<ClientAccount, StoreError> {
    let query = format!("SELECT {} FROM clients WHERE id = $1 FOR UPDATE", CLIENT_COLUMNS);
    sqlx::query_as::<_, ClientAccount>(&query)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::Missing("client"))
}

async fn lock_provider(
    tx: &mut PgTransaction<'_>,
    id: ProviderId,
) -> Result<ProviderProfile, StoreError> {
    let query = format!("SELECT {} FROM providers WHERE id = $1 FOR UPDATE", PROVIDER_COLUMNS);
    sqlx::query_as::<_, ProviderProfile>(&query)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::Missing("provider"))
}

/// Writes wallet and earnings columns from an executed plan.
async fn write_plan(
    tx: &mut PgTransaction<'_>,
    session: &ChatSession,
    plan: &ChargePlan,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE clients SET real_balance = $2, bonus_balance = $3, updated_at = $4 WHERE id = $1",
    )
    .bind(session.client_id)
    .bind(plan.real_balance_after)
    .bind(plan.bonus_balance_after)
    .bind(at)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE providers SET withdrawable_earnings = $2, ytd_gross_earnings = $3, \
         ytd_tax_withheld = $4, tax_year_start = $5, updated_at = $6 WHERE id = $1",
    )
    .bind(session.provider_id)
    .bind(plan.earnings.withdrawable_after)
    .bind(plan.earnings.ytd_gross_after)
    .bind(plan.earnings.ytd_tax_after)
    .bind(plan.earnings.tax_year_start)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_entries(
    tx: &mut PgTransaction<'_>,
    entries: &[LedgerTransaction],
) -> Result<(), StoreError> {
    for entry in entries {
        sqlx::query(
            "INSERT INTO ledger_transactions (id, session_id, client_id, provider_id, kind, \
             direction, party_role, amount, real_amount, bonus_amount, tax_withheld, description, \
             status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(entry.id)
        .bind(entry.session_id)
        .bind(entry.client_id)
        .bind(entry.provider_id)
        .bind(entry.kind)
        .bind(entry.direction)
        .bind(entry.party_role)
        .bind(entry.amount)
        .bind(entry.real_amount)
        .bind(entry.bonus_amount)
        .bind(entry.tax_withheld)
        .bind(&entry.description)
        .bind(entry.status)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn find_session(&self, id: SessionId) -> Result<Option<ChatSession>, StoreError> {
        let query = format!("SELECT {} FROM chat_sessions WHERE id = $1", SESSION_COLUMNS);
        Ok(sqlx::query_as::<_, ChatSession>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_client(&self, id: ClientId) -> Result<Option<ClientAccount>, StoreError> {
        let query = format!("SELECT {} FROM clients WHERE id = $1", CLIENT_COLUMNS);
        Ok(sqlx::query_as::<_, ClientAccount>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_provider(&self, id: ProviderId) -> Result<Option<ProviderProfile>, StoreError> {
        let query = format!("SELECT {} FROM providers WHERE id = $1", PROVIDER_COLUMNS);
        Ok(sqlx::query_as::<_, ProviderProfile>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_pending_for_client(
        &self,
        client_id: ClientId,
    ) -> Result<Option<ChatSession>, StoreError> {
        let query = format!(
            "SELECT {} FROM chat_sessions WHERE client_id = $1 AND status = $2",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, ChatSession>(&query)
            .bind(client_id)
            .bind(SessionStatus::Pending)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_open_for(&self, party: Party) -> Result<Option<ChatSession>, StoreError> {
        let column = match party.role() {
            Role::Client => "client_id",
            Role::Provider => "provider_id",
        };
        let query = format!(
            "SELECT {} FROM chat_sessions WHERE {} = $1 AND status IN ($2, $3) \
             ORDER BY created_at DESC LIMIT 1",
            SESSION_COLUMNS, column
        );
        Ok(sqlx::query_as::<_, ChatSession>(&query)
            .bind(party.uuid().to_string())
            .bind(SessionStatus::Pending)
            .bind(SessionStatus::Active)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_open_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
        let query = format!(
            "SELECT {} FROM chat_sessions WHERE status IN ($1, $2) ORDER BY created_at",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, ChatSession>(&query)
            .bind(SessionStatus::Pending)
            .bind(SessionStatus::Active)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_transactions(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        let query = format!(
            "SELECT {} FROM ledger_transactions WHERE session_id = $1 ORDER BY created_at, direction DESC",
            TRANSACTION_COLUMNS
        );
        Ok(sqlx::query_as::<_, LedgerTransaction>(&query)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_pending(&self, session: &ChatSession) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO chat_sessions (id, client_id, provider_id, rate_per_minute, status, \
             total_minutes, total_amount, provider_earnings, user_joined, provider_joined, \
             is_free_trial, trial_duration_secs, is_continuation, previous_session_id, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(session.id)
        .bind(session.client_id)
        .bind(session.provider_id)
        .bind(session.rate_per_minute)
        .bind(session.status)
        .bind(session.total_minutes)
        .bind(session.total_amount)
        .bind(session.provider_earnings)
        .bind(session.user_joined)
        .bind(session.provider_joined)
        .bind(session.is_free_trial)
        .bind(session.trial_duration_secs)
        .bind(session.is_continuation)
        .bind(session.previous_session_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some(ONE_PENDING_PER_CLIENT) =>
            {
                Err(StoreError::DuplicatePending)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn activate(
        &self,
        session_id: SessionId,
        provider_id: ProviderId,
        at: DateTime<Utc>,
        start_clock: bool,
    ) -> Result<ActivationOutcome, StoreError> {
        let mut tx = begin_transaction(&self.pool).await?;

        let provider = lock_provider(&mut tx, provider_id).await?;
        if provider.is_busy {
            rollback_transaction(tx).await?;
            return Ok(ActivationOutcome::ProviderBusy(provider.active_session_id));
        }

        sqlx::query(
            "UPDATE providers SET is_busy = TRUE, active_session_id = $2, updated_at = $3 \
             WHERE id = $1",
        )
        .bind(provider_id)
        .bind(session_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        let query = format!(
            "UPDATE chat_sessions SET status = $2, start_time = $3, updated_at = $4 \
             WHERE id = $1 AND status = $5 RETURNING {}",
            SESSION_COLUMNS
        );
        let activated = sqlx::query_as::<_, ChatSession>(&query)
            .bind(session_id)
            .bind(SessionStatus::Active)
            .bind(start_clock.then_some(at))
            .bind(at)
            .bind(SessionStatus::Pending)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(session) = activated else {
            // Lost the swap; the lock write above goes with the rollback.
            rollback_transaction(tx).await?;
            return Ok(ActivationOutcome::NotPending);
        };

        if session.is_free_trial {
            let claimed = sqlx::query(
                "UPDATE clients SET free_trial_used = TRUE, updated_at = $2 \
                 WHERE id = $1 AND free_trial_used = FALSE",
            )
            .bind(session.client_id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 0 {
                rollback_transaction(tx).await?;
                return Ok(ActivationOutcome::TrialAlreadyUsed);
            }
        }

        commit_transaction(tx).await?;
        Ok(ActivationOutcome::Activated(session))
    }

    async fn resolve_pending(
        &self,
        session_id: SessionId,
        resolution: PendingResolution,
    ) -> Result<Option<ChatSession>, StoreError> {
        resolution.ensure_legal()?;
        let mut tx = begin_transaction(&self.pool).await?;

        let query = format!(
            "UPDATE chat_sessions SET status = $2, end_reason = $3, ended_by = $4, \
             end_time = $5, updated_at = $5 \
             WHERE id = $1 AND status = $6 AND ($7::TEXT IS NULL OR client_id = $7) \
             RETURNING {}",
            SESSION_COLUMNS
        );
        let resolved = sqlx::query_as::<_, ChatSession>(&query)
            .bind(session_id)
            .bind(resolution.status)
            .bind(resolution.reason)
            .bind(resolution.ended_by)
            .bind(resolution.at)
            .bind(SessionStatus::Pending)
            .bind(resolution.client_guard)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(session) = resolved else {
            rollback_transaction(tx).await?;
            return Ok(None);
        };

        if resolution.count_missed {
            sqlx::query(
                "UPDATE providers SET missed_requests = missed_requests + 1, updated_at = $2 \
                 WHERE id = $1",
            )
            .bind(session.provider_id)
            .bind(resolution.at)
            .execute(&mut *tx)
            .await?;
        }

        commit_transaction(tx).await?;
        Ok(Some(session))
    }

    async fn release_provider_lock(
        &self,
        provider_id: ProviderId,
        session_id: SessionId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE providers SET is_busy = FALSE, active_session_id = NULL, updated_at = $3 \
             WHERE id = $1 AND active_session_id = $2",
        )
        .bind(provider_id)
        .bind(session_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_joined(
        &self,
        session_id: SessionId,
        role: Role,
        at: DateTime<Utc>,
        start_clock: bool,
    ) -> Result<Option<JoinOutcome>, StoreError> {
        let mut tx = begin_transaction(&self.pool).await?;

        let session = match lock_session(&mut tx, session_id).await? {
            Some(s) if s.status == SessionStatus::Active => s,
            _ => {
                rollback_transaction(tx).await?;
                return Ok(None);
            }
        };
        let (already_joined, other_joined) = match role {
            Role::Client => (session.user_joined, session.provider_joined),
            Role::Provider => (session.provider_joined, session.user_joined),
        };
        let completed_pair = !already_joined && other_joined;
        let column = match role {
            Role::Client => "user_joined",
            Role::Provider => "provider_joined",
        };

        let query = format!(
            "UPDATE chat_sessions SET {} = TRUE, \
               start_time = CASE WHEN $3 THEN $2 ELSE start_time END, updated_at = $2 \
             WHERE id = $1 RETURNING {}",
            column, SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, ChatSession>(&query)
            .bind(session_id)
            .bind(at)
            .bind(completed_pair && start_clock)
            .fetch_one(&mut *tx)
            .await?;

        commit_transaction(tx).await?;
        Ok(Some(JoinOutcome {
            session,
            completed_pair,
        }))
    }

    async fn apply_cycle_charge(
        &self,
        session_id: SessionId,
        charge: CycleCharge,
    ) -> Result<ChargeOutcome, StoreError> {
        let mut tx = begin_transaction(&self.pool).await?;

        let session = match lock_session(&mut tx, session_id).await? {
            Some(s) if s.status == SessionStatus::Active => s,
            _ => {
                rollback_transaction(tx).await?;
                return Ok(ChargeOutcome::SessionInactive);
            }
        };
        let mut client = lock_client(&mut tx, session.client_id).await?;
        let mut provider = lock_provider(&mut tx, session.provider_id).await?;

        let amount = billing::round_money(session.rate_per_minute * charge.cycle_minutes);
        let plan = match billing::plan_cycle_charge(
            amount,
            &client,
            &provider,
            &charge.settings,
            charge.tax_year_start,
        ) {
            Ok(plan) => plan,
            Err(ChargeRefusal::InsufficientFunds) => {
                rollback_transaction(tx).await?;
                return Ok(ChargeOutcome::InsufficientFunds);
            }
        };

        write_plan(&mut tx, &session, &plan, charge.at).await?;

        let query = format!(
            "UPDATE chat_sessions SET total_minutes = total_minutes + $2, \
             total_amount = total_amount + $3, provider_earnings = provider_earnings + $4, \
             updated_at = $5 WHERE id = $1 RETURNING {}",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, ChatSession>(&query)
            .bind(session_id)
            .bind(charge.cycle_minutes)
            .bind(plan.charged)
            .bind(plan.earnings.gross)
            .bind(charge.at)
            .fetch_one(&mut *tx)
            .await?;

        let entries =
            billing::ledger_entries(&session, TransactionKind::BillingCycle, &plan, charge.at);
        insert_entries(&mut tx, &entries).await?;
        commit_transaction(tx).await?;

        plan.apply_to(&mut client, &mut provider);
        Ok(ChargeOutcome::Charged(Box::new(ChargeReceipt {
            session,
            client,
            provider,
            plan,
        })))
    }

    async fn close_active(
        &self,
        session_id: SessionId,
        request: CloseRequest,
    ) -> Result<Option<ClosedSession>, StoreError> {
        let mut tx = begin_transaction(&self.pool).await?;

        let session = match lock_session(&mut tx, session_id).await? {
            Some(s) if s.status == SessionStatus::Active => s,
            _ => {
                rollback_transaction(tx).await?;
                return Ok(None);
            }
        };
        let client = lock_client(&mut tx, session.client_id).await?;
        let provider = lock_provider(&mut tx, session.provider_id).await?;

        let start = session.start_time.unwrap_or(request.at);
        let mut settlement = None;
        let mut charged = Decimal::ZERO;
        let mut gross = Decimal::ZERO;
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
                    &client,
                    &provider,
                    &request.settings,
                    request.tax_year_start,
                );
                write_plan(&mut tx, &session, &plan, request.at).await?;
                let entries = billing::ledger_entries(
                    &session,
                    TransactionKind::FinalSettlement,
                    &plan,
                    request.at,
                );
                insert_entries(&mut tx, &entries).await?;
                charged = plan.charged;
                gross = plan.earnings.gross;
                settlement = Some(plan);
            }
        }

        let total_minutes = billing::elapsed_minutes(start, request.at).round_dp(2);
        let query = format!(
            "UPDATE chat_sessions SET status = $2, end_time = $3, end_reason = $4, ended_by = $5, \
             total_minutes = $6, total_amount = total_amount + $7, \
             provider_earnings = provider_earnings + $8, updated_at = $3 \
             WHERE id = $1 RETURNING {}",
            SESSION_COLUMNS
        );
        let closed = sqlx::query_as::<_, ChatSession>(&query)
            .bind(session_id)
            .bind(SessionStatus::Ended)
            .bind(request.at)
            .bind(request.reason)
            .bind(request.ended_by)
            .bind(total_minutes)
            .bind(charged)
            .bind(gross)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE providers SET \
               is_busy = CASE WHEN active_session_id = $2 THEN FALSE ELSE is_busy END, \
               active_session_id = CASE WHEN active_session_id = $2 THEN NULL ELSE active_session_id END, \
               total_sessions = total_sessions + 1, updated_at = $3 \
             WHERE id = $1",
        )
        .bind(session.provider_id)
        .bind(session_id)
        .bind(request.at)
        .execute(&mut *tx)
        .await?;

        commit_transaction(tx).await?;
        Ok(Some(ClosedSession {
            session: closed,
            settlement,
        }))
    }
}
