use chrono::{Duration, NaiveDate, Utc};
use consult_backend::{
    error::StoreError,
    models::{
        account::ClientAccount,
        party::{Party, Role},
        provider::ProviderProfile,
        session::{ChatSession, EndReason, SessionStatus},
        settings::BillingSettings,
    },
    repositories::{
        ActivationOutcome, ChargeOutcome, CloseRequest, CycleCharge, LedgerStore,
        PendingResolution, PgLedgerStore,
    },
    services::{PgSettingsProvider, SettingsProvider},
    types::{ClientId, ProviderId},
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;

#[path = "support/mod.rs"]
mod support;

async fn integration_guard() -> tokio::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::OnceLock<tokio::sync::Mutex<()>> = std::sync::OnceLock::new();
    GUARD.get_or_init(|| tokio::sync::Mutex::new(())).lock().await
}

async fn test_store() -> Option<PgLedgerStore> {
    let Some(url) = support::test_database_url() else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres store test");
        return None;
    };
    let pool = PgPool::connect(&url).await.expect("connect test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Some(PgLedgerStore::new(pool))
}

fn year_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 4, 1).expect("valid date")
}

async fn seed_client(pool: &PgPool, real: Decimal) -> ClientId {
    let client = ClientAccount::new("Meera", real, Decimal::ZERO);
    sqlx::query(
        "INSERT INTO clients (id, display_name, real_balance, bonus_balance) VALUES ($1, $2, $3, $4)",
    )
    .bind(client.id)
    .bind(&client.display_name)
    .bind(client.real_balance)
    .bind(client.bonus_balance)
    .execute(pool)
    .await
    .expect("insert client");
    client.id
}

async fn seed_provider(pool: &PgPool, rate: Decimal) -> ProviderId {
    let provider = ProviderProfile::new("Acharya Dev", rate, year_start());
    sqlx::query(
        "INSERT INTO providers (id, display_name, rate_per_minute, is_approved, is_verified, tax_year_start) \
         VALUES ($1, $2, $3, TRUE, TRUE, $4)",
    )
    .bind(provider.id)
    .bind(&provider.display_name)
    .bind(provider.rate_per_minute)
    .bind(provider.tax_year_start)
    .execute(pool)
    .await
    .expect("insert provider");
    provider.id
}

async fn pending(store: &PgLedgerStore, client: ClientId, provider: ProviderId, rate: Decimal) -> ChatSession {
    let session = ChatSession::new_pending(client, provider, rate, None, None);
    store.insert_pending(&session).await.expect("insert pending");
    session
}

#[tokio::test]
async fn second_pending_request_hits_unique_index() {
    let _guard = integration_guard().await;
    let Some(store) = test_store().await else {
        return;
    };
    let client = seed_client(store.pool(), dec!(100)).await;
    let first = seed_provider(store.pool(), dec!(10)).await;
    let second = seed_provider(store.pool(), dec!(10)).await;

    pending(&store, client, first, dec!(10)).await;
    let duplicate = ChatSession::new_pending(client, second, dec!(10), None, None);
    let err = store.insert_pending(&duplicate).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicatePending));

    let found = store
        .find_pending_for_client(client)
        .await
        .expect("query pending")
        .expect("pending exists");
    assert_eq!(found.provider_id, first);
}

#[tokio::test]
async fn activation_takes_lock_once_and_rolls_back_when_request_is_gone() {
    let _guard = integration_guard().await;
    let Some(store) = test_store().await else {
        return;
    };
    let provider = seed_provider(store.pool(), dec!(10)).await;
    let first_client = seed_client(store.pool(), dec!(100)).await;
    let second_client = seed_client(store.pool(), dec!(100)).await;
    let third_client = seed_client(store.pool(), dec!(100)).await;

    let first = pending(&store, first_client, provider, dec!(10)).await;
    let second = pending(&store, second_client, provider, dec!(10)).await;

    let outcome = store.activate(first.id, provider, Utc::now(), true).await.unwrap();
    let ActivationOutcome::Activated(active) = outcome else {
        panic!("expected activation, got {outcome:?}");
    };
    assert_eq!(active.status, SessionStatus::Active);
    assert!(active.start_time.is_some());

    let outcome = store.activate(second.id, provider, Utc::now(), true).await.unwrap();
    assert!(matches!(outcome, ActivationOutcome::ProviderBusy(Some(id)) if id == first.id));

    // Free the provider, then try to accept a request the client already withdrew.
    assert!(store.release_provider_lock(provider, first.id).await.unwrap());
    let withdrawn = pending(&store, third_client, provider, dec!(10)).await;
    let resolution = PendingResolution {
        status: SessionStatus::Ended,
        reason: EndReason::UserEnd,
        ended_by: Some(Role::Client),
        at: Utc::now(),
        client_guard: Some(third_client),
        count_missed: false,
    };
    assert!(store
        .resolve_pending(withdrawn.id, resolution)
        .await
        .unwrap()
        .is_some());

    let outcome = store.activate(withdrawn.id, provider, Utc::now(), true).await.unwrap();
    assert!(matches!(outcome, ActivationOutcome::NotPending));
    let provider_row = store.find_provider(provider).await.unwrap().expect("provider");
    assert!(!provider_row.is_busy);
    assert!(provider_row.active_session_id.is_none());
}

#[tokio::test]
async fn resolve_pending_guards_owner_and_counts_misses() {
    let _guard = integration_guard().await;
    let Some(store) = test_store().await else {
        return;
    };
    let client = seed_client(store.pool(), dec!(100)).await;
    let provider = seed_provider(store.pool(), dec!(10)).await;
    let session = pending(&store, client, provider, dec!(10)).await;

    let foreign = PendingResolution {
        status: SessionStatus::Ended,
        reason: EndReason::UserEnd,
        ended_by: Some(Role::Client),
        at: Utc::now(),
        client_guard: Some(ClientId::new()),
        count_missed: false,
    };
    assert!(store.resolve_pending(session.id, foreign).await.unwrap().is_none());

    let timeout = PendingResolution {
        status: SessionStatus::Ended,
        reason: EndReason::Timeout,
        ended_by: None,
        at: Utc::now(),
        client_guard: None,
        count_missed: true,
    };
    let expired = store
        .resolve_pending(session.id, timeout)
        .await
        .unwrap()
        .expect("first resolution wins");
    assert_eq!(expired.end_reason, Some(EndReason::Timeout));
    assert!(store.resolve_pending(session.id, timeout).await.unwrap().is_none());

    let reactivate = PendingResolution {
        status: SessionStatus::Active,
        ..timeout
    };
    let err = store.resolve_pending(session.id, reactivate).await.unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }));

    let provider_row = store.find_provider(provider).await.unwrap().expect("provider");
    assert_eq!(provider_row.missed_requests, 1);
}

#[tokio::test]
async fn cycle_charge_and_close_write_the_ledger() {
    let _guard = integration_guard().await;
    let Some(store) = test_store().await else {
        return;
    };
    let client = seed_client(store.pool(), dec!(100)).await;
    let provider = seed_provider(store.pool(), dec!(20)).await;
    let session = pending(&store, client, provider, dec!(20)).await;

    let started = Utc::now();
    store.activate(session.id, provider, started, true).await.unwrap();
    let joined = store
        .mark_joined(session.id, Role::Provider, started, false)
        .await
        .unwrap()
        .expect("active session");
    assert!(!joined.completed_pair);
    assert!(joined.session.provider_joined);
    assert!(!joined.session.user_joined);

    let charge = CycleCharge {
        cycle_minutes: dec!(1),
        settings: BillingSettings::default(),
        tax_year_start: year_start(),
        at: started + Duration::seconds(60),
    };
    let ChargeOutcome::Charged(receipt) = store.apply_cycle_charge(session.id, charge).await.unwrap()
    else {
        panic!("expected a committed charge");
    };
    assert_eq!(receipt.client.real_balance, dec!(80));
    assert_eq!(receipt.provider.withdrawable_earnings, dec!(12));
    assert_eq!(receipt.session.total_amount, dec!(20));

    let close = CloseRequest {
        reason: EndReason::UserEnd,
        ended_by: Some(Role::Client),
        at: started + Duration::seconds(90),
        settings: BillingSettings::default(),
        tax_year_start: year_start(),
    };
    let closed = store
        .close_active(session.id, close.clone())
        .await
        .unwrap()
        .expect("closed");
    assert_eq!(closed.session.status, SessionStatus::Ended);
    assert_eq!(closed.session.total_amount, dec!(30));
    assert_eq!(closed.session.total_minutes, dec!(1.5));
    assert_eq!(closed.settlement.map(|plan| plan.charged), Some(dec!(10)));

    // Closing twice is a no-op.
    assert!(store.close_active(session.id, close).await.unwrap().is_none());

    let provider_row = store.find_provider(provider).await.unwrap().expect("provider");
    assert!(!provider_row.is_busy);
    assert_eq!(provider_row.total_sessions, 1);
    assert_eq!(provider_row.withdrawable_earnings, dec!(18));

    let client_row = store.find_client(client).await.unwrap().expect("client");
    assert_eq!(client_row.real_balance, dec!(70));

    let txs = store.list_transactions(session.id).await.unwrap();
    assert_eq!(txs.len(), 4);
    assert!(store
        .find_open_for(Party::Client(client))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn activation_claims_the_free_trial_once() {
    let _guard = integration_guard().await;
    let Some(store) = test_store().await else {
        return;
    };
    let client = seed_client(store.pool(), Decimal::ZERO).await;
    let first = seed_provider(store.pool(), dec!(10)).await;
    let second = seed_provider(store.pool(), dec!(10)).await;

    let trial = ChatSession::new_pending(client, first, dec!(10), Some(300), None);
    store.insert_pending(&trial).await.expect("insert trial");
    let outcome = store.activate(trial.id, first, Utc::now(), true).await.unwrap();
    assert!(matches!(outcome, ActivationOutcome::Activated(_)));
    let account = store.find_client(client).await.unwrap().expect("client");
    assert!(account.free_trial_used);

    let again = ChatSession::new_pending(client, second, dec!(10), Some(300), None);
    store.insert_pending(&again).await.expect("insert second trial");
    let outcome = store.activate(again.id, second, Utc::now(), true).await.unwrap();
    assert!(matches!(outcome, ActivationOutcome::TrialAlreadyUsed));

    let refused = store.find_session(again.id).await.unwrap().expect("session");
    assert_eq!(refused.status, SessionStatus::Pending);
    let provider_row = store.find_provider(second).await.unwrap().expect("provider");
    assert!(!provider_row.is_busy);
}

#[tokio::test]
async fn deferred_clock_starts_on_the_join_that_completes_the_pair() {
    let _guard = integration_guard().await;
    let Some(store) = test_store().await else {
        return;
    };
    let client = seed_client(store.pool(), dec!(100)).await;
    let provider = seed_provider(store.pool(), dec!(10)).await;
    let session = pending(&store, client, provider, dec!(10)).await;

    let accepted = Utc::now();
    let ActivationOutcome::Activated(active) =
        store.activate(session.id, provider, accepted, false).await.unwrap()
    else {
        panic!("expected activation");
    };
    assert!(active.start_time.is_none());

    let first = store
        .mark_joined(session.id, Role::Client, accepted + Duration::seconds(5), true)
        .await
        .unwrap()
        .expect("active session");
    assert!(!first.completed_pair);
    assert!(first.session.start_time.is_none());

    let paired_at = accepted + Duration::seconds(12);
    let second = store
        .mark_joined(session.id, Role::Provider, paired_at, true)
        .await
        .unwrap()
        .expect("active session");
    assert!(second.completed_pair);
    let start = second.session.start_time.expect("clock started");
    assert_eq!(start.timestamp_micros(), paired_at.timestamp_micros());

    // Rejoining neither completes the pair again nor moves the clock.
    let rejoin = store
        .mark_joined(session.id, Role::Client, paired_at + Duration::seconds(30), true)
        .await
        .unwrap()
        .expect("active session");
    assert!(!rejoin.completed_pair);
    assert_eq!(rejoin.session.start_time, second.session.start_time);
}

#[tokio::test]
async fn seeded_settings_match_defaults() {
    let _guard = integration_guard().await;
    let Some(store) = test_store().await else {
        return;
    };
    let provider = PgSettingsProvider::new(store.pool().clone());
    assert_eq!(provider.current().await, BillingSettings::default());
}
