#![allow(dead_code)]
use std::{env, sync::Arc, time::Duration};

use consult_backend::{
    models::{
        account::ClientAccount, event::ChatEvent, party::Party, provider::ProviderProfile,
        session::ChatSession, settings::BillingSettings,
    },
    repositories::{LedgerStore, MemoryLedgerStore},
    services::{
        billing,
        notifier::{BroadcastNotifier, EventDispatcher, LogPushSender},
        ChatConfig, ChatService, Clock, FixedSettings, TokioClock,
    },
    types::{ClientId, ProviderId, SessionId},
};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

pub const JWT_SECRET: &str = "test-secret";

/// Engine defaults for tests: one-minute cycles, trials off.
pub fn test_config() -> ChatConfig {
    ChatConfig {
        billing_interval: Duration::from_secs(60),
        request_timeout: Duration::from_secs(30),
        free_trial_enabled: false,
        free_trial_duration: Duration::from_secs(300),
        disconnect_grace: Duration::from_secs(20),
        time_zone: chrono_tz::UTC,
        financial_year_start_month: 4,
        billing_starts_on_join: false,
    }
}

pub struct Harness {
    pub store: Arc<MemoryLedgerStore>,
    pub settings: Arc<FixedSettings>,
    pub realtime: Arc<BroadcastNotifier>,
    pub clock: Arc<TokioClock>,
    pub chat: Arc<ChatService>,
}

pub fn harness() -> Harness {
    harness_with(test_config(), BillingSettings::default())
}

pub fn harness_with(config: ChatConfig, settings: BillingSettings) -> Harness {
    let store = Arc::new(MemoryLedgerStore::new());
    let settings = Arc::new(FixedSettings::new(settings));
    let realtime = Arc::new(BroadcastNotifier::new());
    let clock = Arc::new(TokioClock::new());
    let chat = ChatService::with_clock(
        store.clone(),
        settings.clone(),
        EventDispatcher::new(realtime.clone(), Arc::new(LogPushSender)),
        config,
        clock.clone(),
    );
    Harness {
        store,
        settings,
        realtime,
        clock,
        chat,
    }
}

impl Harness {
    pub fn add_client(&self, real: Decimal, bonus: Decimal) -> ClientId {
        let client = ClientAccount::new("Asha", real, bonus);
        let id = client.id;
        self.store.upsert_client(client);
        id
    }

    pub fn add_provider(&self, rate: Decimal) -> ProviderId {
        let config = self.chat.config();
        let fy = billing::financial_year_start(
            self.clock.now(),
            config.time_zone,
            config.financial_year_start_month,
        );
        let provider = ProviderProfile::new("Pandit Rao", rate, fy);
        let id = provider.id;
        self.store.upsert_provider(provider);
        id
    }

    /// Request plus accept.
    pub async fn start_session(&self, client: ClientId, provider: ProviderId) -> ChatSession {
        let pending = self
            .chat
            .create_request(client, provider, None)
            .await
            .expect("create request");
        self.chat
            .accept(provider, pending.id)
            .await
            .expect("accept request")
    }

    pub async fn session(&self, id: SessionId) -> ChatSession {
        self.store
            .find_session(id)
            .await
            .expect("load session")
            .expect("session exists")
    }

    pub async fn client(&self, id: ClientId) -> ClientAccount {
        self.store
            .find_client(id)
            .await
            .expect("load client")
            .expect("client exists")
    }

    pub async fn provider(&self, id: ProviderId) -> ProviderProfile {
        self.store
            .find_provider(id)
            .await
            .expect("load provider")
            .expect("provider exists")
    }

    pub fn subscribe(&self, party: Party) -> broadcast::Receiver<ChatEvent> {
        self.realtime.subscribe(party)
    }
}

pub fn drain(rx: &mut broadcast::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn event_names(events: &[ChatEvent]) -> Vec<&'static str> {
    events.iter().map(ChatEvent::name).collect()
}

pub fn token_for(party: Party) -> String {
    consult_backend::utils::jwt::create_access_token(party, JWT_SECRET, 1).expect("create token")
}

/// Database for store tests; `None` skips them.
pub fn test_database_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok().filter(|url| !url.is_empty())
}
