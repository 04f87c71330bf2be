use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consult_backend::{
    config::Config,
    db::connection::create_pool,
    handlers,
    repositories::PgLedgerStore,
    services::{
        notifier::{BroadcastNotifier, EventDispatcher, LogPushSender, PushSender, WebhookPushSender},
        settings::PgSettingsProvider,
        ChatService,
    },
    state::AppState,
};

fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "<empty>".into();
    }
    let prefix = s.chars().take(4).collect::<String>();
    format!("{}*** (len={})", prefix, s.len())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consult_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!(
        jwt_secret = %mask_secret(&config.jwt_secret),
        bind_addr = %config.bind_addr,
        billing_interval_secs = config.billing_interval_secs,
        request_timeout_secs = config.request_timeout_secs,
        free_trial_enabled = config.free_trial_enabled,
        time_zone = %config.time_zone,
        push_webhook = config.push_webhook_url.is_some(),
        "Loaded configuration from environment/.env"
    );

    let pool = create_pool(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let realtime = Arc::new(BroadcastNotifier::new());
    let push: Arc<dyn PushSender> = match &config.push_webhook_url {
        Some(url) => Arc::new(WebhookPushSender::new(url.clone())),
        None => Arc::new(LogPushSender),
    };
    let chat = ChatService::new(
        Arc::new(PgLedgerStore::new(pool.clone())),
        Arc::new(PgSettingsProvider::new(pool)),
        EventDispatcher::new(realtime.clone(), push),
        config.chat_config(),
    );
    chat.resume_open_sessions().await?;

    let bind_addr = config.bind_addr.clone();
    let app = handlers::router(AppState::new(config, chat, realtime));

    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
