use std::sync::Arc;

use crate::{
    config::Config,
    services::{chat::ChatService, notifier::BroadcastNotifier},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub chat: Arc<ChatService>,
    /// Live event channels feeding WebSocket connections.
    pub realtime: Arc<BroadcastNotifier>,
}

impl AppState {
    pub fn new(config: Config, chat: Arc<ChatService>, realtime: Arc<BroadcastNotifier>) -> Self {
        Self {
            config,
            chat,
            realtime,
        }
    }
}
