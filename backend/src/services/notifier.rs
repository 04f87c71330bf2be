//! Event delivery to session participants.
//!
//! Real-time delivery goes through a [`Notifier`] (per-party broadcast
//! channels feeding WebSocket connections). When the target party has no live
//! listener an out-of-band [`PushSender`] is tried. Neither path can fail a
//! state transition: errors are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{event::ChatEvent, party::Party};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to this many live receivers.
    Delivered(usize),
    NoListener,
}

pub trait Notifier: Send + Sync {
    fn publish(&self, party: Party, event: &ChatEvent) -> Delivery;
}

/// One broadcast channel per connected party.
#[derive(Default)]
pub struct BroadcastNotifier {
    channels: Mutex<HashMap<Party, broadcast::Sender<ChatEvent>>>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, party: Party) -> broadcast::Receiver<ChatEvent> {
        self.channels
            .lock()
            .entry(party)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn listener_count(&self, party: Party) -> usize {
        self.channels
            .lock()
            .get(&party)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, party: Party, event: &ChatEvent) -> Delivery {
        let mut channels = self.channels.lock();
        let Some(sender) = channels.get(&party) else {
            return Delivery::NoListener;
        };
        match sender.send(event.clone()) {
            Ok(count) => Delivery::Delivered(count),
            Err(_) => {
                // Every receiver is gone; drop the stale channel.
                channels.remove(&party);
                Delivery::NoListener
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushNotification {
    pub recipient: String,
    pub role: String,
    pub title: String,
    pub body: String,
    pub event: ChatEvent,
}

impl PushNotification {
    pub fn for_event(party: Party, event: &ChatEvent) -> Self {
        let (title, body) = match event {
            ChatEvent::ChatRequest { client_name, .. } => (
                "New chat request".to_string(),
                format!("{} wants to chat with you", client_name),
            ),
            ChatEvent::RequestAccepted { .. } => (
                "Chat accepted".to_string(),
                "Your chat request was accepted".to_string(),
            ),
            ChatEvent::RequestRejected { .. } => (
                "Chat declined".to_string(),
                "Your chat request was declined".to_string(),
            ),
            ChatEvent::SessionEnded { reason, .. } => {
                ("Chat ended".to_string(), format!("Session ended ({})", reason))
            }
            other => ("Chat update".to_string(), other.name().to_string()),
        };
        Self {
            recipient: party.uuid().to_string(),
            role: party.role().to_string(),
            title,
            body,
            event: event.clone(),
        }
    }
}

/// Out-of-band delivery for parties without a live connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, notification: PushNotification) -> anyhow::Result<()>;
}

/// Used when no push endpoint is configured.
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send(&self, notification: PushNotification) -> anyhow::Result<()> {
        tracing::info!(
            recipient = %notification.recipient,
            role = %notification.role,
            event = notification.event.name(),
            title = %notification.title,
            "Push notification (no webhook configured)"
        );
        Ok(())
    }
}

/// Posts notifications as JSON to a webhook.
pub struct WebhookPushSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookPushSender {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushSender for WebhookPushSender {
    async fn send(&self, notification: PushNotification) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .context("push webhook request failed")?
            .error_for_status()
            .context("push webhook rejected notification")?;
        Ok(())
    }
}

/// Fans engine events out to the notifier and, when needed, push.
#[derive(Clone)]
pub struct EventDispatcher {
    notifier: Arc<dyn Notifier>,
    push: Arc<dyn PushSender>,
}

impl EventDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, push: Arc<dyn PushSender>) -> Self {
        Self { notifier, push }
    }

    /// Real-time only.
    pub fn notify(&self, party: Party, event: &ChatEvent) -> Delivery {
        let delivery = self.notifier.publish(party, event);
        if delivery == Delivery::NoListener {
            tracing::debug!(
                party = %party,
                event = event.name(),
                session_id = %event.session_id(),
                "No live listener for event"
            );
        }
        delivery
    }

    /// Real-time first; falls back to push when the party is not connected.
    pub async fn notify_or_push(&self, party: Party, event: &ChatEvent) {
        if let Delivery::Delivered(_) = self.notify(party, event) {
            return;
        }
        self.push(party, event).await;
    }

    /// Real-time plus an unconditional push.
    pub async fn notify_and_push(&self, party: Party, event: &ChatEvent) {
        self.notify(party, event);
        self.push(party, event).await;
    }

    async fn push(&self, party: Party, event: &ChatEvent) {
        if let Err(err) = self.push.send(PushNotification::for_event(party, event)).await {
            tracing::warn!(
                party = %party,
                event = event.name(),
                session_id = %event.session_id(),
                error = %err,
                "Push notification failed"
            );
        }
    }
}
