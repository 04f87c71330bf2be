//! WebSocket stream of chat events for the authenticated party.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    models::{party::Party, session::SessionStatus},
    state::AppState,
};

pub async fn events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(party): Extension<Party>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, party))
}

async fn handle_socket(socket: WebSocket, state: AppState, party: Party) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.realtime.subscribe(party);
    tracing::debug!(party = %party, "Event stream connected");

    // A reconnect counts as joining the running session.
    if let Some(session_id) = active_session_id(&state, party).await {
        if let Err(err) = state.chat.join(party, session_id).await {
            tracing::debug!(party = %party, session_id = %session_id, error = %err, "Join on connect failed");
        }
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::warn!(event = event.name(), error = %err, "Failed to encode event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(party = %party, skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(events);
    tracing::debug!(party = %party, "Event stream closed");

    // Other tabs may still be connected for the same party.
    if state.realtime.listener_count(party) > 0 {
        return;
    }
    if let Some(session_id) = active_session_id(&state, party).await {
        if let Err(err) = state.chat.disconnect(party, session_id).await {
            tracing::warn!(party = %party, session_id = %session_id, error = %err, "Disconnect handling failed");
        }
    }
}

async fn active_session_id(state: &AppState, party: Party) -> Option<crate::types::SessionId> {
    match state.chat.get_active_session_for(party).await {
        Ok(Some(session)) if session.status == SessionStatus::Active => Some(session.id),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(party = %party, error = %err, "Active session lookup failed");
            None
        }
    }
}
