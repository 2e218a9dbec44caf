//! Real-time connection channel.
//!
//! Protocol:
//! - Server sends on open: `{"action":"on.connect","payload":{"connection_id":"..."}}`
//! - Client may send `{"user_id":"..."}` to associate with an endpoint
//! - Client may answer pings with a Pong frame or the text `pong`
//! - Every other client frame is published as an inbound event

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::dispatch::encode_frame;
use common::events::CoreEvent;
use common::hub::{ConnectionHandle, OutboundFrame};
use common::models::TransportKind;

use crate::state::AppState;

/// What a client text frame means to the session
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Pong,
    Associate(String),
    Other,
}

#[derive(Deserialize)]
struct AssociationFrame {
    user_id: String,
}

impl ClientFrame {
    pub fn classify(text: &str) -> Self {
        if text.trim() == "pong" {
            return ClientFrame::Pong;
        }
        match serde_json::from_str::<AssociationFrame>(text) {
            Ok(frame) if !frame.user_id.trim().is_empty() => {
                ClientFrame::Associate(frame.user_id.trim().to_string())
            }
            _ => ClientFrame::Other,
        }
    }
}

/// WebSocket upgrade handler for client sessions
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

#[tracing::instrument(skip_all)]
async fn handle_session(socket: WebSocket, state: AppState) {
    let id = Uuid::new_v4().to_string();
    let ConnectionHandle { id, receiver } = match state
        .hub
        .register(id, None, TransportKind::Websocket)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Failed to register session");
            return;
        }
    };

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_frames(sink, receiver, state.hub.config().ping_interval()));

    match encode_frame("on.connect", &serde_json::json!({ "connection_id": id })) {
        Ok(greeting) => {
            let outcome = state.hub.push_text(&id, greeting).await;
            debug!(connection_id = %id, outcome = outcome.label(), "Sent connect greeting");
        }
        Err(e) => warn!(error = %e, "Failed to encode connect greeting"),
    }

    read_frames(stream, &state, &id).await;

    state.hub.unregister(&id).await;
    if let Err(e) = writer.await {
        warn!(connection_id = %id, error = %e, "Session writer failed");
    }
    info!(connection_id = %id, "Session ended");
}

/// Drain the session queue onto the socket and ping on a fixed interval.
/// Ends when the hub drops the session's sender.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<OutboundFrame>,
    ping_every: Duration,
) {
    let mut ping = interval(ping_every.max(Duration::from_millis(100)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ping.tick().await;

    loop {
        let message = tokio::select! {
            frame = frames.recv() => match frame {
                Some(OutboundFrame::Text(text)) => Message::Text(text),
                Some(OutboundFrame::Ping) => Message::Ping(Vec::new()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Socket write failed");
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

async fn read_frames(mut stream: SplitStream<WebSocket>, state: &AppState, id: &str) {
    let idle = state.hub.config().idle_timeout();

    loop {
        let message = match timeout(idle, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %id, error = %e, "Socket read failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                info!(connection_id = %id, idle_seconds = idle.as_secs(), "Session idle, closing");
                state.hub.close(id).await;
                return;
            }
        };

        match message {
            Message::Text(text) => {
                state.hub.touch(id).await;
                handle_text(state, id, text).await;
            }
            Message::Pong(_) | Message::Ping(_) | Message::Binary(_) => state.hub.touch(id).await,
            Message::Close(_) => return,
        }
    }
}

async fn handle_text(state: &AppState, id: &str, text: String) {
    match ClientFrame::classify(&text) {
        ClientFrame::Pong => {}
        ClientFrame::Associate(user_id) => {
            if let Err(e) = state.hub.associate(id, &user_id).await {
                warn!(connection_id = %id, error = %e, "Association rejected");
            }
        }
        ClientFrame::Other => state.events.publish(CoreEvent::Inbound {
            connection_id: id.to_string(),
            text,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_text_is_heartbeat() {
        assert_eq!(ClientFrame::classify("pong"), ClientFrame::Pong);
        assert_eq!(ClientFrame::classify(" pong\n"), ClientFrame::Pong);
    }

    #[test]
    fn test_user_id_frame_associates() {
        assert_eq!(
            ClientFrame::classify(r#"{"user_id":"studio:1"}"#),
            ClientFrame::Associate("studio:1".to_string())
        );
        assert_eq!(
            ClientFrame::classify(r#"{"user_id":"studio:1","extra":true}"#),
            ClientFrame::Associate("studio:1".to_string())
        );
    }

    #[test]
    fn test_other_frames_are_inbound() {
        assert_eq!(ClientFrame::classify("hello"), ClientFrame::Other);
        assert_eq!(ClientFrame::classify(r#"{"user":"x"}"#), ClientFrame::Other);
        assert_eq!(ClientFrame::classify(r#"{"user_id":"  "}"#), ClientFrame::Other);
        assert_eq!(ClientFrame::classify(r#"{"user_id":42}"#), ClientFrame::Other);
    }
}
