use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use common::stats::FeedSnapshot;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Live dashboard feed: one JSON snapshot per publish interval
pub async fn feed_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_snapshots(socket, state))
}

#[tracing::instrument(skip_all)]
async fn stream_snapshots(socket: WebSocket, state: AppState) {
    let mut snapshots = state.feed.subscribe();
    let (mut sink, mut stream) = socket.split();
    info!("Dashboard feed subscriber connected");

    // Current view first so the client does not wait a full interval
    let initial = state.feed.snapshot_at(Utc::now()).await;
    if !send_snapshot(&mut sink, &initial).await {
        return;
    }

    loop {
        tokio::select! {
            received = snapshots.recv() => match received {
                Ok(snapshot) => {
                    if !send_snapshot(&mut sink, &snapshot).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "Feed subscriber skipped stale snapshots");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("Dashboard feed subscriber disconnected");
}

/// Write one snapshot frame; false once the client is gone
async fn send_snapshot<S>(sink: &mut S, snapshot: &FeedSnapshot) -> bool
where
    S: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(snapshot) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode feed snapshot");
            return false;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}
