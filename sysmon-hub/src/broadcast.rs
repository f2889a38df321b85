//! Live fan-out of store snapshots to WebSocket subscribers.
//!
//! Each subscriber gets its own task waiting on the store's change signal. A
//! snapshot is sent only when its version differs from the last one that
//! subscriber saw; bursts of writes while a subscriber is busy collapse into
//! the newest snapshot, so the ingestion side never waits on a slow viewer.

use crate::http::AppState;
use crate::state::StoreSlot;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use std::pin::pin;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("subscriber gone: {0}")]
    Send(String),
}

/// Pushes snapshots from `updates` into `sink` until the sink fails or the
/// store is dropped. Returns how many snapshots were sent.
pub async fn pump<S>(mut updates: watch::Receiver<StoreSlot>, sink: S) -> Result<u64, HubError>
where
    S: Sink<String>,
    S::Error: Display,
{
    let mut sink = pin!(sink);
    let mut last_seen = 0u64;
    let mut sent = 0u64;

    loop {
        let latest = updates.borrow_and_update().clone();
        if let Some(current) = latest {
            if current.version != last_seen {
                let payload = serde_json::to_string(&current.snapshot)?;
                sink.send(payload).await.map_err(|e| HubError::Send(e.to_string()))?;
                last_seen = current.version;
                sent += 1;
            }
        }
        if updates.changed().await.is_err() {
            return Ok(sent);
        }
    }
}

// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, app))
}

async fn serve_subscriber(socket: WebSocket, app: AppState) {
    let id = Uuid::new_v4();
    let live = app.health.subscriber_joined();
    info!(%id, live, "subscriber connected");

    let (sink, mut incoming) = socket.split();
    let sink = sink.with(|text: String| futures::future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))));
    let updates = app.store.subscribe();

    // the client never sends anything we need; reading only detects the close
    let closed = async {
        while let Some(Ok(msg)) = incoming.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        result = pump(updates, sink) => match result {
            Ok(sent) => debug!(%id, sent, "store closed"),
            Err(e) => debug!(%id, "push stopped: {e}"),
        },
        _ = closed => debug!(%id, "subscriber closed the socket"),
    }

    let live = app.health.subscriber_left();
    info!(%id, live, "subscriber disconnected");
}
