//! Stream tails over HTTP and WebSocket

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use super::error::ApiResult;
use super::state::AppState;
use crate::stream::{StreamEvent, StreamHub};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    /// Last event id the client already has
    #[serde(default)]
    pub since: u64,
}

/// Visible events of a channel, in order
pub async fn stream_history(
    State(state): State<AppState>,
    Path(channel): Path<Uuid>,
) -> ApiResult<Json<Vec<StreamEvent>>> {
    let events = state.engine.streams.history(channel).await?;
    Ok(Json(events))
}

pub async fn stream_ws(
    State(state): State<AppState>,
    Path(channel): Path<Uuid>,
    Query(query): Query<TailQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.engine.streams.clone();
    ws.on_upgrade(move |socket| tail(socket, hub, channel, query.since))
        .into_response()
}

async fn tail(mut socket: WebSocket, hub: StreamHub, channel: Uuid, mut cursor: u64) {
    tracing::debug!(%channel, since = cursor, "stream tail opened");
    loop {
        let events = match hub.read_since(channel, cursor).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(%channel, "stream read failed: {}", e);
                break;
            }
        };

        for event in events {
            cursor = event.id;
            let closing = event.is_close();
            if !event.is_visible() && !closing {
                continue;
            }
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if socket.send(Message::Text(text.into())).await.is_err() {
                return;
            }
            if closing {
                let _ = socket.send(Message::Close(None)).await;
                tracing::debug!(%channel, "stream tail finished");
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
