use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub key: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(connect))
}

/// Only the trusted proxy holding the server key may subscribe. Without a
/// configured key the channel is closed to everyone.
fn authorized(configured: Option<&str>, presented: &str) -> bool {
    matches!(configured, Some(key) if !key.is_empty() && key == presented)
}

async fn connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    if !authorized(state.config.realtime.server_key.as_deref(), &query.key) {
        tracing::warn!("Rejected realtime connection with a bad key");
        return Err(AppError::Forbidden);
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| serve(state, socket)))
}

async fn serve(state: AppState, socket: WebSocket) {
    let (id, mut frames) = state.hub.register().await;
    let (mut sink, mut stream) = socket.split();
    let ping_every = Duration::from_secs(state.config.realtime.ping_interval_secs.max(1));
    let read_timeout = Duration::from_secs(state.config.realtime.read_timeout_secs.max(1));

    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(text) = frame else { break };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Any inbound frame, pongs included, counts as a sign of life.
    let mut reader = tokio::spawn(async move {
        loop {
            match tokio::time::timeout(read_timeout, stream.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(_))) => {}
                Err(_) => {
                    tracing::debug!(connection = %id, "Realtime read timeout");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    state.hub.unregister(id).await;
}
