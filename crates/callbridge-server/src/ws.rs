use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use callbridge::Envelope;
use callbridge_daemon::NativeDaemon;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::forward;
use crate::hub::{RelayHub, SocketId};

/// Shared application state.
pub struct AppState {
    pub daemon: Arc<dyn NativeDaemon>,
    pub relay: Arc<RelayHub>,
    pub config: ServerConfig,
}

impl AppState {
    fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        // Non-browser clients send no Origin.
        let Some(origin) = headers.get(header::ORIGIN) else {
            return true;
        };
        let Ok(origin) = origin.to_str() else {
            return false;
        };
        self.config
            .allow_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "accountId")]
    pub account_id: String,
}

/// `GET /ws?accountId=...`: upgrade a browser connection for one account.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !state.origin_allowed(&headers) {
        warn!(account_id = %query.account_id, "rejecting socket from disallowed origin");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    if !state.daemon.account_ids().contains(&query.account_id) {
        debug!(account_id = %query.account_id, "socket for unknown account");
        return (StatusCode::NOT_FOUND, "unknown account").into_response();
    }

    let max = state.config.max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, query.account_id))
}

/// Handle a single WebSocket connection.
///
/// A writer task drains the socket's outbound queue and keeps the
/// connection alive with pings; the read loop forwards client envelopes.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, account_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.config.outbound_queue);
    let id = state.relay.register(&account_id, tx);
    info!(socket = id, account_id = %account_id, "socket connected");

    let ping_every = state.config.ping_interval();
    let write_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_sender.send(Message::text(frame)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg_result) = ws_receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                debug!(socket = id, "ws read error: {e}");
                break;
            }
        };
        match msg {
            Message::Text(text) => handle_frame(&state, id, &account_id, text.as_str()),
            Message::Binary(_) => warn!(socket = id, "ignoring binary frame"),
            Message::Close(_) => break,
            // Pongs are answered by axum; pongs to our pings need nothing.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.relay.unregister(id);
    write_task.abort();
    info!(socket = id, account_id = %account_id, "socket disconnected");
}

fn handle_frame(state: &AppState, socket: SocketId, account_id: &str, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(socket, error = %e, "dropping malformed frame");
            return;
        }
    };
    let kind = envelope.kind();
    if let Err(e) = forward::handle_client_envelope(
        state.daemon.as_ref(),
        &state.relay,
        socket,
        account_id,
        envelope,
    ) {
        warn!(socket, kind = %kind, error = %e, "failed to forward envelope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use callbridge_daemon::LoopbackDaemon;

    fn state(origins: &[&str]) -> AppState {
        AppState {
            daemon: Arc::new(LoopbackDaemon::new()),
            relay: Arc::new(RelayHub::new()),
            config: ServerConfig {
                allow_origins: origins.iter().map(|o| o.to_string()).collect(),
                ..ServerConfig::default()
            },
        }
    }

    #[test]
    fn origin_checks() {
        let state = state(&["https://app.example"]);
        let mut headers = HeaderMap::new();
        assert!(state.origin_allowed(&headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.example"));
        assert!(state.origin_allowed(&headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        assert!(!state.origin_allowed(&headers));
    }

    #[test]
    fn wildcard_origin_allows_everything() {
        let state = state(&["*"]);
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://anything.example"));
        assert!(state.origin_allowed(&headers));
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let state = state(&["*"]);
        // Neither parses, so nothing reaches the daemon.
        handle_frame(&state, 1, "nobody", "{not json");
        handle_frame(&state, 1, "nobody", r#"{"type":"Bogus","data":{}}"#);
        assert_eq!(state.relay.socket_count(), 0);
    }
}
