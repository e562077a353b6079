// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket push: forwards bus envelopes to UI subscribers.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::events::EventFilter;
use crate::state::BridgeState;
use crate::transport::auth;

/// Query parameters for the push WebSocket.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    /// Comma-separated topics, or "all" (default: "attendance").
    #[serde(default = "default_topics")]
    pub topics: String,
    /// Comma-separated event wire names, or "all" (default: all).
    #[serde(default = "default_events")]
    pub events: String,
}

fn default_topics() -> String {
    "attendance".to_owned()
}
fn default_events() -> String {
    "all".to_owned()
}

/// `GET /ws` — WebSocket upgrade for the event stream.
pub async fn ws_handler(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let query_str = query.token.as_ref().map(|t| format!("token={t}")).unwrap_or_default();
    if auth::validate_ws_query(&query_str, state.config.auth_token.as_deref()).is_err() {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }

    let filter = EventFilter::new(&query.topics, &query.events);
    ws.on_upgrade(move |socket| handle_ws(state, filter, socket)).into_response()
}

/// Per-connection event loop.
async fn handle_ws(state: Arc<BridgeState>, filter: EventFilter, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut bus_rx = state.bus.subscribe();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            envelope = bus_rx.recv() => {
                let envelope = match envelope {
                    Ok(e) => e,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "ws subscriber lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if filter.wants(&envelope) {
                    if let Ok(json) = serde_json::to_string(&envelope) {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Inbound messages are ignored; the bus is push-only.
                    _ => {}
                }
            }
        }
    }
}
