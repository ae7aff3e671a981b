//! WebSocket subscriptions: `GET /ws?topic=all|account:<hex>`.
//!
//! Every notification record for the topic is forwarded as one JSON text
//! frame. Clients may send `{"type":"status"}` at any time to receive the
//! current sync status.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use w3b2_engine::{Bridge, NotificationRecord, Topic};

use crate::api::AppState;
use crate::error::GatewayError;

#[derive(Deserialize)]
pub struct WsParams {
    topic: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientRequest {
    Status,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Result<Response, GatewayError> {
    let topic: Topic = params
        .topic
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(|e| GatewayError::BadRequest(format!("invalid topic: {e}")))?;

    Ok(ws.on_upgrade(move |socket| serve_socket(socket, state.bridge, topic)))
}

async fn serve_socket(mut socket: WebSocket, bridge: Arc<Bridge>, topic: Topic) {
    let mut records = bridge.subscribe(topic);
    info!(%topic, "websocket subscriber connected");

    let greeting = NotificationRecord::Status {
        status: bridge.status(),
    };
    if send(&mut socket, &greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            record = records.next() => match record {
                Some(record) => {
                    if send(&mut socket, &record).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if socket.send(Message::Text(answer(&bridge, &text))).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
        }
    }

    info!(%topic, "websocket subscriber disconnected");
}

async fn send(socket: &mut WebSocket, record: &NotificationRecord) -> Result<(), ()> {
    let text = match serde_json::to_string(record) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode notification record");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await.map_err(|e| {
        debug!(error = %e, "websocket send failed");
    })
}

/// Reply to a client text frame.
fn answer(bridge: &Bridge, text: &str) -> String {
    let reply = match serde_json::from_str::<ClientRequest>(text) {
        Ok(ClientRequest::Status) => serde_json::to_value(NotificationRecord::Status {
            status: bridge.status(),
        }),
        Err(e) => Ok(serde_json::json!({
            "type": "error",
            "error": format!("unsupported request: {e}"),
        })),
    };
    reply.map(|v| v.to_string()).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "error": e.to_string() }).to_string()
    })
}
