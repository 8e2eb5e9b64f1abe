use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use display_agent::{DisplaySession, ViewerConn, ViewerMessage, ViewerPeer};

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<DisplaySession>,
    pub connections: Arc<AtomicU64>,
    pub auth_token: Option<String>,
}

#[derive(Deserialize)]
pub struct DisplayParams {
    token: Option<String>,
}

/// WebSocket upgrade for a viewer. Authentication proper belongs to the
/// upstream routing layer; the shared token is a stand-in for deployments
/// that run without one.
pub async fn display_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<DisplayParams>,
    State(state): State<AppState>,
) -> Response {
    if let Some(expected) = &state.auth_token {
        if params.token.as_deref() != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| serve_viewer(socket, state))
}

/// Adapt the WebSocket to a `ViewerConn` and hand it to the session.
async fn serve_viewer(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    state.connections.fetch_add(1, Ordering::SeqCst);
    debug!(%connection_id, "viewer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (viewer, peer) = ViewerConn::pair(64);
    let ViewerPeer {
        frames,
        mut messages,
    } = peer;

    if let Err(error) = state.session.accept(viewer).await {
        warn!(%connection_id, %error, "viewer rejected");
    }

    let inbound = async move {
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if frames.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    let outbound = async move {
        while let Some(message) = messages.recv().await {
            match message {
                ViewerMessage::Data(data) => {
                    if ws_tx.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                ViewerMessage::Close(signal) => {
                    let frame = CloseFrame {
                        code: signal.code(),
                        reason: signal.to_string().into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    };

    tokio::join!(inbound, outbound);
    state.connections.fetch_sub(1, Ordering::SeqCst);
    debug!(%connection_id, "viewer disconnected");
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StatusRequest {
    Health,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StatusResponse {
    Health { connections: u64 },
}

pub async fn status_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_status(socket, state))
}

/// A socket that relays health information on request.
async fn serve_status(mut socket: WebSocket, state: AppState) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<StatusRequest>(&text) {
            Ok(StatusRequest::Health) => {
                let response = StatusResponse::Health {
                    connections: state.connections.load(Ordering::SeqCst),
                };
                let Ok(json) = serde_json::to_string(&response) else {
                    continue;
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            // Garbage on the status socket is ignored; the client asks
            // again on its next tick.
            Err(error) => debug!(%error, "unrecognized status message"),
        }
    }
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "alive",
        "connections": state.connections.load(Ordering::SeqCst),
        "root_display": state.session.root_display().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_request_parses() {
        let request: StatusRequest = serde_json::from_str(r#"{"event":"health"}"#).unwrap();
        assert!(matches!(request, StatusRequest::Health));
        assert!(serde_json::from_str::<StatusRequest>(r#"{"event":"reboot"}"#).is_err());
    }

    #[test]
    fn status_response_shape() {
        let response = StatusResponse::Health { connections: 3 };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["event"], "health");
        assert_eq!(json["connections"], 3);
    }
}
