//! Debug WebSocket proxy.
//!
//! Tunnels a client WebSocket to the session's in-container CDP endpoint,
//! byte-for-byte and frame-type-preserving, until either side closes. The
//! proxy never reframes, buffers across messages, or inspects payloads.

use crate::models::SessionStatus;
use crate::session::SessionManager;
use axum::extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as BrowserMessage;
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upgrade an incoming debug connection and bridge it to the browser.
pub async fn handle_debug_connection(
    session_mgr: Arc<SessionManager>,
    session_id: String,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match session_mgr.get_session(&session_id).await {
        Ok(session) => session,
        Err(_) => return (StatusCode::NOT_FOUND, "Session not found").into_response(),
    };

    if session.status != SessionStatus::Running {
        return (StatusCode::BAD_REQUEST, "Session is not running").into_response();
    }

    let connect_url = session.connect_url.clone();
    ws.on_upgrade(move |client| async move {
        info!(session = %session_id, "Client connected to debug proxy");
        proxy_connection(client, &connect_url, &session_id).await;
        info!(session = %session_id, "Client disconnected from debug proxy");
    })
}

async fn proxy_connection(mut client: WebSocket, connect_url: &str, session_id: &str) {
    let browser = match tokio::time::timeout(
        DIAL_TIMEOUT,
        tokio_tungstenite::connect_async(connect_url),
    )
    .await
    {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            warn!(session = %session_id, "failed to connect to browser: {}", e);
            let _ = client
                .send(ClientMessage::Text(format!("Error connecting: {}", e)))
                .await;
            return;
        }
        Err(_) => {
            warn!(session = %session_id, "browser dial timed out");
            let _ = client
                .send(ClientMessage::Text("Error connecting: dial timeout".into()))
                .await;
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client.split();
    let (mut browser_tx, mut browser_rx) = browser.split();

    let client_to_browser = async {
        while let Some(msg) = client_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => return Err(e.to_string()),
            };
            let forward = match msg {
                ClientMessage::Text(text) => BrowserMessage::Text(text),
                ClientMessage::Binary(data) => BrowserMessage::Binary(data),
                ClientMessage::Close(_) => return Ok(()),
                // Ping/pong is handled per-hop, not forwarded.
                _ => continue,
            };
            if let Err(e) = browser_tx.send(forward).await {
                return Err(e.to_string());
            }
        }
        Ok(())
    };

    let browser_to_client = async {
        while let Some(msg) = browser_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => return Err(e.to_string()),
            };
            let forward = match msg {
                BrowserMessage::Text(text) => ClientMessage::Text(text),
                BrowserMessage::Binary(data) => ClientMessage::Binary(data),
                BrowserMessage::Close(_) => return Ok(()),
                _ => continue,
            };
            if let Err(e) = client_tx.send(forward).await {
                return Err(e.to_string());
            }
        }
        Ok(())
    };

    // First direction to finish wins; dropping the halves closes both
    // sockets. A normal close is not an error.
    tokio::select! {
        res = client_to_browser => log_result(session_id, "client→browser", res),
        res = browser_to_client => log_result(session_id, "browser→client", res),
    }
}

fn log_result(session_id: &str, direction: &str, res: std::result::Result<(), String>) {
    match res {
        Ok(()) => debug!(session = %session_id, direction, "proxy direction closed"),
        Err(e) => warn!(session = %session_id, direction, "proxy error: {}", e),
    }
}
