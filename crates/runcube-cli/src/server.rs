//! WebSocket server
//!
//! Each WebSocket connection becomes one session. Frames are bridged to the
//! session through channels so the session never touches the socket.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use runcube::{Config, LanguageRegistry, ServerMessage, SessionManager};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 256;

pub async fn serve(config: Config, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let registry =
        LanguageRegistry::from_config(&config).context("failed to build language registry")?;
    let manager = SessionManager::new(config, Arc::new(registry))
        .context("failed to create session manager")?;

    let artifacts = manager.runner().artifacts();
    artifacts
        .prepare()
        .await
        .context("failed to create temp directory")?;
    let swept = artifacts.sweep_stale().await;
    info!(root = %artifacts.root().display(), swept, "artifact root ready");

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(manager);

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind to {bind}"))?;

    info!("runcube listening on {bind}");
    info!("WebSocket endpoint: ws://{bind}/ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn health(State(manager): State<SessionManager>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "active_sessions": manager.active_sessions(),
        "languages": manager.runner().registry().len(),
        "unavailable": manager.runner().registry().unavailable(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(manager): State<SessionManager>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
        .into_response()
}

async fn handle_socket(socket: WebSocket, manager: SessionManager) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    break;
                }
            };
            if inbound_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = manager.serve(inbound_rx, outbound_tx).await {
        warn!(error = %e, "session failed");
    }

    reader.abort();
    let _ = writer.await;
}
