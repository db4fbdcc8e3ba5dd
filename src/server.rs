//! WebSocket transport and health endpoint.
//!
//! This module provides a server that:
//! - Accepts one or more editor clients on `ws://127.0.0.1:<port>/` (or `/ws`)
//! - Streams `state` and `hb` events from the latest telemetry snapshot
//! - Forwards asynchronous calibration events to every client
//! - Dispatches inbound commands to the [`Agent`]
//!
//! # Architecture
//!
//! ```text
//! capture thread ──→ Telemetry ──┐
//!                                ├──→ per-connection writer ──→ client
//! broadcast events ──────────────┤
//! command replies ───────────────┘
//!              client ──→ reader ──→ spawn_blocking(Agent::dispatch)
//! ```

use crate::agent::Agent;
use crate::core::mode::ModeState;
use crate::protocol::{Command, Event};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

/// How often each connection checks the telemetry snapshot.
const WRITER_TICK: Duration = Duration::from_millis(20);

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, agent))
}

async fn handle_socket(socket: WebSocket, agent: Arc<Agent>) {
    tracing::info!("Client connected");
    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Event>(32);
    let mut events = agent.subscribe();
    let mut shutdown = agent.shutdown_signal();

    let reader_agent = agent.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let replies = match Command::parse(&text) {
                Ok(command) => {
                    let agent = reader_agent.clone();
                    match tokio::task::spawn_blocking(move || agent.dispatch(command)).await {
                        Ok(replies) => replies,
                        Err(e) => {
                            tracing::error!("Command dispatch failed: {}", e);
                            continue;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("Rejected client message: {}", e);
                    vec![Event::protocol_error(&e)]
                }
            };
            for reply in replies {
                if reply_tx.send(reply).await.is_err() {
                    return;
                }
            }
        }
    });

    let mut tick = tokio::time::interval(WRITER_TICK);
    let mut last_state: Option<ModeState> = None;
    let mut last_hb: Option<Instant> = None;

    'conn: loop {
        let outgoing = tokio::select! {
            _ = tick.tick() => {
                // State and heartbeat come from one snapshot, state first.
                let telemetry = agent.telemetry();
                let mut out = Vec::with_capacity(2);
                // Pausing holds the stable state, so only a state change is news.
                if last_state != Some(telemetry.state) {
                    out.push(Event::state(telemetry.state, telemetry.paused));
                    last_state = Some(telemetry.state);
                }
                let interval = agent.heartbeat_interval();
                if last_hb.map_or(true, |at| at.elapsed() >= interval) {
                    out.push(Event::Hb(Box::new(agent.heartbeat(&telemetry))));
                    last_hb = Some(Instant::now());
                }
                out
            }
            event = events.recv() => match event {
                Ok(event) => vec![event],
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Client lagged, {} events dropped", n);
                    Vec::new()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            reply = reply_rx.recv() => match reply {
                Some(reply) => vec![reply],
                None => break,
            },
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                // Let the shutdown ack reach the client before closing.
                tokio::time::sleep(WRITER_TICK).await;
                let mut out = Vec::new();
                while let Ok(reply) = reply_rx.try_recv() {
                    out.push(reply);
                }
                for event in out {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };

        for event in outgoing {
            if send_event(&mut sink, &event).await.is_err() {
                break 'conn;
            }
        }
    }

    reader.abort();
    tracing::info!("Client disconnected");
}

async fn send_event<S>(sink: &mut S, event: &Event) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("Failed to encode event: {}", e);
            return Ok(());
        }
    };
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

/// Build the router: WebSocket on `/` and `/ws`, plus `/health`.
pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(agent)
}

/// Bind on localhost and serve until the agent is shut down.
///
/// Port 0 picks a free port; the bound address is returned.
pub async fn run(agent: Arc<Agent>, port: u16) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let app = router(agent.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Focus sensor listening on ws://{}", actual_addr);

    let mut shutdown = agent.shutdown_signal();
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, handle))
}
