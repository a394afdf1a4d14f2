// SPDX-License-Identifier: MIT
//! Single-port HTTP + WebSocket host.
//!
//! One `TcpListener` serves three things: the WS upgrade at `/ws`, a plain
//! HTTP `/health` endpoint, and the SPA static bundle for every other GET.
//! The first bytes of each connection are peeked to route plain HTTP away
//! from the WebSocket handshake.

pub mod connection;
pub mod envelope;
pub mod registry;
pub mod statics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::events::EventBus;
use crate::server::envelope::Envelope;
use crate::server::registry::{ConnectionRegistry, WRITER_QUEUE_DEPTH};

/// Default wall-clock deadline for request/response operations.
pub const DEFAULT_OP_DEADLINE: Duration = Duration::from_secs(15);

/// What a service did with a request.
pub enum HandlerOutcome {
    /// Respond now with this payload.
    Reply(Value),
    /// The service emits its own frames for this `id` (streamed ops).
    Streamed,
}

/// A service registered with the multiplexer under one envelope `type`.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, connection_id: &str, envelope: &Envelope) -> Result<HandlerOutcome>;

    /// Per-operation deadline class. Expiry produces a `Timeout` error frame
    /// and any later response for that `id` is dropped.
    fn deadline(&self, _op: &str) -> Duration {
        DEFAULT_OP_DEADLINE
    }

    /// Called after a connection closes, for per-client cleanup.
    async fn on_disconnect(&self, _connection_id: &str) {}
}

/// The WebSocket multiplexer: connection lifecycle, handler dispatch,
/// and event fan-out.
pub struct WsHub {
    pub config: Arc<DaemonConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<EventBus>,
    pub started_at: std::time::Instant,
    handlers: std::sync::RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl WsHub {
    pub fn new(config: Arc<DaemonConfig>, registry: Arc<ConnectionRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            registry,
            bus,
            started_at: std::time::Instant::now(),
            handlers: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register a service under an envelope `type`. Idempotent — the first
    /// registration for a type wins.
    pub fn register(&self, envelope_type: &str, handler: Arc<dyn ServiceHandler>) {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(envelope_type) {
            debug!(envelope_type, "handler already registered — ignoring");
            return;
        }
        handlers.insert(envelope_type.to_string(), handler);
    }

    pub fn handler(&self, envelope_type: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.read().unwrap().get(envelope_type).cloned()
    }

    pub fn all_handlers(&self) -> Vec<Arc<dyn ServiceHandler>> {
        self.handlers.read().unwrap().values().cloned().collect()
    }
}

/// Accept loop. Runs until `shutdown` resolves; individual connections get
/// their own tasks.
pub async fn run(hub: Arc<WsHub>, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
    let addr = format!("{}:{}", hub.config.host, hub.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "server listening (WebSocket at /ws, HTTP elsewhere)");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping accept loop");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(e) = route_connection(stream, hub).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    Ok(())
}

/// Route a fresh TCP connection: `/ws` goes through the WebSocket
/// handshake, everything else is plain HTTP (health + static bundle).
async fn route_connection(stream: tokio::net::TcpStream, hub: Arc<WsHub>) -> Result<()> {
    // Peek the request line only; "GET /ws" (optionally with a query) is the
    // upgrade path. A partial peek can only mis-route pathological clients
    // that trickle the request line byte-by-byte — they get the HTTP handler.
    let mut peek_buf = [0u8; 16];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    let head = &peek_buf[..n];
    let is_ws = head.starts_with(b"GET /ws")
        && matches!(head.get(7), Some(b' ') | Some(b'?') | Some(b'/') | None);

    if !is_ws {
        return statics::serve_http(stream, &hub).await;
    }

    handle_upgrade(stream, hub).await
}

fn origin_allowed(origins: &[String], origin: &str) -> bool {
    origins.iter().any(|o| o == "*" || o == origin)
}

async fn handle_upgrade(stream: tokio::net::TcpStream, hub: Arc<WsHub>) -> Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024), // 16 MB
        max_frame_size: Some(4 * 1024 * 1024),    // 4 MB per frame
        ..Default::default()
    };

    // Capacity and origin are checked inside the handshake callback so a
    // refused client gets a proper HTTP error instead of a dropped socket.
    let at_capacity = hub.registry.count() >= hub.config.max_connections;
    let origins = hub.config.origins.clone();
    let origin_slot = Arc::new(std::sync::Mutex::new(String::new()));
    let origin_slot_cb = origin_slot.clone();

    let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        if at_capacity {
            let mut err = ErrorResponse::new(Some("too many connections".into()));
            *err.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return Err(err);
        }
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        // Absent origin (non-browser client) passes; a present origin must
        // be on the allowlist.
        if !origin.is_empty() && !origin_allowed(&origins, &origin) {
            let mut err = ErrorResponse::new(Some("origin refused".into()));
            *err.status_mut() = StatusCode::FORBIDDEN;
            return Err(err);
        }
        *origin_slot_cb.lock().unwrap() = origin;
        Ok(resp)
    };

    let ws =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

    let connection_id = uuid::Uuid::new_v4().to_string();
    let origin = origin_slot.lock().unwrap().clone();
    let (tx, rx) = mpsc::channel::<String>(WRITER_QUEUE_DEPTH);
    let (closed, last_pong) = hub.registry.register(&connection_id, &origin, tx.clone());

    info!(conn = %connection_id, origin = %origin, "client connected");
    let result = connection::run(ws, hub.clone(), connection_id.clone(), tx, rx, closed, last_pong).await;

    hub.registry.unregister(&connection_id);
    for handler in hub.all_handlers() {
        handler.on_disconnect(&connection_id).await;
    }
    info!(conn = %connection_id, "client disconnected");
    result
}

/// Build the error frame the hub sends when a handler fails or times out.
pub fn error_frame_for(envelope_type: &str, id: Option<&str>, message: &str) -> Envelope {
    Envelope::error_frame(&format!("{envelope_type}_response"), id, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_allowlist() {
        let any = vec!["*".to_string()];
        assert!(origin_allowed(&any, "http://example.com"));

        let pinned = vec!["http://localhost:5173".to_string()];
        assert!(origin_allowed(&pinned, "http://localhost:5173"));
        assert!(!origin_allowed(&pinned, "http://evil.example"));
    }

    #[test]
    fn register_is_idempotent() {
        struct Nop;
        #[async_trait]
        impl ServiceHandler for Nop {
            async fn handle(&self, _c: &str, _e: &Envelope) -> Result<HandlerOutcome> {
                Ok(HandlerOutcome::Reply(Value::Null))
            }
        }

        let config = Arc::new(DaemonConfig::load(None, None, Some(std::env::temp_dir())));
        let hub = WsHub::new(config, Arc::new(ConnectionRegistry::new()), Arc::new(EventBus::new()));
        let first: Arc<dyn ServiceHandler> = Arc::new(Nop);
        hub.register("git", first.clone());
        hub.register("git", Arc::new(Nop));
        assert!(hub.handler("git").is_some());
        assert!(hub.handler("terminal").is_none());
    }
}
