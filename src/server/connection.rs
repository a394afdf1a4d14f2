//! Per-connection task: auth phase, frame dispatch, heartbeats, fan-out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::error::{classify, ServiceError};
use crate::server::envelope::{parse_envelope, Envelope};
use crate::server::{error_frame_for, HandlerOutcome, WsHub};

/// Server → client WS ping cadence.
const PING_INTERVAL_SECS: u64 = 20;
/// A connection silent for this long (no pong) is closed.
const PONG_TIMEOUT_SECS: i64 = 60;
/// How long a client gets to present the shared token.
const AUTH_DEADLINE_SECS: u64 = 10;

/// Constant-time token comparison to prevent timing-based token oracle
/// attacks. Returns `true` if `a == b` without short-circuiting on mismatch.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

pub async fn run(
    ws: WebSocketStream<TcpStream>,
    hub: Arc<WsHub>,
    connection_id: String,
    tx: mpsc::Sender<String>,
    mut rx: mpsc::Receiver<String>,
    closed: Arc<Notify>,
    last_pong: Arc<AtomicI64>,
) -> Result<()> {
    let (mut sink, mut stream) = ws.split();

    // ── Auth challenge ───────────────────────────────────────────────────────
    // With a shared token configured, the first envelope must be
    // `{type:"auth", payload:{token}}`. Anything else closes the connection.
    if let Some(expected) = hub.config.token.clone() {
        let first = tokio::time::timeout(
            std::time::Duration::from_secs(AUTH_DEADLINE_SECS),
            stream.next(),
        )
        .await;

        let text = match first {
            Ok(Some(Ok(Message::Text(t)))) => t,
            // Timeout, closed, or a non-text frame — reject silently.
            _ => return Ok(()),
        };

        let env = match parse_envelope(&text, hub.config.strict_envelopes) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };

        let provided = env.body().get("token").and_then(|t| t.as_str()).unwrap_or("").to_string();
        if env.kind != "auth" || !tokens_equal(&provided, &expected) {
            let frame = Envelope::error_frame("auth_response", env.id.as_deref(), "Refused: bad token");
            let _ = sink.send(Message::Text(serde_json::to_string(&frame)?)).await;
            return Ok(());
        }

        let ok = Envelope::response("auth_response", env.id.as_deref().unwrap_or(""), json!({"ok": true}));
        sink.send(Message::Text(serde_json::to_string(&ok)?)).await?;
        debug!(conn = %connection_id, "client authenticated");
    }

    // Pending table: ids currently in flight on this connection. Owned here,
    // shared with the per-request tasks that clear their own entry.
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut bus_rx = hub.bus.subscribe();
    let mut heartbeat =
        tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Queued outbound frame (responses, targeted events, pongs).
            frame = rx.recv() => {
                match frame {
                    Some(f) => {
                        if sink.send(Message::Text(f)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Inbound client frame.
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(&hub, &connection_id, &text, &in_flight);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(conn = %connection_id, err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }

            // Broadcast event from the bus.
            event = bus_rx.recv() => {
                match event {
                    Ok(frame) => {
                        // Same overflow policy as targeted sends: a client
                        // that cannot drain its queue is closed.
                        if tx.try_send(frame).is_err() {
                            warn!(conn = %connection_id, "broadcast overflow — closing slow client");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        hub.bus.note_lagged(n);
                    }
                }
            }

            _ = heartbeat.tick() => {
                let silent_ms = Utc::now().timestamp_millis()
                    - last_pong.load(Ordering::Relaxed);
                if silent_ms > PONG_TIMEOUT_SECS * 1000 {
                    warn!(conn = %connection_id, silent_ms, "heartbeat timeout — closing");
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            // Forced close (writer overflow detected by the registry, or
            // daemon shutdown).
            _ = closed.notified() => break,
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}

/// Parse one text frame and hand it to the right service. Replies and
/// errors are enqueued through the registry so delivery stays at-most-once
/// and bound to the originating connection.
fn dispatch_frame(
    hub: &Arc<WsHub>,
    connection_id: &str,
    text: &str,
    in_flight: &Arc<Mutex<HashSet<String>>>,
) {
    let env = match parse_envelope(text, hub.config.strict_envelopes) {
        Ok(e) => e,
        Err(e) => {
            hub.registry.send_to(
                connection_id,
                &Envelope::error_frame("error", None, &e.wire_message()),
            );
            return;
        }
    };

    // Application-level liveness probe.
    if env.kind == "ping" {
        let mut pong = Envelope::event("pong", serde_json::Value::Null);
        pong.id = env.id.clone();
        hub.registry.send_to(connection_id, &pong);
        return;
    }
    if env.kind == "pong" {
        return;
    }

    let Some(handler) = hub.handler(&env.kind) else {
        hub.registry.send_to(
            connection_id,
            &Envelope::error_frame(
                "error",
                env.id.as_deref(),
                &format!("Malformed: unknown type '{}'", env.kind),
            ),
        );
        return;
    };

    let Some(id) = env.id.clone() else {
        hub.registry.send_to(
            connection_id,
            &error_frame_for(&env.kind, None, "Malformed: request without id"),
        );
        return;
    };

    let hub = hub.clone();
    let connection_id = connection_id.to_string();
    let in_flight = in_flight.clone();
    tokio::spawn(async move {
        {
            let mut pending = in_flight.lock().await;
            if !pending.insert(id.clone()) {
                hub.registry.send_to(
                    &connection_id,
                    &error_frame_for(&env.kind, Some(&id), "Malformed: duplicate request id"),
                );
                return;
            }
        }

        let deadline = handler.deadline(env.op.as_deref().unwrap_or(""));
        let reply = match tokio::time::timeout(deadline, handler.handle(&connection_id, &env)).await
        {
            Ok(Ok(HandlerOutcome::Reply(value))) => {
                Some(Envelope::response(&format!("{}_response", env.kind), &id, value))
            }
            // Streamed ops answered with their own frames already.
            Ok(Ok(HandlerOutcome::Streamed)) => None,
            Ok(Err(e)) => Some(error_frame_for(&env.kind, Some(&id), &classify(&e))),
            Err(_) => {
                // The handler future is dropped here, so this `id` can never
                // produce a late second frame.
                let e = ServiceError::Timeout("operation deadline exceeded".into());
                Some(error_frame_for(&env.kind, Some(&id), &e.wire_message()))
            }
        };

        if let Some(frame) = reply {
            hub.registry.send_to(&connection_id, &frame);
        }
        in_flight.lock().await.remove(&id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_compare_matches_exact_only() {
        assert!(tokens_equal("abc123", "abc123"));
        assert!(!tokens_equal("abc123", "abc124"));
        assert!(!tokens_equal("abc", "abc123"));
        assert!(!tokens_equal("", "x"));
        assert!(tokens_equal("", ""));
    }
}
