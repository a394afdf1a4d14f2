//! JSON-RPC 2.0 client over the agent child's stdio.
//!
//! Single-writer: every outbound message goes through one bounded queue
//! drained by one stdin task, so frames never interleave. Requests carry a
//! monotonically-incrementing id; the inbound reader (owned by the bridge)
//! feeds messages back through [`JsonRpcClient::handle_message`], which
//! resolves awaiting callers by id and surfaces everything else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::acp::framing::Framing;
use crate::error::ServiceError;

/// Outbound queue depth; excess requests fail fast instead of blocking.
const OUTBOUND_QUEUE_DEPTH: usize = 1000;

/// A JSON-RPC error object from the agent.
#[derive(Debug, Clone, thiserror::Error)]
#[error("agent error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// Inbound traffic that is not a response to one of our requests.
#[derive(Debug)]
pub enum Incoming {
    /// The agent is calling us; `id` must be echoed in a response.
    Request { id: Value, method: String, params: Value },
    Notification { method: String, params: Value },
}

pub struct JsonRpcClient {
    framing: Framing,
    tx: mpsc::Sender<Vec<u8>>,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>,
}

impl JsonRpcClient {
    /// Wire a client to the child's stdin. The writer task owns the handle
    /// and exits when the client (or the child) goes away.
    pub fn new(framing: Framing, mut stdin: tokio::process::ChildStdin) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if stdin.write_all(&frame).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            debug!("agent stdin writer stopped");
        });
        Self {
            framing,
            tx,
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
        }
    }

    fn enqueue(&self, message: Value) -> Result<()> {
        let frame = self.framing.encode(&message);
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ServiceError::Conflict("agent outbound queue full".into()).into()
            }
            mpsc::error::TrySendError::Closed(_) => {
                ServiceError::Unavailable("agent not connected".into()).into()
            }
        })
    }

    /// Call an agent method and await its response. The returned error is a
    /// [`RpcError`] (inside anyhow) when the agent answered with one, so
    /// callers can inspect codes (auth, session recovery).
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, done_tx);

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(e) = self.enqueue(message) {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match done_rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(rpc)) => Err(rpc.into()),
            Err(_) => Err(ServiceError::Unavailable("agent went away".into()).into()),
        }
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.enqueue(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
    }

    /// Answer a request the agent made to us.
    pub fn respond(&self, id: Value, result: Value) -> Result<()> {
        self.enqueue(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }

    pub fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<()> {
        self.enqueue(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }))
    }

    /// Route one inbound message. Responses resolve their awaiter and
    /// return `None`; requests and notifications are handed back to the
    /// caller (the bridge) for dispatch.
    pub fn handle_message(&self, message: Value) -> Option<Incoming> {
        let has_method = message.get("method").is_some();
        let id = message.get("id").cloned();

        if has_method {
            let method = message["method"].as_str().unwrap_or_default().to_string();
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            return Some(match id {
                Some(id) if !id.is_null() => Incoming::Request { id, method, params },
                _ => Incoming::Notification { method, params },
            });
        }

        // A response: correlate by id.
        let Some(id) = id.as_ref().and_then(Value::as_u64) else {
            warn!(msg = %message, "agent response without usable id — dropped");
            return None;
        };
        let Some(waiter) = self.pending.lock().unwrap().remove(&id) else {
            debug!(id, "late agent response — awaiter gone");
            return None;
        };

        let outcome = if let Some(err) = message.get("error") {
            Err(RpcError {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown agent error")
                    .to_string(),
                data: err.get("data").cloned(),
            })
        } else {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = waiter.send(outcome);
        None
    }

    /// Resolve every pending request with an error; used when the child
    /// exits or the bridge disconnects.
    pub fn fail_all(&self, reason: &str) {
        let pending: Vec<_> = {
            let mut map = self.pending.lock().unwrap();
            map.drain().collect()
        };
        for (_, waiter) in pending {
            let _ = waiter.send(Err(RpcError {
                code: -32099,
                message: reason.to_string(),
                data: None,
            }));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client_with_sink() -> JsonRpcClient {
        // `cat >/dev/null` style sink: spawn `cat` and ignore its output.
        let mut cmd = tokio::process::Command::new("cat");
        cmd.stdin(std::process::Stdio::piped()).stdout(std::process::Stdio::null());
        let mut child = cmd.spawn().expect("cat available");
        JsonRpcClient::new(Framing::Ndjson, child.stdin.take().unwrap())
    }

    #[tokio::test]
    async fn request_resolves_on_matching_response() {
        let client = client_with_sink().await;
        let fut = client.request("session/new", json!({}));
        tokio::pin!(fut);

        // Not resolved until the response arrives.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut fut).await.is_err()
        );
        assert_eq!(client.pending_count(), 1);

        let routed =
            client.handle_message(json!({ "jsonrpc": "2.0", "id": 1, "result": { "sessionId": "s1" } }));
        assert!(routed.is_none());

        let result = fut.await.unwrap();
        assert_eq!(result["sessionId"], "s1");
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_surfaces_rpc_error() {
        let client = client_with_sink().await;
        let fut = client.request("session/prompt", json!({}));
        tokio::pin!(fut);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(10), &mut fut).await;

        client.handle_message(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": -32001, "message": "Session not found" },
        }));
        let err = fut.await.unwrap_err();
        let rpc = err.downcast_ref::<RpcError>().unwrap();
        assert_eq!(rpc.code, -32001);
        assert!(rpc.message.contains("not found"));
    }

    #[tokio::test]
    async fn notifications_and_requests_are_routed_out() {
        let client = client_with_sink().await;

        let note = client
            .handle_message(json!({ "jsonrpc": "2.0", "method": "session/update", "params": { "x": 1 } }))
            .unwrap();
        assert!(matches!(note, Incoming::Notification { ref method, .. } if method == "session/update"));

        let req = client
            .handle_message(json!({
                "jsonrpc": "2.0", "id": 7, "method": "session/request_permission", "params": {},
            }))
            .unwrap();
        assert!(matches!(req, Incoming::Request { ref method, .. } if method == "session/request_permission"));
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let client = client_with_sink().await;
        let routed = client.handle_message(json!({ "jsonrpc": "2.0", "id": 42, "result": {} }));
        assert!(routed.is_none());
    }

    #[tokio::test]
    async fn fail_all_resolves_waiters() {
        let client = client_with_sink().await;
        let fut = client.request("initialize", json!({}));
        tokio::pin!(fut);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(10), &mut fut).await;

        client.fail_all("agent exited");
        let err = fut.await.unwrap_err();
        assert!(err.to_string().contains("agent exited"));
    }
}
