use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::server::envelope::Envelope;

/// Outbound frames queued per connection. Overflow closes the connection
/// rather than blocking other clients.
pub const WRITER_QUEUE_DEPTH: usize = 256;

/// One registered client connection.
///
/// Services reach a connection only through [`ConnectionRegistry::send_to`]
/// with its opaque id — never through a direct reference. Once the id is
/// unregistered, later sends are no-ops.
pub struct ConnectionEntry {
    tx: mpsc::Sender<String>,
    /// Signalled to make the connection task shut itself down.
    closed: Arc<Notify>,
    pub origin: String,
    pub connected_at: chrono::DateTime<Utc>,
    /// Unix-millis of the most recent pong from this client.
    pub last_pong: Arc<AtomicI64>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: std::sync::Mutex<HashMap<String, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns the close-signal and pong slot the
    /// connection task should watch.
    pub fn register(
        &self,
        id: &str,
        origin: &str,
        tx: mpsc::Sender<String>,
    ) -> (Arc<Notify>, Arc<AtomicI64>) {
        let closed = Arc::new(Notify::new());
        let last_pong = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
        let entry = ConnectionEntry {
            tx,
            closed: closed.clone(),
            origin: origin.to_string(),
            connected_at: Utc::now(),
            last_pong: last_pong.clone(),
        };
        self.inner.lock().unwrap().insert(id.to_string(), entry);
        (closed, last_pong)
    }

    pub fn unregister(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Enqueue a frame for one connection. Best-effort: `false` when the
    /// connection is gone. A full queue means the client cannot keep up —
    /// the connection is told to close and the frame is dropped.
    pub fn send_to(&self, id: &str, env: &Envelope) -> bool {
        let frame = match serde_json::to_string(env) {
            Ok(f) => f,
            Err(e) => {
                warn!(err = %e, "unserializable frame dropped");
                return false;
            }
        };
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.get(id) else {
            debug!(conn = id, "send to unregistered connection — dropped");
            return false;
        };
        match entry.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = id, "writer queue overflow — closing connection");
                entry.closed.notify_one();
                inner.remove(id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.remove(id);
                false
            }
        }
    }

}
