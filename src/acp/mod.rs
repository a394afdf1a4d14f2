//! ACP service: the WS-facing surface of the agent bridge.

pub mod bridge;
pub mod content;
pub mod framing;
pub mod rpc;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::server::envelope::Envelope;
use crate::server::{HandlerOutcome, ServiceHandler};
use bridge::AcpBridge;

pub struct AcpService {
    bridge: Arc<AcpBridge>,
}

impl AcpService {
    pub fn new(bridge: Arc<AcpBridge>) -> Arc<Self> {
        Arc::new(Self { bridge })
    }

    pub fn bridge(&self) -> &Arc<AcpBridge> {
        &self.bridge
    }

    /// Connect the configured agent command(s) at daemon start, first
    /// success wins. Failures log and move on — autostart must never keep
    /// the daemon from coming up.
    pub async fn autostart(&self, agents: &[String]) {
        for agent_cmd in agents {
            info!(agent = %agent_cmd, "autostarting agent");
            match self.bridge.connect(json!({ "agentCmd": agent_cmd })).await {
                Ok(_) => return,
                Err(e) => warn!(agent = %agent_cmd, err = %e, "autostart failed"),
            }
        }
    }
}

#[async_trait]
impl ServiceHandler for AcpService {
    async fn handle(&self, _connection_id: &str, envelope: &Envelope) -> Result<HandlerOutcome> {
        let body = envelope.body();
        let bridge = &self.bridge;
        let result = match envelope.op_name()? {
            "connect" => bridge.connect(body).await?,
            "disconnect" => {
                bridge.teardown().await;
                json!({ "ok": true })
            }
            "authenticate" => bridge.authenticate(body).await?,
            "authMethods" => bridge.auth_methods()?,
            "init" => bridge.init_info()?,
            "session.new" => bridge.session_new(body).await?,
            "session.select" => bridge.session_select(body)?,
            "session.last" => json!({ "sessionId": bridge.store().last_session() }),
            "sessions.list" => {
                let sessions = bridge.store().list_sessions();
                json!({ "sessions": sessions, "index": bridge.store().thread_index() })
            }
            "session.delete" => bridge.session_delete(body)?,
            "session.setMode" => bridge.set_mode(body).await?,
            "models.list" => bridge.models_list(body).await?,
            "model.select" => bridge.model_select(body).await?,
            "prompt" => bridge.prompt(body)?,
            "cancel" => bridge.cancel(body)?,
            "permission" => bridge.resolve_permission(body)?,
            "thread.get" => {
                let session_id = body
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServiceError::Malformed("thread.get requires sessionId".into()))?;
                json!({ "sessionId": session_id, "thread": bridge.store().thread(session_id)? })
            }
            "diff.apply" => bridge.diff_apply(body).await?,
            op @ ("terminal.create" | "terminal.output" | "terminal.kill"
            | "terminal.release" | "terminal.waitForExit") => {
                bridge.terminal_passthrough(op, body).await?
            }
            other => {
                return Err(ServiceError::Malformed(format!("unknown acp op '{other}'")).into())
            }
        };
        Ok(HandlerOutcome::Reply(result))
    }

    fn deadline(&self, op: &str) -> Duration {
        match op {
            // Initialize gets the long connect window plus headroom for the
            // spawn itself.
            "connect" => Duration::from_millis(self.bridge.connect_timeout_ms() + 5000),
            _ => crate::server::DEFAULT_OP_DEADLINE,
        }
    }
}
