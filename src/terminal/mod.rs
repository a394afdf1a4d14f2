// SPDX-License-Identifier: MIT
//! PTY session engine: long-lived shell sessions for WS clients.
//!
//! Two engines behind one session type — line mode (each submitted line is
//! its own spawn, builtins intercepted) and pipe mode (one long-lived
//! shell). Sessions survive client disconnects; output buffers until the
//! next owner claims the session.

pub mod redact;
pub mod safety;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::error::ServiceError;
use crate::server::envelope::Envelope;
use crate::server::registry::ConnectionRegistry;
use crate::server::{HandlerOutcome, ServiceHandler};
use session::{build_child_env, shell_command, EngineMode, PtySession, SessionConfig, KILL_GRACE_MS};

/// Idle windows before the sweeper disposes a session.
const EPHEMERAL_IDLE_SECS: i64 = 15 * 60;
const PERSISTENT_IDLE_SECS: i64 = 30 * 60;
/// Sweep cadence.
const REAP_INTERVAL_SECS: u64 = 60;

pub struct TerminalService {
    sessions: StdMutex<HashMap<String, Arc<PtySession>>>,
    registry: Arc<ConnectionRegistry>,
    config: Arc<DaemonConfig>,
    session_cfg: Arc<SessionConfig>,
    debug: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    cols: Option<u16>,
    rows: Option<u16>,
    cwd: Option<String>,
    persistent: Option<bool>,
    engine_mode: Option<EngineMode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRef {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputParams {
    session_id: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizeParams {
    session_id: String,
    cols: u16,
    rows: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecParams {
    command: String,
    cwd: Option<String>,
}

fn params<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| ServiceError::Malformed(e.to_string()).into())
}

impl TerminalService {
    pub fn new(config: Arc<DaemonConfig>, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        let session_cfg = Arc::new(SessionConfig {
            shell: config.shell.clone(),
            allowlist: config.command_allowlist.clone(),
            allow_unsafe: config.allow_unsafe,
            env_deny: config.env_deny.clone(),
            inject_ai_creds: config.inject_ai_creds,
            render_prompt: true,
        });
        Arc::new(Self {
            sessions: StdMutex::new(HashMap::new()),
            registry,
            config,
            session_cfg,
            debug: std::env::var("KIRO_DEBUG_TERMINAL").map(|v| v == "1").unwrap_or(false),
        })
    }

    /// Background sweep disposing dead and idle sessions.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(REAP_INTERVAL_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                service.reap_idle().await;
            }
        })
    }

    async fn reap_idle(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let stale: Vec<Arc<PtySession>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| {
                    let window = if s.persistent { PERSISTENT_IDLE_SECS } else { EPHEMERAL_IDLE_SECS };
                    !s.is_alive() || now - s.last_activity_millis() > window * 1000
                })
                .cloned()
                .collect()
        };
        for session in stale {
            info!(session = %session.id, persistent = session.persistent, "reaping idle session");
            session.dispose().await;
            self.sessions.lock().unwrap().remove(&session.id);
        }
    }

    fn get(&self, session_id: &str) -> Result<Arc<PtySession>> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")).into())
    }

    fn resolve_cwd(&self, requested: Option<&str>) -> Result<PathBuf> {
        let cwd = match requested {
            None => self.config.terminal_cwd.clone(),
            Some(p) if std::path::Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => self.config.workspace_root.join(p),
        };
        if !cwd.is_dir() {
            return Err(ServiceError::NotFound(format!("cwd {}", cwd.display())).into());
        }
        Ok(cwd)
    }

    async fn create(&self, connection_id: &str, body: Value) -> Result<Value> {
        let p: CreateParams = params(body)?;
        {
            let sessions = self.sessions.lock().unwrap();
            if sessions.len() >= self.config.max_pty_sessions {
                return Err(ServiceError::Conflict(format!(
                    "session limit reached ({})",
                    self.config.max_pty_sessions
                ))
                .into());
            }
        }
        let cwd = self.resolve_cwd(p.cwd.as_deref())?;
        let id = uuid::Uuid::new_v4().to_string();
        let session = PtySession::new(
            id.clone(),
            p.engine_mode.unwrap_or(EngineMode::Line),
            p.persistent.unwrap_or(false),
            cwd.clone(),
            p.cols.unwrap_or(80),
            p.rows.unwrap_or(24),
            connection_id.to_string(),
            self.registry.clone(),
            self.session_cfg.clone(),
        )
        .map_err(|e| ServiceError::Upstream(format!("spawn failed: {e:#}")))?;

        self.sessions.lock().unwrap().insert(id.clone(), session);
        debug!(session = %id, conn = %connection_id, "session created");
        Ok(json!({ "sessionId": id, "cwd": cwd.display().to_string() }))
    }

    /// One-shot command with streamed start/data/exit frames on the
    /// request's own `id`.
    async fn exec(&self, connection_id: &str, request_id: &str, body: Value) -> Result<()> {
        let p: ExecParams = params(body)?;
        safety::check_command(&p.command, &self.config.command_allowlist, self.config.allow_unsafe)?;
        let cwd = self.resolve_cwd(p.cwd.as_deref())?;

        let mut cmd = shell_command(&self.config.shell, &p.command);
        cmd.current_dir(&cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env_clear()
            .envs(build_child_env(&self.session_cfg, 80, 24));
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ServiceError::Upstream(format!("spawn failed: {e}")))?;

        self.send_exec_frame(connection_id, request_id, json!({ "event": "start" }));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            tokio::join!(
                self.pump_exec(connection_id, request_id, stdout),
                self.pump_exec(connection_id, request_id, stderr),
            );
            child.wait().await
        };

        let deadline = Duration::from_secs(self.config.exec_timeout_secs);
        match tokio::time::timeout(deadline, run).await {
            Ok(Ok(status)) => {
                self.send_exec_frame(
                    connection_id,
                    request_id,
                    json!({ "event": "exit", "code": status.code() }),
                );
                Ok(())
            }
            Ok(Err(e)) => Err(ServiceError::Upstream(format!("wait failed: {e}")).into()),
            Err(_) => {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    // SAFETY: our own child's process group.
                    unsafe {
                        libc::kill(-(pid as libc::pid_t), libc::SIGINT);
                    }
                }
                tokio::time::sleep(Duration::from_millis(KILL_GRACE_MS)).await;
                let _ = child.kill().await;
                let _ = child.wait().await;
                Err(ServiceError::Timeout(format!(
                    "exec exceeded {}s",
                    self.config.exec_timeout_secs
                ))
                .into())
            }
        }
    }

    fn send_exec_frame(&self, connection_id: &str, request_id: &str, data: Value) {
        self.registry
            .send_to(connection_id, &Envelope::stream("terminal", request_id, data));
    }

    async fn pump_exec<R: tokio::io::AsyncRead + Unpin>(
        &self,
        connection_id: &str,
        request_id: &str,
        reader: Option<R>,
    ) {
        use tokio::io::AsyncReadExt;
        let Some(mut reader) = reader else { return };
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => self.send_exec_frame(
                    connection_id,
                    request_id,
                    json!({
                        "event": "data",
                        "chunk": redact::redact(&String::from_utf8_lossy(&buf[..n])),
                    }),
                ),
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Dispose every session; called on daemon shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<PtySession>> =
            self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in all {
            session.dispose().await;
        }
    }
}

#[async_trait]
impl ServiceHandler for TerminalService {
    async fn handle(&self, connection_id: &str, envelope: &Envelope) -> Result<HandlerOutcome> {
        let op = envelope.op_name()?;
        let body = envelope.body();
        if self.debug {
            debug!(conn = %connection_id, op, body = %body, "terminal op");
        }
        match op {
            "create" => Ok(HandlerOutcome::Reply(self.create(connection_id, body).await?)),
            "input" => {
                let p: InputParams = params(body)?;
                let session = self.get(&p.session_id)?;
                // Any input from a new connection claims the session and
                // flushes buffered output first.
                session.claim(connection_id);
                session.input(&p.data).await?;
                Ok(HandlerOutcome::Reply(json!({ "ok": true })))
            }
            "reattach" => {
                let p: SessionRef = params(body)?;
                self.get(&p.session_id)?.claim(connection_id);
                Ok(HandlerOutcome::Reply(json!({ "ok": true })))
            }
            "resize" => {
                let p: ResizeParams = params(body)?;
                self.get(&p.session_id)?.resize(p.cols, p.rows);
                Ok(HandlerOutcome::Reply(json!({ "ok": true })))
            }
            "cancel" => {
                let p: SessionRef = params(body)?;
                self.get(&p.session_id)?.interrupt().await;
                Ok(HandlerOutcome::Reply(json!({ "ok": true })))
            }
            "dispose" => {
                let p: SessionRef = params(body)?;
                let session = self.get(&p.session_id)?;
                session.dispose().await;
                self.sessions.lock().unwrap().remove(&p.session_id);
                Ok(HandlerOutcome::Reply(json!({ "ok": true })))
            }
            "exec" => {
                let id = envelope.id.as_deref().unwrap_or_default();
                self.exec(connection_id, id, body).await?;
                Ok(HandlerOutcome::Streamed)
            }
            "list-sessions" => {
                let sessions: Vec<Value> =
                    self.sessions.lock().unwrap().values().map(|s| s.describe()).collect();
                Ok(HandlerOutcome::Reply(json!({ "sessions": sessions })))
            }
            other => Err(ServiceError::Malformed(format!("unknown terminal op '{other}'")).into()),
        }
    }

    fn deadline(&self, op: &str) -> Duration {
        match op {
            // exec enforces its own 30 s wall clock; leave headroom for the
            // kill escalation before the hub's deadline would fire.
            "exec" => Duration::from_secs(self.config.exec_timeout_secs + 5),
            _ => crate::server::DEFAULT_OP_DEADLINE,
        }
    }

    async fn on_disconnect(&self, connection_id: &str) {
        // Sessions owned by this connection keep running and start
        // buffering; nothing to tear down here.
        let _ = connection_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> (Arc<TerminalService>, Arc<ConnectionRegistry>) {
        let dir = std::env::temp_dir();
        let mut config = DaemonConfig::load(None, None, Some(dir));
        config.shell = "/bin/sh".into();
        let registry = Arc::new(ConnectionRegistry::new());
        (TerminalService::new(Arc::new(config), registry.clone()), registry)
    }

    #[tokio::test]
    async fn create_and_list_and_dispose() {
        let (svc, _reg) = test_service();
        let created = svc.create("c1", json!({ "engineMode": "line" })).await.unwrap();
        let sid = created["sessionId"].as_str().unwrap().to_string();
        assert!(!sid.is_empty());
        assert_eq!(svc.session_count(), 1);

        let session = svc.get(&sid).unwrap();
        assert!(session.is_alive());
        session.dispose().await;
        svc.sessions.lock().unwrap().remove(&sid);
        assert_eq!(svc.session_count(), 0);
    }

    #[tokio::test]
    async fn create_beyond_cap_conflicts() {
        let (svc, _reg) = test_service();
        // Shrink the cap by filling the map with one session and a cap of 1.
        let mut cfg = (*svc.config).clone();
        cfg.max_pty_sessions = 1;
        let svc = TerminalService::new(Arc::new(cfg), svc.registry.clone());
        svc.create("c1", json!({})).await.unwrap();
        let err = svc.create("c1", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("session limit"));
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (svc, _reg) = test_service();
        let err = svc.get("missing").unwrap_err();
        let svc_err = err.downcast_ref::<ServiceError>().unwrap();
        assert_eq!(svc_err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn line_mode_echoes_command_output() {
        let (svc, reg) = test_service();
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        reg.register("c1", "", tx);

        let created = svc.create("c1", json!({ "engineMode": "line" })).await.unwrap();
        let sid = created["sessionId"].as_str().unwrap();

        svc.handle(
            "c1",
            &Envelope {
                kind: "terminal".into(),
                id: Some("r1".into()),
                op: Some("input".into()),
                payload: Some(json!({ "sessionId": sid, "data": "echo hello-from-test\n" })),
                data: None,
                error: None,
                timestamp: 0,
            },
        )
        .await
        .unwrap();

        // Collect frames until the command output shows up.
        let mut all = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(250), rx.recv()).await {
                Ok(Some(frame)) => {
                    let v: Value = serde_json::from_str(&frame).unwrap();
                    if v["type"] == "terminal" {
                        all.push_str(v["data"]["chunk"].as_str().unwrap_or(""));
                    }
                    if all.contains("hello-from-test") {
                        break;
                    }
                }
                _ => {}
            }
        }
        assert!(all.contains("hello-from-test"), "accumulated: {all}");
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn exec_refuses_denied_command_without_frames() {
        let (svc, reg) = test_service();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        reg.register("c1", "", tx);

        let err = svc.exec("c1", "r9", json!({ "command": "rm -rf /" })).await.unwrap_err();
        let kind = err.downcast_ref::<ServiceError>().unwrap().kind();
        assert_eq!(kind, "Refused");

        // No start/data/exit frames were emitted for the refused id.
        let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err(), "no frames expected, got {extra:?}");
    }

    #[tokio::test]
    async fn exec_streams_start_data_exit() {
        let (svc, reg) = test_service();
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        reg.register("c1", "", tx);

        svc.exec("c1", "r2", json!({ "command": "echo exec-ok" })).await.unwrap();

        let mut events = Vec::new();
        let mut output = String::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            let v: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(v["id"], "r2");
            events.push(v["data"]["event"].as_str().unwrap_or("").to_string());
            if let Some(chunk) = v["data"]["chunk"].as_str() {
                output.push_str(chunk);
            }
            if events.last().map(String::as_str) == Some("exit") {
                break;
            }
        }
        assert_eq!(events.first().map(String::as_str), Some("start"));
        assert_eq!(events.last().map(String::as_str), Some("exit"));
        assert!(output.contains("exec-ok"));
    }
}
