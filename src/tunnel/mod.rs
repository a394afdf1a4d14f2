// SPDX-License-Identifier: MIT
//! Tunnel supervisor: spawn and manage `cloudflared` children that expose
//! a local port at a public HTTPS URL.
//!
//! The public URL is extracted from the child's stderr after spawn; a
//! tunnel is `running` only once a URL has been positively captured.

pub mod install;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::ServiceError;
use crate::events::EventBus;
use crate::server::envelope::Envelope;
use crate::server::{HandlerOutcome, ServiceHandler};

/// How long the child may run without yielding a URL.
const URL_EXTRACTION_TIMEOUT_SECS: u64 = 60;
/// Stop escalation: terminate, wait, hard-kill.
const STOP_GRACE_SECS: u64 = 5;

static QUICK_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://[A-Za-z0-9][A-Za-z0-9-]*\.trycloudflare\.com").unwrap());
static ANY_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://[A-Za-z0-9][A-Za-z0-9.-]*\.[A-Za-z]{2,}").unwrap());

/// Hosts cloudflared mentions in banners and hints; never tunnel URLs.
const NOISE_HOSTS: &[&str] = &[
    "developers.cloudflare.com",
    "www.cloudflare.com",
    "dash.cloudflare.com",
    "github.com",
    "one.dash.cloudflare.com",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Quick,
    Named,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

pub struct Tunnel {
    pub id: String,
    pub kind: TunnelKind,
    pub local_port: u16,
    pub name: Option<String>,
    state: StdMutex<TunnelState>,
    url: StdMutex<Option<String>>,
    child: Arc<Mutex<Option<Child>>>,
}

impl Tunnel {
    pub fn state(&self) -> TunnelState {
        *self.state.lock().unwrap()
    }

    pub fn url(&self) -> Option<String> {
        self.url.lock().unwrap().clone()
    }

    fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.kind,
            "localPort": self.local_port,
            "name": self.name,
            "state": self.state(),
            "url": self.url(),
        })
    }

    fn set_state(&self, state: TunnelState, bus: &EventBus) {
        *self.state.lock().unwrap() = state;
        bus.publish("tunnel_status", self.describe());
    }

    /// Terminate: graceful signal, bounded wait, then hard kill.
    async fn stop(&self, bus: &EventBus) {
        self.set_state(TunnelState::Stopping, bus);
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // SAFETY: our own child's pid.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            let graceful =
                tokio::time::timeout(Duration::from_secs(STOP_GRACE_SECS), child.wait()).await;
            if graceful.is_err() {
                let _ = child.kill().await;
            }
        }
        if let Some(mut child) = guard.take() {
            let _ = child.wait().await;
        }
        drop(guard);
        self.set_state(TunnelState::Stopped, bus);
    }
}

pub struct TunnelService {
    config: Arc<DaemonConfig>,
    bus: Arc<EventBus>,
    tunnels: StdMutex<HashMap<String, Arc<Tunnel>>>,
    /// Resolved binary path, cached after the first successful bootstrap.
    binary: Mutex<Option<PathBuf>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    #[serde(rename = "type")]
    kind: TunnelKind,
    local_port: u16,
    name: Option<String>,
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopParams {
    id: String,
}

impl TunnelService {
    pub fn new(config: Arc<DaemonConfig>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            tunnels: StdMutex::new(HashMap::new()),
            binary: Mutex::new(None),
        })
    }

    async fn binary_path(&self) -> Result<PathBuf> {
        let mut cached = self.binary.lock().await;
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }
        let path = install::ensure_binary(&self.config.data_dir).await?;
        *cached = Some(path.clone());
        Ok(path)
    }

    async fn create(&self, body: Value) -> Result<Value> {
        let p: CreateParams =
            serde_json::from_value(body).map_err(|e| ServiceError::Malformed(e.to_string()))?;

        let name = p.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
        if p.kind == TunnelKind::Named && name.is_none() {
            // `tunnel run` with no name would run some default tunnel;
            // refuse instead of guessing.
            return Err(ServiceError::Malformed("named tunnel requires a name".into()).into());
        }

        let binary = self.binary_path().await?;

        let mut cmd = Command::new(&binary);
        match p.kind {
            TunnelKind::Quick => {
                cmd.args(["--no-autoupdate", "tunnel", "--url"])
                    .arg(format!("http://localhost:{}", p.local_port));
            }
            TunnelKind::Named => {
                cmd.args(["tunnel", "run"]);
                if let Some(token) = p.token.as_deref() {
                    cmd.args(["--token", token]);
                }
                cmd.arg(name.expect("checked above"));
            }
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ServiceError::Upstream(format!("failed to spawn tunnel: {e}")))?;
        let stderr = child.stderr.take();

        let tunnel = Arc::new(Tunnel {
            id: uuid::Uuid::new_v4().to_string(),
            kind: p.kind,
            local_port: p.local_port,
            name: name.map(str::to_string),
            state: StdMutex::new(TunnelState::Starting),
            url: StdMutex::new(None),
            child: Arc::new(Mutex::new(Some(child))),
        });
        self.tunnels.lock().unwrap().insert(tunnel.id.clone(), tunnel.clone());
        self.bus.publish("tunnel_status", tunnel.describe());

        // URL extraction off the child's stderr.
        {
            let bus = self.bus.clone();
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let Some(stderr) = stderr else { return };
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "tunnel_stderr", tunnel = %tunnel.id, "{}", line);
                    if tunnel.state() == TunnelState::Starting {
                        if let Some(url) = extract_url(&line) {
                            info!(tunnel = %tunnel.id, url = %url, "tunnel url extracted");
                            *tunnel.url.lock().unwrap() = Some(url);
                            tunnel.set_state(TunnelState::Running, &bus);
                        }
                    }
                }
            });
        }

        // Give up if no URL surfaces in time.
        {
            let bus = self.bus.clone();
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(URL_EXTRACTION_TIMEOUT_SECS)).await;
                if tunnel.state() == TunnelState::Starting {
                    warn!(tunnel = %tunnel.id, "no url within timeout — stopping tunnel");
                    tunnel.stop(&bus).await;
                    tunnel.set_state(TunnelState::Error, &bus);
                }
            });
        }

        Ok(json!({ "id": tunnel.id, "state": tunnel.state() }))
    }

    async fn stop(&self, body: Value) -> Result<Value> {
        let p: StopParams =
            serde_json::from_value(body).map_err(|e| ServiceError::Malformed(e.to_string()))?;
        let tunnel = self
            .tunnels
            .lock()
            .unwrap()
            .get(&p.id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("tunnel {}", p.id)))?;
        tunnel.stop(&self.bus).await;
        self.tunnels.lock().unwrap().remove(&p.id);
        Ok(json!({ "ok": true }))
    }

    pub async fn stop_all(&self) {
        let all: Vec<Arc<Tunnel>> =
            self.tunnels.lock().unwrap().drain().map(|(_, t)| t).collect();
        for tunnel in all {
            tunnel.stop(&self.bus).await;
        }
    }

    /// Alias used by daemon shutdown.
    pub async fn shutdown(&self) {
        self.stop_all().await;
    }

    fn list(&self) -> Value {
        let tunnels: Vec<Value> =
            self.tunnels.lock().unwrap().values().map(|t| t.describe()).collect();
        json!({ "tunnels": tunnels })
    }
}

/// Pull a tunnel URL out of one log line, ignoring banner noise.
fn extract_url(line: &str) -> Option<String> {
    if let Some(m) = QUICK_URL.find(line) {
        return Some(m.as_str().to_string());
    }
    let m = ANY_URL.find(line)?;
    let url = m.as_str();
    let host = url.strip_prefix("https://").unwrap_or(url);
    if NOISE_HOSTS.iter().any(|noise| host.starts_with(noise)) {
        return None;
    }
    // Generic hosts only count when the line is clearly announcing the
    // tunnel, not linking documentation.
    let lower = line.to_ascii_lowercase();
    if lower.contains("route") || lower.contains("registered") || lower.contains("hostname") {
        Some(url.to_string())
    } else {
        None
    }
}

#[async_trait]
impl ServiceHandler for TunnelService {
    async fn handle(&self, _connection_id: &str, envelope: &Envelope) -> Result<HandlerOutcome> {
        let body = envelope.body();
        let result = match envelope.op_name()? {
            "list" | "status" => self.list(),
            "create" => self.create(body).await?,
            "stop" => self.stop(body).await?,
            "stopAll" => {
                self.stop_all().await;
                json!({ "ok": true })
            }
            "install" => {
                let path = self.binary_path().await?;
                json!({ "ok": true, "path": path.display().to_string() })
            }
            other => {
                return Err(
                    ServiceError::Malformed(format!("unknown tunnels op '{other}'")).into()
                )
            }
        };
        Ok(HandlerOutcome::Reply(result))
    }

    fn deadline(&self, op: &str) -> Duration {
        match op {
            // May include a full binary download.
            "install" | "create" => Duration::from_secs(180),
            "stop" | "stopAll" => Duration::from_secs(STOP_GRACE_SECS * 2 + 5),
            _ => crate::server::DEFAULT_OP_DEADLINE,
        }
    }
}
