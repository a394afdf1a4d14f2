// SPDX-License-Identifier: MIT
//! The ACP bridge: supervises exactly one agent child process and speaks
//! JSON-RPC 2.0 over its stdio.
//!
//! Outbound calls are serialized through the [`JsonRpcClient`]'s stdin
//! queue; one reader task drains stdout through the connect-time framing
//! and dispatches responses to awaiters, notifications to the event bus,
//! and agent-side requests (tool-call permissions) to their resolvers.
//! A "session not found" failure triggers one transparent recovery:
//! `session/new` with the last-known parameters, then a single retry.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::acp::content::{validate_prompt, PromptCapabilities};
use crate::acp::framing::{FrameDecoder, Framing};
use crate::acp::rpc::{Incoming, JsonRpcClient, RpcError};
use crate::acp::store::AcpStore;
use crate::config::DaemonConfig;
use crate::error::ServiceError;
use crate::events::EventBus;
use crate::fs::resolver::PathResolver;

/// Grace between terminate and hard kill at teardown.
const KILL_GRACE_MS: u64 = 500;
/// Inactivity check cadence for in-flight prompts.
const PROMPT_POLL_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// The Claude Code ACP adapter — camelCase param keys.
    Claude,
    /// Anything else — snake_case param keys for session ops.
    Generic,
}

struct AgentHandle {
    client: Arc<JsonRpcClient>,
    child: Arc<Mutex<Option<Child>>>,
    init: Value,
    adapter: Adapter,
    caps: PromptCapabilities,
}

struct PendingPermission {
    rpc_id: Value,
    session_id: String,
}

pub struct AcpBridge {
    config: Arc<DaemonConfig>,
    bus: Arc<EventBus>,
    store: Arc<AcpStore>,
    resolver: PathResolver,
    agent: StdMutex<Option<Arc<AgentHandle>>>,
    current_session: StdMutex<Option<String>>,
    /// Parameters of the most recent `session/new`, replayed on recovery.
    last_new_params: StdMutex<Value>,
    permissions: StdMutex<HashMap<u64, PendingPermission>>,
    next_permission_id: AtomicU64,
    /// When the agent last streamed anything; drives prompt inactivity
    /// cleanup.
    last_update_at: StdMutex<Instant>,
}

impl AcpBridge {
    pub fn new(config: Arc<DaemonConfig>, bus: Arc<EventBus>, store: Arc<AcpStore>) -> Arc<Self> {
        let resolver = PathResolver::new(
            config.workspace_root.clone(),
            config.fs_allow_symlinks,
            config.fs_deny.clone(),
        );
        Arc::new(Self {
            config,
            bus,
            store,
            resolver,
            agent: StdMutex::new(None),
            current_session: StdMutex::new(None),
            last_new_params: StdMutex::new(json!({})),
            permissions: StdMutex::new(HashMap::new()),
            next_permission_id: AtomicU64::new(1),
            last_update_at: StdMutex::new(Instant::now()),
        })
    }

    pub fn store(&self) -> &Arc<AcpStore> {
        &self.store
    }

    pub fn connect_timeout_ms(&self) -> u64 {
        self.config.acp_connect_timeout_ms
    }

    fn handle(&self) -> Result<Arc<AgentHandle>> {
        self.agent
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ServiceError::Unavailable("agent not connected".into()).into())
    }

    pub fn is_connected(&self) -> bool {
        self.agent.lock().unwrap().is_some()
    }

    fn touch_activity(&self) {
        *self.last_update_at.lock().unwrap() = Instant::now();
    }

    // ── connect / disconnect ─────────────────────────────────────────────────

    /// Spawn the agent and run `initialize`. A live agent is torn down
    /// first — at most one child exists at a time.
    pub async fn connect(self: &Arc<Self>, payload: Value) -> Result<Value> {
        let agent_cmd = payload
            .get("agentCmd")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::Malformed("connect requires agentCmd".into()))?;
        let mut parts = agent_cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ServiceError::Malformed("agentCmd is empty".into()))?
            .to_string();
        let args: Vec<String> = parts.map(str::to_string).collect();

        self.teardown().await;

        let framing = Framing::detect(&program, &args);
        let adapter =
            if framing == Framing::Ndjson { Adapter::Claude } else { Adapter::Generic };

        let cwd = payload
            .get("cwd")
            .and_then(Value::as_str)
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| self.config.workspace_root.clone());

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = payload.get("env").and_then(Value::as_object) {
            for (k, v) in env {
                if let Some(v) = v.as_str() {
                    cmd.env(k, v);
                }
            }
        }
        if let Some(proxy) = payload.get("proxy").and_then(Value::as_str) {
            cmd.env("HTTPS_PROXY", proxy).env("HTTP_PROXY", proxy);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ServiceError::Upstream(format!("failed to spawn agent `{program}`: {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServiceError::Upstream("agent stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServiceError::Upstream("agent stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ServiceError::Upstream("agent stderr unavailable".into()))?;

        let client = Arc::new(JsonRpcClient::new(framing, stdin));
        let child = Arc::new(Mutex::new(Some(child)));

        // Reader tasks outlive this call; they end when the child does.
        {
            let bridge = self.clone();
            let client = client.clone();
            let child = child.clone();
            tokio::spawn(async move { bridge.read_stdout(stdout, client, child, framing).await });
        }
        {
            let bus = self.bus.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "agent_stderr", "{}", line);
                    bus.publish("agent_stderr", json!({ "line": line }));
                }
            });
        }

        // JSON-RPC initialize, bounded by the connect timeout.
        let started = Instant::now();
        let init_params = json!({
            "protocolVersion": 1,
            "clientInfo": { "name": "otgd", "version": env!("CARGO_PKG_VERSION") },
            "clientCapabilities": {
                "fs": { "readTextFile": false, "writeTextFile": false },
                "terminal": true,
            },
        });
        let init = tokio::time::timeout(
            Duration::from_millis(self.config.acp_connect_timeout_ms),
            client.request("initialize", init_params),
        )
        .await
        .map_err(|_| {
            ServiceError::Timeout(format!(
                "initialize did not complete within {}ms",
                self.config.acp_connect_timeout_ms
            ))
        })?
        .map_err(|e| self.map_agent_error(e, &Value::Null))?;

        let elapsed = started.elapsed().as_millis() as u64;
        if elapsed > self.config.warn_slow_connect_ms {
            warn!(elapsed_ms = elapsed, agent = %program, "slow agent initialize");
        }

        let caps = PromptCapabilities::from_init(&init);
        let handle =
            Arc::new(AgentHandle { client, child, init: init.clone(), adapter, caps });
        *self.agent.lock().unwrap() = Some(handle);

        info!(agent = %program, ?framing, "agent connected");
        self.bus.publish("agent_initialized", json!({ "init": init }));
        Ok(json!({ "ok": true, "init": init }))
    }

    /// Terminate the agent (if any) and fail everything in flight.
    pub async fn teardown(&self) {
        let handle = self.agent.lock().unwrap().take();
        let Some(handle) = handle else { return };

        handle.client.fail_all("agent disconnected");
        let mut guard = handle.child.lock().await;
        if let Some(child) = guard.as_mut() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // SAFETY: our own child's pid.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            tokio::time::sleep(Duration::from_millis(KILL_GRACE_MS)).await;
            let _ = child.kill().await;
        }
        if let Some(mut child) = guard.take() {
            let _ = child.wait().await;
        }
        // Unresolved permission requests die with the agent.
        self.permissions.lock().unwrap().clear();
    }

    // ── Inbound routing ──────────────────────────────────────────────────────

    async fn read_stdout(
        self: Arc<Self>,
        mut stdout: tokio::process::ChildStdout,
        client: Arc<JsonRpcClient>,
        child: Arc<Mutex<Option<Child>>>,
        framing: Framing,
    ) {
        let mut decoder = FrameDecoder::new(framing);
        let mut buf = [0u8; 8192];
        'read: loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = decoder.push(&buf[..n]) {
                        warn!(err = %e, "framing error — closing agent");
                        break 'read;
                    }
                    loop {
                        match decoder.next() {
                            Ok(Some(message)) => {
                                if let Some(incoming) = client.handle_message(message) {
                                    self.route_incoming(incoming, &client);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(err = %e, "framing error — closing agent");
                                break 'read;
                            }
                        }
                    }
                }
            }
        }
        self.on_child_gone(client, child).await;
    }

    async fn on_child_gone(&self, client: Arc<JsonRpcClient>, child: Arc<Mutex<Option<Child>>>) {
        let status = {
            let mut guard = child.lock().await;
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
                child.wait().await.ok()
            } else {
                None
            }
        };

        let code = status.as_ref().and_then(|s| s.code());
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.as_ref().and_then(|s| s.signal())
        };
        #[cfg(not(unix))]
        let signal: Option<i32> = None;

        client.fail_all("agent exited");

        // Only clear the bridge state when it still refers to this child.
        {
            let mut agent = self.agent.lock().unwrap();
            if let Some(handle) = agent.as_ref() {
                if Arc::ptr_eq(&handle.client, &client) {
                    *agent = None;
                }
            }
        }
        self.permissions.lock().unwrap().clear();

        info!(?code, ?signal, "agent exited");
        self.bus.publish("agent_exit", json!({ "code": code, "signal": signal }));
    }

    fn route_incoming(&self, incoming: Incoming, client: &Arc<JsonRpcClient>) {
        match incoming {
            Incoming::Request { id, method, params } => match method.as_str() {
                "session/request_permission" => {
                    self.handle_permission_request(id, params, client)
                }
                other => {
                    debug!(method = other, "unsupported agent request");
                    let _ = client.respond_error(id, -32601, "method not supported");
                }
            },
            Incoming::Notification { method, params } => match method.as_str() {
                "session/update" => self.handle_session_update(params),
                "terminal/output" => {
                    self.bus.publish(
                        "terminal_output",
                        json!({
                            "terminalId": str_key(&params, "terminalId", "terminal_id"),
                            "chunk": params.get("chunk").or(params.get("data")).cloned(),
                            "stream": params.get("stream").cloned().unwrap_or(json!("stdout")),
                        }),
                    );
                }
                "terminal/exit" => {
                    self.bus.publish(
                        "terminal_exit",
                        json!({
                            "terminalId": str_key(&params, "terminalId", "terminal_id"),
                            "exitStatus": params.get("exitStatus").or(params.get("exit_status")).cloned(),
                        }),
                    );
                }
                other => debug!(method = other, "unhandled agent notification"),
            },
        }
    }

    /// Normalize `{sessionId, update}` and bare-update shapes into the
    /// former, persist, and broadcast.
    fn handle_session_update(&self, params: Value) {
        let (session_id, update) = if params.get("update").is_some() {
            let sid = str_key(&params, "sessionId", "session_id");
            (sid, params["update"].clone())
        } else {
            let sid = str_key(&params, "sessionId", "session_id");
            (sid, params)
        };
        let session_id = if session_id.is_empty() {
            self.current_session.lock().unwrap().clone().unwrap_or_default()
        } else {
            session_id
        };

        self.touch_activity();
        self.store.append_thread(&session_id, &update);
        self.bus
            .publish("session_update", json!({ "sessionId": session_id, "update": update }));
    }

    // ── Permissions ──────────────────────────────────────────────────────────

    fn handle_permission_request(
        &self,
        rpc_id: Value,
        params: Value,
        client: &Arc<JsonRpcClient>,
    ) {
        let session_id = {
            let sid = str_key(&params, "sessionId", "session_id");
            if sid.is_empty() {
                self.current_session.lock().unwrap().clone().unwrap_or_default()
            } else {
                sid
            }
        };

        // At most one unresolved request per session: a newer one cancels
        // its predecessor.
        let superseded: Vec<(u64, PendingPermission)> = {
            let mut pending = self.permissions.lock().unwrap();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id).map(|p| (id, p))).collect()
        };
        for (id, stale) in superseded {
            debug!(request_id = id, "permission request superseded — cancelling");
            let _ = client
                .respond(stale.rpc_id, json!({ "outcome": { "outcome": "cancelled" } }));
        }

        let options = normalize_permission_options(&params);
        let request_id = self.next_permission_id.fetch_add(1, Ordering::Relaxed);
        self.permissions
            .lock()
            .unwrap()
            .insert(request_id, PendingPermission { rpc_id, session_id: session_id.clone() });

        let mut request = params;
        if let Some(obj) = request.as_object_mut() {
            obj.insert("options".into(), json!(options));
            obj.insert("sessionId".into(), json!(session_id));
        }
        self.bus.publish(
            "permission_request",
            json!({ "requestId": request_id, "request": request }),
        );
    }

    /// Resolve an in-flight tool-call permission from the client.
    pub fn resolve_permission(&self, payload: Value) -> Result<Value> {
        let request_id = payload
            .get("requestId")
            .and_then(Value::as_u64)
            .ok_or_else(|| ServiceError::Malformed("permission requires requestId".into()))?;
        let outcome = payload.get("outcome").and_then(Value::as_str).unwrap_or("");

        let pending = self
            .permissions
            .lock()
            .unwrap()
            .remove(&request_id)
            .ok_or_else(|| ServiceError::NotFound(format!("permission {request_id}")))?;

        let handle = self.handle()?;
        let answer = match outcome {
            "selected" => {
                let option_id = payload
                    .get("optionId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ServiceError::Malformed("selected outcome requires optionId".into())
                    })?;
                json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
            }
            "cancelled" => json!({ "outcome": { "outcome": "cancelled" } }),
            other => {
                // Put it back — the client may retry with a valid outcome.
                self.permissions.lock().unwrap().insert(request_id, pending);
                return Err(
                    ServiceError::Malformed(format!("unknown outcome '{other}'")).into()
                );
            }
        };
        handle.client.respond(pending.rpc_id, answer)?;
        Ok(json!({ "ok": true }))
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub async fn session_new(&self, payload: Value) -> Result<Value> {
        let handle = self.handle()?;
        let params = json!({
            "cwd": self.config.workspace_root.display().to_string(),
            "mcpServers": payload.get("mcpServers").cloned().unwrap_or(json!([])),
        });
        *self.last_new_params.lock().unwrap() = params.clone();

        let result = handle
            .client
            .request("session/new", params)
            .await
            .map_err(|e| self.map_agent_error(e, &handle.init))?;

        let session_id = str_key(&result, "sessionId", "session_id");
        if session_id.is_empty() {
            return Err(
                ServiceError::Upstream("agent returned no session id".into()).into()
            );
        }
        self.store.record_session(&session_id);
        *self.current_session.lock().unwrap() = Some(session_id.clone());

        Ok(json!({
            "sessionId": session_id,
            "modes": result.get("modes").cloned(),
            "models": result.get("models").cloned(),
        }))
    }

    pub fn session_select(&self, payload: Value) -> Result<Value> {
        let session_id = required_session_id(&payload)?;
        if !self.store.has_session(&session_id) {
            return Err(ServiceError::NotFound(format!("session {session_id}")).into());
        }
        *self.current_session.lock().unwrap() = Some(session_id.clone());
        self.store.set_last_session(&session_id);
        self.store.touch_session(&session_id);
        Ok(json!({ "ok": true, "sessionId": session_id }))
    }

    pub fn session_delete(&self, payload: Value) -> Result<Value> {
        let session_id = required_session_id(&payload)?;
        if !self.store.has_session(&session_id) {
            return Err(ServiceError::NotFound(format!("session {session_id}")).into());
        }
        self.store.remove_session(&session_id);
        let mut current = self.current_session.lock().unwrap();
        if current.as_deref() == Some(session_id.as_str()) {
            *current = None;
        }
        Ok(json!({ "ok": true }))
    }

    pub async fn set_mode(&self, payload: Value) -> Result<Value> {
        let handle = self.handle()?;
        let session_id = self.effective_session(&payload)?;
        let mode_id = str_key(&payload, "modeId", "mode_id");
        if mode_id.is_empty() {
            return Err(ServiceError::Malformed("setMode requires modeId".into()).into());
        }

        // Claude expects camelCase keys here; generic agents snake_case.
        let build = |sid: &str| match handle.adapter {
            Adapter::Claude => json!({ "sessionId": sid, "modeId": mode_id }),
            Adapter::Generic => json!({ "session_id": sid, "mode_id": mode_id }),
        };
        self.call_with_recovery(&handle, "session/set_mode", &session_id, build).await?;
        self.store.set_mode(&session_id, &mode_id);
        Ok(json!({ "ok": true }))
    }

    pub async fn models_list(&self, payload: Value) -> Result<Value> {
        let handle = self.handle()?;
        if !self.supports_models(&handle) {
            return Ok(json!({ "models": [] }));
        }
        let session_id = self.effective_session(&payload)?;
        let build = |sid: &str| match handle.adapter {
            Adapter::Claude => json!({ "sessionId": sid }),
            Adapter::Generic => json!({ "session_id": sid }),
        };
        let result =
            self.call_with_recovery(&handle, "session/list_models", &session_id, build).await?;
        Ok(json!({ "models": result.get("models").cloned().unwrap_or(json!([])) }))
    }

    pub async fn model_select(&self, payload: Value) -> Result<Value> {
        let handle = self.handle()?;
        if !self.supports_models(&handle) {
            return Err(ServiceError::Refused(
                "agent does not support model selection".into(),
            )
            .into());
        }
        let session_id = self.effective_session(&payload)?;
        let model_id = str_key(&payload, "modelId", "model_id");
        if model_id.is_empty() {
            return Err(ServiceError::Malformed("select requires modelId".into()).into());
        }
        let build = |sid: &str| match handle.adapter {
            Adapter::Claude => json!({ "sessionId": sid, "modelId": model_id }),
            Adapter::Generic => json!({ "session_id": sid, "model_id": model_id }),
        };
        self.call_with_recovery(&handle, "session/select_model", &session_id, build).await?;
        Ok(json!({ "ok": true }))
    }

    fn supports_models(&self, handle: &AgentHandle) -> bool {
        handle.adapter == Adapter::Claude
            || handle.init["agentCapabilities"]["models"].as_bool().unwrap_or(false)
    }

    // ── Prompting ────────────────────────────────────────────────────────────

    /// Validate and hand a prompt to the agent. The WS response is the ack;
    /// updates stream as events and the final result arrives as `acp_final`.
    pub fn prompt(self: &Arc<Self>, payload: Value) -> Result<Value> {
        let handle = self.handle()?;
        let session_id = self.effective_session(&payload)?;
        let blocks = validate_prompt(
            payload.get("prompt").unwrap_or(&Value::Null),
            handle.caps,
        )?;

        self.store.touch_session(&session_id);
        self.touch_activity();

        let bridge = self.clone();
        let sid = session_id.clone();
        tokio::spawn(async move { bridge.run_prompt(handle, sid, blocks).await });

        Ok(json!({ "ok": true, "sessionId": session_id }))
    }

    async fn run_prompt(
        &self,
        handle: Arc<AgentHandle>,
        session_id: String,
        blocks: Vec<crate::acp::content::ContentBlock>,
    ) {
        let prompt = serde_json::to_value(&blocks).unwrap_or(json!([]));
        let build = |sid: &str| json!({ "sessionId": sid, "prompt": prompt });

        let timeout = Duration::from_millis(self.config.acp_prompt_timeout_ms);
        let call = self.call_with_recovery(&handle, "session/prompt", &session_id, build);
        tokio::pin!(call);

        // The final response may lag far behind the streamed updates; give
        // up only after the session has been silent for the full window.
        let result = loop {
            tokio::select! {
                res = &mut call => break res,
                _ = tokio::time::sleep(Duration::from_secs(PROMPT_POLL_SECS)) => {
                    let idle = self.last_update_at.lock().unwrap().elapsed();
                    if idle >= timeout {
                        break Err(ServiceError::Timeout(format!(
                            "prompt silent for {}ms", timeout.as_millis()
                        ))
                        .into());
                    }
                }
            }
        };

        match result {
            Ok(value) => {
                self.bus.publish(
                    "acp_final",
                    json!({ "sessionId": session_id, "result": value }),
                );
            }
            Err(e) => {
                let message = crate::error::classify(&e);
                warn!(session = %session_id, err = %message, "prompt failed");
                self.bus.publish(
                    "acp_final",
                    json!({ "sessionId": session_id, "error": message }),
                );
            }
        }
    }

    pub fn cancel(&self, payload: Value) -> Result<Value> {
        let handle = self.handle()?;
        let session_id = self.effective_session(&payload)?;
        let params = match handle.adapter {
            Adapter::Claude => json!({ "sessionId": session_id }),
            Adapter::Generic => json!({ "session_id": session_id }),
        };
        handle.client.notify("session/cancel", params)?;
        Ok(json!({ "ok": true }))
    }

    // ── Auth ─────────────────────────────────────────────────────────────────

    pub async fn authenticate(&self, payload: Value) -> Result<Value> {
        let handle = self.handle()?;
        let method_id = str_key(&payload, "methodId", "method_id");
        if method_id.is_empty() {
            return Err(
                ServiceError::Malformed("authenticate requires methodId".into()).into()
            );
        }
        handle
            .client
            .request("authenticate", json!({ "methodId": method_id }))
            .await
            .map_err(|e| self.map_agent_error(e, &handle.init))?;
        Ok(json!({ "ok": true }))
    }

    pub fn auth_methods(&self) -> Result<Value> {
        let handle = self.handle()?;
        Ok(json!({ "methods": handle.init.get("authMethods").cloned().unwrap_or(json!([])) }))
    }

    pub fn init_info(&self) -> Result<Value> {
        let handle = self.handle()?;
        Ok(handle.init.clone())
    }

    // ── diff.apply ───────────────────────────────────────────────────────────

    /// Replace a workspace file atomically (write temp + rename).
    pub async fn diff_apply(&self, payload: Value) -> Result<Value> {
        let path = payload
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::Malformed("diff.apply requires path".into()))?;
        let new_text = payload
            .get("newText")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::Malformed("diff.apply requires newText".into()))?;

        let target = self.resolver.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = target.with_extension("otgd.tmp");
        tokio::fs::write(&tmp, new_text).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(json!({ "ok": true }))
    }

    // ── Agent-side terminal passthrough ──────────────────────────────────────

    pub async fn terminal_passthrough(&self, op: &str, payload: Value) -> Result<Value> {
        let handle = self.handle()?;
        let method = match op {
            "terminal.create" => "terminal/create",
            "terminal.output" => "terminal/output",
            "terminal.kill" => "terminal/kill",
            "terminal.release" => "terminal/release",
            "terminal.waitForExit" => "terminal/wait_for_exit",
            other => {
                return Err(
                    ServiceError::Malformed(format!("unknown terminal op '{other}'")).into()
                )
            }
        };
        handle
            .client
            .request(method, payload)
            .await
            .map_err(|e| self.map_agent_error(e, &handle.init))
    }

    // ── Recovery ─────────────────────────────────────────────────────────────

    /// Issue an agent call; on "session not found", recover once (fresh
    /// `session/new` with the last-known params) and retry exactly once.
    async fn call_with_recovery<F>(
        &self,
        handle: &Arc<AgentHandle>,
        method: &str,
        session_id: &str,
        build: F,
    ) -> Result<Value>
    where
        F: Fn(&str) -> Value,
    {
        match handle.client.request(method, build(session_id)).await {
            Err(e) if is_session_not_found(&e) => {
                info!(session = session_id, method, "session not found — recovering");
                let new_id = self.recover_session(handle, session_id).await?;
                handle
                    .client
                    .request(method, build(&new_id))
                    .await
                    .map_err(|e| self.map_agent_error(e, &handle.init))
            }
            Err(e) => Err(self.map_agent_error(e, &handle.init)),
            Ok(v) => Ok(v),
        }
    }

    async fn recover_session(&self, handle: &Arc<AgentHandle>, old_id: &str) -> Result<String> {
        let params = self.last_new_params.lock().unwrap().clone();
        let result = handle
            .client
            .request("session/new", params)
            .await
            .map_err(|e| self.map_agent_error(e, &handle.init))?;

        let new_id = str_key(&result, "sessionId", "session_id");
        if new_id.is_empty() {
            return Err(ServiceError::NotFound(format!("session {old_id}")).into());
        }

        self.store.rename_session(old_id, &new_id);
        {
            let mut current = self.current_session.lock().unwrap();
            if current.as_deref() == Some(old_id) || current.is_none() {
                *current = Some(new_id.clone());
            }
        }
        self.touch_activity();
        self.bus.publish(
            "session_recovered",
            json!({ "oldSessionId": old_id, "newSessionId": new_id }),
        );
        Ok(new_id)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// The session an op targets: explicit, else current, else last used.
    fn effective_session(&self, payload: &Value) -> Result<String> {
        let explicit = str_key(payload, "sessionId", "session_id");
        if !explicit.is_empty() {
            return Ok(explicit);
        }
        if let Some(current) = self.current_session.lock().unwrap().clone() {
            return Ok(current);
        }
        self.store
            .last_session()
            .ok_or_else(|| ServiceError::NotFound("no active session".into()).into())
    }

    /// Translate agent-side failures into wire error kinds.
    fn map_agent_error(&self, err: anyhow::Error, init: &Value) -> anyhow::Error {
        let Some(rpc) = err.downcast_ref::<RpcError>() else { return err };
        if is_auth_required_code(rpc) {
            return ServiceError::AuthRequired {
                methods: init.get("authMethods").cloned().unwrap_or(json!([])),
            }
            .into();
        }
        if is_session_not_found(&err) {
            return ServiceError::NotFound("session not found".into()).into();
        }
        ServiceError::Upstream(format!("{}: {}", rpc.code, rpc.message)).into()
    }
}

fn is_auth_required_code(rpc: &RpcError) -> bool {
    rpc.code == 401
        || (rpc.code == -32000 && rpc.message.to_lowercase().contains("auth"))
}

fn is_session_not_found(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<RpcError>() {
        Some(rpc) => {
            rpc.code == -32001 || rpc.message.to_lowercase().contains("session not found")
        }
        None => false,
    }
}

/// Read a string under either a camelCase or snake_case key.
fn str_key(value: &Value, camel: &str, snake: &str) -> String {
    value
        .get(camel)
        .or_else(|| value.get(snake))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn required_session_id(payload: &Value) -> Result<String> {
    let sid = str_key(payload, "sessionId", "session_id");
    if sid.is_empty() {
        return Err(ServiceError::Malformed("sessionId is required".into()).into());
    }
    Ok(sid)
}

/// Normalize agent permission options to `{id, name, kind}`.
fn normalize_permission_options(params: &Value) -> Vec<Value> {
    params
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .map(|o| {
                    let id = o
                        .get("optionId")
                        .or_else(|| o.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let name = o
                        .get("name")
                        .or_else(|| o.get("label"))
                        .and_then(Value::as_str)
                        .unwrap_or(id);
                    let kind = match o.get("kind").and_then(Value::as_str) {
                        Some(k @ ("allow_once" | "allow_always" | "reject_once" | "reject_always")) => k,
                        _ => "allow_once",
                    };
                    json!({ "id": id, "name": name, "kind": kind })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_options_normalize_both_shapes() {
        let params = json!({
            "options": [
                { "optionId": "a", "name": "Allow", "kind": "allow_once" },
                { "id": "b", "label": "Reject", "kind": "reject_once" },
                { "optionId": "c", "kind": "banana" },
            ]
        });
        let options = normalize_permission_options(&params);
        assert_eq!(options[0], json!({ "id": "a", "name": "Allow", "kind": "allow_once" }));
        assert_eq!(options[1], json!({ "id": "b", "name": "Reject", "kind": "reject_once" }));
        assert_eq!(options[2]["kind"], "allow_once");
        assert_eq!(options[2]["name"], "c");
    }

    #[test]
    fn session_not_found_detection() {
        let rpc: anyhow::Error =
            RpcError { code: -32001, message: "gone".into(), data: None }.into();
        assert!(is_session_not_found(&rpc));
        let rpc: anyhow::Error =
            RpcError { code: -1, message: "Session NOT FOUND: x".into(), data: None }.into();
        assert!(is_session_not_found(&rpc));
        let other = anyhow::anyhow!("unrelated");
        assert!(!is_session_not_found(&other));
    }

    #[test]
    fn auth_detection() {
        assert!(is_auth_required_code(&RpcError {
            code: 401,
            message: "".into(),
            data: None
        }));
        assert!(is_auth_required_code(&RpcError {
            code: -32000,
            message: "Authentication required".into(),
            data: None
        }));
        assert!(!is_auth_required_code(&RpcError {
            code: -32000,
            message: "other".into(),
            data: None
        }));
    }

    #[test]
    fn str_key_prefers_camel() {
        let v = json!({ "sessionId": "a", "session_id": "b" });
        assert_eq!(str_key(&v, "sessionId", "session_id"), "a");
        let v = json!({ "session_id": "b" });
        assert_eq!(str_key(&v, "sessionId", "session_id"), "b");
    }
}
