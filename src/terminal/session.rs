// SPDX-License-Identifier: MIT
//! One PTY session: a line- or pipe-mode shell bound to a working
//! directory, an owning connection, and a bounded output ring buffer.
//!
//! Output goes to the owning connection while one is attached; otherwise
//! chunks accumulate in the ring buffer and are flushed, in order, to the
//! next connection that claims the session.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::fs::resolver::normalize_path;
use crate::server::envelope::Envelope;
use crate::server::registry::ConnectionRegistry;
use crate::terminal::redact::redact;
use crate::terminal::safety;

/// Ring buffer caps: whichever limit is hit first evicts the oldest chunk.
const MAX_BUFFERED_CHUNKS: usize = 1000;
const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// Grace between the interrupt signal and the hard kill.
pub const KILL_GRACE_MS: u64 = 500;

const ANSI_CLEAR: &str = "\x1b[2J\x1b[H";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Each submitted line spawns its own shell command; builtins are
    /// intercepted in-process.
    Line,
    /// One long-lived shell child; input bytes are piped through.
    Pipe,
}

/// The slice of daemon config the engine needs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub shell: String,
    pub allowlist: Vec<String>,
    pub allow_unsafe: bool,
    pub env_deny: Vec<String>,
    pub inject_ai_creds: bool,
    pub render_prompt: bool,
}

#[derive(Debug)]
struct Chunk {
    at: i64,
    data: String,
}

#[derive(Default)]
struct RingBuffer {
    chunks: VecDeque<Chunk>,
    bytes: usize,
}

impl RingBuffer {
    fn push(&mut self, data: String) {
        self.bytes += data.len();
        self.chunks.push_back(Chunk { at: Utc::now().timestamp_millis(), data });
        while self.chunks.len() > MAX_BUFFERED_CHUNKS || self.bytes > MAX_BUFFERED_BYTES {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.data.len();
            } else {
                break;
            }
        }
    }

    fn drain(&mut self) -> VecDeque<Chunk> {
        self.bytes = 0;
        std::mem::take(&mut self.chunks)
    }

    fn requeue_front(&mut self, mut chunks: VecDeque<Chunk>) {
        while let Some(c) = chunks.pop_back() {
            self.bytes += c.data.len();
            self.chunks.push_front(c);
        }
    }
}

pub struct PtySession {
    pub id: String,
    pub persistent: bool,
    pub mode: EngineMode,
    pub created_at: chrono::DateTime<Utc>,
    last_activity: AtomicI64,
    alive: AtomicBool,
    owner: StdMutex<Option<String>>,
    cwd: StdMutex<PathBuf>,
    dims: StdMutex<(u16, u16)>,
    buffer: StdMutex<RingBuffer>,
    /// Line-mode input accumulator (bytes up to the next terminator).
    line_acc: StdMutex<String>,
    /// Feeds completed lines to the session worker; dropped on dispose.
    line_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    /// Pipe-mode shell stdin.
    pipe_stdin: Mutex<Option<tokio::process::ChildStdin>>,
    /// The live child: pipe shell, or the line-mode command in flight.
    current_child: Arc<Mutex<Option<Child>>>,
    registry: Arc<ConnectionRegistry>,
    cfg: Arc<SessionConfig>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("persistent", &self.persistent)
            .field("mode", &self.mode)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl PtySession {
    pub fn new(
        id: String,
        mode: EngineMode,
        persistent: bool,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
        owner: String,
        registry: Arc<ConnectionRegistry>,
        cfg: Arc<SessionConfig>,
    ) -> anyhow::Result<Arc<Self>> {
        let session = Arc::new(Self {
            id,
            persistent,
            mode,
            created_at: Utc::now(),
            last_activity: AtomicI64::new(Utc::now().timestamp_millis()),
            alive: AtomicBool::new(true),
            owner: StdMutex::new(Some(owner)),
            cwd: StdMutex::new(cwd),
            dims: StdMutex::new((cols, rows)),
            buffer: StdMutex::new(RingBuffer::default()),
            line_acc: StdMutex::new(String::new()),
            line_tx: StdMutex::new(None),
            pipe_stdin: Mutex::new(None),
            current_child: Arc::new(Mutex::new(None)),
            registry,
            cfg,
        });

        match mode {
            EngineMode::Line => {
                let (tx, rx) = mpsc::unbounded_channel::<String>();
                *session.line_tx.lock().unwrap() = Some(tx);
                let worker = session.clone();
                tokio::spawn(async move { worker.line_worker(rx).await });
                if session.cfg.render_prompt {
                    session.emit_prompt();
                }
            }
            EngineMode::Pipe => session.spawn_pipe_shell()?,
        }

        Ok(session)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn last_activity_millis(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    // ── Attachment ───────────────────────────────────────────────────────────

    /// Make `connection_id` the owner and flush any buffered output to it.
    pub fn claim(&self, connection_id: &str) {
        {
            let mut owner = self.owner.lock().unwrap();
            if owner.as_deref() == Some(connection_id) {
                return;
            }
            *owner = Some(connection_id.to_string());
        }

        let mut chunks = self.buffer.lock().unwrap().drain();
        while let Some(chunk) = chunks.pop_front() {
            let frame = self.data_frame(&chunk.data);
            if !self.registry.send_to(connection_id, &frame) {
                // New owner vanished mid-flush — keep the rest for the next one.
                chunks.push_front(chunk);
                self.buffer.lock().unwrap().requeue_front(chunks);
                *self.owner.lock().unwrap() = None;
                return;
            }
        }
    }

    fn data_frame(&self, data: &str) -> Envelope {
        Envelope::event(
            "terminal",
            json!({ "op": "data", "sessionId": self.id, "chunk": redact(data) }),
        )
    }

    /// Deliver one output chunk: to the owner if attached, else the buffer.
    /// Redaction happens at emission so buffered and live output match.
    fn emit(&self, data: &str) {
        let data = if cfg!(windows) { remap_bare_cr(data) } else { data.to_string() };
        let owner = self.owner.lock().unwrap().clone();
        if let Some(conn) = owner {
            if self.registry.send_to(&conn, &self.data_frame(&data)) {
                return;
            }
            *self.owner.lock().unwrap() = None;
        }
        self.buffer.lock().unwrap().push(data);
    }

    fn emit_prompt(&self) {
        if !self.cfg.render_prompt {
            return;
        }
        let cwd = self.cwd.lock().unwrap().display().to_string();
        self.emit(&format!("\x1b[36m{cwd}\x1b[0m $ "));
    }

    // ── Input ────────────────────────────────────────────────────────────────

    /// Feed client input bytes. `0x03` anywhere interrupts the active child;
    /// the remaining bytes are processed normally.
    pub async fn input(&self, data: &str) -> anyhow::Result<()> {
        self.touch();
        let (data, interrupted) = strip_interrupts(data);
        if interrupted {
            self.interrupt().await;
        }
        if data.is_empty() {
            return Ok(());
        }

        match self.mode {
            EngineMode::Pipe => {
                let mut stdin = self.pipe_stdin.lock().await;
                match stdin.as_mut() {
                    Some(pipe) => {
                        pipe.write_all(data.as_bytes()).await?;
                        pipe.flush().await?;
                    }
                    None => {
                        return Err(crate::error::ServiceError::Upstream(
                            "shell has exited".into(),
                        )
                        .into())
                    }
                }
            }
            EngineMode::Line => {
                let mut complete = Vec::new();
                {
                    let mut acc = self.line_acc.lock().unwrap();
                    acc.push_str(&data);
                    while let Some(pos) = acc.find('\n') {
                        let line: String = acc.drain(..=pos).collect();
                        complete.push(line.trim_end_matches(['\n', '\r']).to_string());
                    }
                }
                if let Some(tx) = self.line_tx.lock().unwrap().as_ref() {
                    for line in complete {
                        let _ = tx.send(line);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.touch();
        // No controlling terminal in pipe mode — the new dimensions apply to
        // children spawned from now on (COLUMNS/LINES).
        *self.dims.lock().unwrap() = (cols, rows);
    }

    // ── Line engine ──────────────────────────────────────────────────────────

    async fn line_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = rx.recv().await {
            self.run_line(&line).await;
        }
        debug!(session = %self.id, "line worker stopped");
    }

    async fn run_line(&self, line: &str) {
        // Local echo of the submitted line, dimmed, before any output.
        self.emit(&format!("\x1b[2m$ {line}\x1b[0m\r\n"));

        let trimmed = line.trim();
        if trimmed.is_empty() {
            self.emit_prompt();
            return;
        }

        // Builtins never spawn.
        if trimmed == "clear" || trimmed == "cls" {
            self.emit(ANSI_CLEAR);
            self.emit_prompt();
            return;
        }
        if trimmed == "cd" || trimmed.starts_with("cd ") {
            self.builtin_cd(trimmed[2..].trim());
            self.emit_prompt();
            return;
        }

        if let Err(e) = safety::check_command(trimmed, &self.cfg.allowlist, self.cfg.allow_unsafe) {
            self.emit(&format!("{}\r\n", e.wire_message()));
            self.emit_prompt();
            return;
        }

        if let Err(e) = self.run_command(trimmed).await {
            // The session survives a failed spawn; the bad command is not
            // retried and the prompt is re-rendered.
            self.emit(&format!("failed to start: {e:#}\r\n"));
        }
        self.emit_prompt();
    }

    fn builtin_cd(&self, target: &str) {
        let current = self.cwd.lock().unwrap().clone();
        let dest = if target.is_empty() {
            std::env::var("HOME").map(PathBuf::from).unwrap_or(current.clone())
        } else if std::path::Path::new(target).is_absolute() {
            PathBuf::from(target)
        } else {
            current.join(target)
        };
        let dest = normalize_path(&dest);
        if dest.is_dir() {
            *self.cwd.lock().unwrap() = dest;
        } else {
            self.emit(&format!("cd: no such directory: {target}\r\n"));
        }
    }

    /// Spawn one command through the shell and stream its output to exit.
    async fn run_command(&self, command_line: &str) -> anyhow::Result<()> {
        let cwd = self.cwd.lock().unwrap().clone();
        let (cols, rows) = *self.dims.lock().unwrap();

        let mut cmd = shell_command(&self.cfg.shell, command_line);
        cmd.current_dir(&cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env_clear()
            .envs(build_child_env(&self.cfg, cols, rows));
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.current_child.lock().await = Some(child);

        // Stream both pipes to EOF, then reap. Ctrl-C may kill the child
        // underneath us — EOF on the pipes ends both loops either way.
        tokio::join!(self.pump(stdout), self.pump(stderr));

        if let Some(mut child) = self.current_child.lock().await.take() {
            let _ = child.wait().await;
        }
        Ok(())
    }

    async fn pump<R: tokio::io::AsyncRead + Unpin>(&self, reader: Option<R>) {
        let Some(mut reader) = reader else { return };
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => self.emit(&String::from_utf8_lossy(&buf[..n])),
            }
        }
    }

    // ── Pipe engine ──────────────────────────────────────────────────────────

    fn spawn_pipe_shell(self: &Arc<Self>) -> anyhow::Result<()> {
        let cwd = self.cwd.lock().unwrap().clone();
        let (cols, rows) = *self.dims.lock().unwrap();

        let mut cmd = Command::new(&self.cfg.shell);
        cmd.current_dir(&cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env_clear()
            .envs(build_child_env(&self.cfg, cols, rows));
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("failed to spawn shell `{}`: {e}", self.cfg.shell)
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.pipe_stdin.try_lock().expect("fresh session") = stdin;

        let current = self.current_child.clone();
        let on_stdout = self.clone();
        let on_stderr = self.clone();

        tokio::spawn(async move { on_stderr.pump(stderr).await });
        tokio::spawn(async move {
            on_stdout.pump(stdout).await;
            // Shell exited — reap it and mark the session dead so the
            // sweeper removes it.
            if let Some(mut child) = current.lock().await.take() {
                let _ = child.wait().await;
            }
            on_stdout.alive.store(false, Ordering::Release);
            debug!(session = %on_stdout.id, "pipe shell exited");
        });

        *self.current_child.try_lock().expect("fresh session") = Some(child);
        Ok(())
    }

    // ── Signals and teardown ─────────────────────────────────────────────────

    /// Interrupt the active child: process-group SIGINT, then a hard kill
    /// if it is still running after the grace period.
    pub async fn interrupt(&self) {
        let mut guard = self.current_child.lock().await;
        let Some(child) = guard.as_mut() else { return };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid came from our own spawned child; the negative
            // value addresses its process group.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGINT);
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(KILL_GRACE_MS)).await;
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                let _ = child.kill().await;
            }
        }
    }

    /// Terminate the child (if any) and mark the session dead.
    pub async fn dispose(&self) {
        self.alive.store(false, Ordering::Release);
        // Ends the line worker once the current command finishes.
        self.line_tx.lock().unwrap().take();
        self.pipe_stdin.lock().await.take();
        self.interrupt().await;
        if let Some(mut child) = self.current_child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "sessionId": self.id,
            "persistent": self.persistent,
            "engineMode": self.mode,
            "lastActivity": self.last_activity_millis(),
            "cwd": self.cwd.lock().unwrap().display().to_string(),
        })
    }
}

/// `sh -c <line>` on POSIX, `cmd.exe /C <line>` on Windows.
pub fn shell_command(shell: &str, command_line: &str) -> Command {
    let mut cmd = Command::new(shell);
    if cfg!(windows) {
        cmd.arg("/C").arg(command_line);
    } else {
        cmd.arg("-c").arg(command_line);
    }
    cmd
}

/// Drop `0x03` bytes from input, reporting whether any were present.
fn strip_interrupts(data: &str) -> (String, bool) {
    if !data.contains('\u{3}') {
        return (data.to_string(), false);
    }
    (data.replace('\u{3}', ""), true)
}

/// Child environment: the daemon's environment minus denied variables,
/// with the terminal basics pinned. AI provider credentials only pass
/// through when injection is enabled.
pub fn build_child_env(
    cfg: &SessionConfig,
    cols: u16,
    rows: u16,
) -> HashMap<String, String> {
    const AI_CRED_VARS: &[&str] =
        &["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "GEMINI_API_KEY", "OPENROUTER_API_KEY"];

    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| !cfg.env_deny.contains(k))
        .collect();

    if cfg.inject_ai_creds {
        for key in AI_CRED_VARS {
            if let Ok(v) = std::env::var(key) {
                env.insert(key.to_string(), v);
            }
        }
    }

    env.entry("TERM".to_string()).or_insert_with(|| "xterm-256color".to_string());
    env.insert("COLUMNS".to_string(), cols.to_string());
    env.insert("LINES".to_string(), rows.to_string());
    env
}

/// Windows children write lone `\r` for in-place updates; browsers need
/// `\r\n` to advance the line.
fn remap_bare_cr(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    let bytes: Vec<char> = data.chars().collect();
    for (i, c) in bytes.iter().enumerate() {
        if *c == '\r' && bytes.get(i + 1) != Some(&'\n') {
            out.push_str("\r\n");
        } else {
            out.push(*c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_by_count() {
        let mut rb = RingBuffer::default();
        for i in 0..(MAX_BUFFERED_CHUNKS + 5) {
            rb.push(format!("chunk-{i}"));
        }
        assert_eq!(rb.chunks.len(), MAX_BUFFERED_CHUNKS);
        assert_eq!(rb.chunks.front().unwrap().data, "chunk-5");
    }

    #[test]
    fn ring_buffer_evicts_oldest_by_bytes() {
        let mut rb = RingBuffer::default();
        let big = "x".repeat(600 * 1024);
        rb.push(big.clone());
        rb.push(big);
        assert_eq!(rb.chunks.len(), 1, "two 600K chunks exceed the 1 MiB cap");
    }

    #[test]
    fn ring_buffer_requeue_preserves_order() {
        let mut rb = RingBuffer::default();
        rb.push("a".into());
        rb.push("b".into());
        let mut drained = rb.drain();
        assert!(rb.chunks.is_empty());
        let first = drained.pop_front().unwrap();
        assert_eq!(first.data, "a");
        rb.requeue_front(drained);
        rb.push("c".into());
        let order: Vec<_> = rb.chunks.iter().map(|c| c.data.as_str()).collect();
        assert_eq!(order, vec!["b", "c"]);
    }

    #[test]
    fn strip_interrupts_detects_etx() {
        let (rest, hit) = strip_interrupts("ab\u{3}cd");
        assert!(hit);
        assert_eq!(rest, "abcd");
        let (rest, hit) = strip_interrupts("plain");
        assert!(!hit);
        assert_eq!(rest, "plain");
    }

    #[test]
    fn bare_cr_is_remapped() {
        assert_eq!(remap_bare_cr("a\rb"), "a\r\nb");
        assert_eq!(remap_bare_cr("a\r\nb"), "a\r\nb");
        assert_eq!(remap_bare_cr("a\r"), "a\r\n");
    }

    #[test]
    fn child_env_denies_and_pins_term() {
        std::env::set_var("OTGD_TEST_SECRET", "hunter2");
        let cfg = SessionConfig {
            shell: "/bin/sh".into(),
            allowlist: vec![],
            allow_unsafe: false,
            env_deny: vec!["OTGD_TEST_SECRET".into()],
            inject_ai_creds: false,
            render_prompt: true,
        };
        let env = build_child_env(&cfg, 80, 24);
        assert!(!env.contains_key("OTGD_TEST_SECRET"));
        assert_eq!(env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert_eq!(env.get("COLUMNS").map(String::as_str), Some("80"));
        std::env::remove_var("OTGD_TEST_SECRET");
    }
}
