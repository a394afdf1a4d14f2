// SPDX-License-Identifier: MIT
//! Durable ACP state under `./.on-the-go/acp/`.
//!
//! Layout:
//!   - `sessions.json`       — session list + last-selected id
//!   - `modes.json`          — last-selected mode per session
//!   - `threads/<id>.json`   — append-only NDJSON transcript
//!   - `threads/index.json`  — per-session summary
//!
//! Snapshot files are written atomically (`<name>.tmp` + rename); thread
//! transcripts are append-only so a crash can lose at most the final line.
//! Persistence is best-effort: failures are logged, never propagated to
//! the operation that caused the write.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub created_at: String,
    pub last_used_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SessionsFile {
    sessions: Vec<SessionRecord>,
    last_session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ThreadSummary {
    first_seen: String,
    last_seen: String,
    message_count: u64,
}

#[derive(Default)]
struct State {
    sessions: SessionsFile,
    modes: HashMap<String, String>,
    index: HashMap<String, ThreadSummary>,
}

pub struct AcpStore {
    dir: PathBuf,
    state: StdMutex<State>,
}

impl AcpStore {
    /// Open (and create) the data directory, loading whatever survived the
    /// last run.
    pub fn open(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(dir.join("threads")) {
            warn!(dir = %dir.display(), err = %e, "cannot create acp data dir");
        }

        let sessions = read_json(&dir.join("sessions.json")).unwrap_or_default();
        let modes = read_json(&dir.join("modes.json")).unwrap_or_default();
        let index = read_json(&dir.join("threads/index.json")).unwrap_or_default();

        Self {
            dir,
            state: StdMutex::new(State { sessions, modes, index }),
        }
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn record_session(&self, id: &str) {
        let now = Utc::now().to_rfc3339();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.sessions.sessions.iter_mut().find(|s| s.id == id) {
            existing.last_used_at = now;
        } else {
            state.sessions.sessions.push(SessionRecord {
                id: id.to_string(),
                created_at: now.clone(),
                last_used_at: now,
            });
        }
        state.sessions.last_session_id = Some(id.to_string());
        self.flush_sessions(&state);
    }

    pub fn touch_session(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.sessions.sessions.iter_mut().find(|s| s.id == id) {
            existing.last_used_at = Utc::now().to_rfc3339();
            self.flush_sessions(&state);
        }
    }

    pub fn set_last_session(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.sessions.last_session_id = Some(id.to_string());
        self.flush_sessions(&state);
    }

    pub fn last_session(&self) -> Option<String> {
        self.state.lock().unwrap().sessions.last_session_id.clone()
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        self.state.lock().unwrap().sessions.sessions.clone()
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.state.lock().unwrap().sessions.sessions.iter().any(|s| s.id == id)
    }

    pub fn remove_session(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.sessions.sessions.retain(|s| s.id != id);
        if state.sessions.last_session_id.as_deref() == Some(id) {
            state.sessions.last_session_id = None;
        }
        state.modes.remove(id);
        state.index.remove(id);
        self.flush_sessions(&state);
        self.flush_modes(&state);
        self.flush_index(&state);
        let _ = std::fs::remove_file(self.thread_path(id));
    }

    /// Carry one session's persisted identity over to another (recovery).
    pub fn rename_session(&self, old_id: &str, new_id: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(record) = state.sessions.sessions.iter_mut().find(|s| s.id == old_id) {
                record.id = new_id.to_string();
                record.last_used_at = Utc::now().to_rfc3339();
            }
            if state.sessions.last_session_id.as_deref() == Some(old_id) {
                state.sessions.last_session_id = Some(new_id.to_string());
            }
            if let Some(mode) = state.modes.remove(old_id) {
                state.modes.insert(new_id.to_string(), mode);
            }
            if let Some(summary) = state.index.remove(old_id) {
                state.index.insert(new_id.to_string(), summary);
            }
            self.flush_sessions(&state);
            self.flush_modes(&state);
            self.flush_index(&state);
        }
        let _ = std::fs::rename(self.thread_path(old_id), self.thread_path(new_id));
    }

    // ── Modes ────────────────────────────────────────────────────────────────

    pub fn set_mode(&self, session_id: &str, mode_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.modes.insert(session_id.to_string(), mode_id.to_string());
        self.flush_modes(&state);
    }

    pub fn mode(&self, session_id: &str) -> Option<String> {
        self.state.lock().unwrap().modes.get(session_id).cloned()
    }

    // ── Threads ──────────────────────────────────────────────────────────────

    fn thread_path(&self, session_id: &str) -> PathBuf {
        // Session ids come from the agent; keep them filesystem-safe.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join("threads").join(format!("{safe}.json"))
    }

    /// Append one `session_update` to the session's transcript.
    pub fn append_thread(&self, session_id: &str, update: &Value) {
        let record = json!({ "timestamp": Utc::now().timestamp_millis(), "update": update });
        let line = format!("{record}\n");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.thread_path(session_id))
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(session = session_id, err = %e, "thread append failed");
        }

        let now = Utc::now().to_rfc3339();
        let mut state = self.state.lock().unwrap();
        let summary = state.index.entry(session_id.to_string()).or_insert_with(|| {
            ThreadSummary { first_seen: now.clone(), last_seen: now.clone(), message_count: 0 }
        });
        summary.last_seen = now;
        summary.message_count += 1;
        self.flush_index(&state);
    }

    /// Read a full transcript; tolerates a torn final line from a crash.
    pub fn thread(&self, session_id: &str) -> Result<Vec<Value>> {
        let path = self.thread_path(session_id);
        let contents = std::fs::read_to_string(&path)
            .map_err(|_| ServiceError::NotFound(format!("thread {session_id}")))?;
        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn thread_index(&self) -> Value {
        let state = self.state.lock().unwrap();
        serde_json::to_value(&state.index).unwrap_or_else(|_| json!({}))
    }

    // ── Snapshot writes ──────────────────────────────────────────────────────

    fn flush_sessions(&self, state: &State) {
        write_json_atomic(&self.dir.join("sessions.json"), &state.sessions);
    }

    fn flush_modes(&self, state: &State) {
        write_json_atomic(&self.dir.join("modes.json"), &state.modes);
    }

    fn flush_index(&self, state: &State) {
        write_json_atomic(&self.dir.join("threads/index.json"), &state.index);
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "unreadable state file — starting fresh");
            None
        }
    }
}

/// `<name>.tmp` + rename; rename is atomic on every supported platform.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) {
    let result: Result<()> = (|| {
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    })();
    if let Err(e) = result {
        warn!(path = %path.display(), err = %e, "state write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AcpStore::open(dir.path().to_path_buf());
            store.record_session("s-1");
            store.record_session("s-2");
            store.set_last_session("s-1");
        }
        let store = AcpStore::open(dir.path().to_path_buf());
        let ids: Vec<String> = store.list_sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["s-1", "s-2"]);
        assert_eq!(store.last_session().as_deref(), Some("s-1"));
    }

    #[test]
    fn thread_appends_and_reads_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = AcpStore::open(dir.path().to_path_buf());
        store.append_thread("s-1", &json!({ "n": 1 }));
        store.append_thread("s-1", &json!({ "n": 2 }));

        let thread = store.thread("s-1").unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0]["update"]["n"], 1);
        assert_eq!(thread[1]["update"]["n"], 2);
        assert!(thread[0]["timestamp"].is_i64());

        let index = store.thread_index();
        assert_eq!(index["s-1"]["messageCount"], 2);
    }

    #[test]
    fn torn_final_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = AcpStore::open(dir.path().to_path_buf());
        store.append_thread("s-1", &json!({ "ok": true }));
        // Simulate a crash mid-append.
        let path = store.thread_path("s-1");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"timestamp\":123,\"upd").unwrap();
        drop(f);

        let thread = store.thread("s-1").unwrap();
        assert_eq!(thread.len(), 1);
    }

    #[test]
    fn missing_thread_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = AcpStore::open(dir.path().to_path_buf());
        assert!(store.thread("nope").is_err());
    }

    #[test]
    fn rename_session_carries_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = AcpStore::open(dir.path().to_path_buf());
        store.record_session("old");
        store.set_mode("old", "architect");
        store.append_thread("old", &json!({ "n": 1 }));

        store.rename_session("old", "new");
        assert!(store.has_session("new"));
        assert!(!store.has_session("old"));
        assert_eq!(store.mode("new").as_deref(), Some("architect"));
        assert_eq!(store.last_session().as_deref(), Some("new"));
        assert_eq!(store.thread("new").unwrap().len(), 1);
    }

    #[test]
    fn modes_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AcpStore::open(dir.path().to_path_buf());
            store.set_mode("s-1", "code");
        }
        let store = AcpStore::open(dir.path().to_path_buf());
        assert_eq!(store.mode("s-1").as_deref(), Some("code"));
    }
}
