//! Workspace filesystem service: a read-mostly view with guarded writes
//! and per-client debounced watchers.

pub mod resolver;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use notify_debouncer_full::{new_debouncer, notify::RecursiveMode, notify::Watcher, DebounceEventResult};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::DaemonConfig;
use crate::error::ServiceError;
use crate::server::envelope::Envelope;
use crate::server::registry::ConnectionRegistry;
use crate::server::{HandlerOutcome, ServiceHandler};
use resolver::PathResolver;

/// Text reads are truncated past this many bytes unless the client asks
/// for less.
const MAX_READ_BYTES: usize = 1024 * 1024;
/// Directory listing caps.
const MAX_TREE_DEPTH: usize = 10;
const MAX_ENTRIES_PER_DIR: usize = 1000;
/// Watchers allowed per client connection.
const MAX_WATCHERS_PER_CLIENT: usize = 50;
/// Watch event debounce.
const WATCH_DEBOUNCE_MS: u64 = 100;

type Debouncer = notify_debouncer_full::Debouncer<
    notify_debouncer_full::notify::RecommendedWatcher,
    notify_debouncer_full::FileIdMap,
>;

pub struct FsService {
    resolver: PathResolver,
    registry: Arc<ConnectionRegistry>,
    /// connection id → watched path → live debouncer.
    watchers: StdMutex<HashMap<String, HashMap<String, Debouncer>>>,
    debug: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeParams {
    path: Option<String>,
    depth: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenParams {
    path: String,
    encoding: Option<String>,
    max_length: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteParams {
    path: String,
    recursive: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameParams {
    path: String,
    new_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchParams {
    path: String,
}

fn params<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| ServiceError::Malformed(e.to_string()).into())
}

impl FsService {
    pub fn new(config: &DaemonConfig, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            resolver: PathResolver::new(
                config.workspace_root.clone(),
                config.fs_allow_symlinks,
                config.fs_deny.clone(),
            ),
            registry,
            watchers: StdMutex::new(HashMap::new()),
            debug: std::env::var("KIRO_FS_DEBUG").map(|v| v == "1").unwrap_or(false),
        })
    }

    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(self.resolver.root())
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    // ── tree ─────────────────────────────────────────────────────────────────

    fn tree(&self, body: Value) -> Result<Value> {
        let p: TreeParams = params(body)?;
        let root = self.resolver.resolve(p.path.as_deref().unwrap_or(""))?;
        if !root.exists() {
            return Err(ServiceError::NotFound(self.rel(&root)).into());
        }
        let depth = p.depth.unwrap_or(MAX_TREE_DEPTH).min(MAX_TREE_DEPTH);
        Ok(self.tree_node(&root, depth))
    }

    fn tree_node(&self, path: &Path, depth: usize) -> Value {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.rel(path));
        if !path.is_dir() {
            return json!({ "name": name, "path": self.rel(path), "type": "file" });
        }

        let mut children = Vec::new();
        let mut truncated = false;
        if depth > 0 {
            if let Ok(entries) = std::fs::read_dir(path) {
                let mut names: Vec<PathBuf> =
                    entries.flatten().map(|e| e.path()).collect();
                names.sort();
                truncated = names.len() > MAX_ENTRIES_PER_DIR;
                for child in names.into_iter().take(MAX_ENTRIES_PER_DIR) {
                    children.push(self.tree_node(&child, depth - 1));
                }
            }
        }

        let mut node = json!({
            "name": name,
            "path": self.rel(path),
            "type": "dir",
            "children": children,
        });
        if truncated {
            node["truncated"] = json!(true);
        }
        node
    }

    // ── open ─────────────────────────────────────────────────────────────────

    async fn open(&self, body: Value) -> Result<Value> {
        let p: OpenParams = params(body)?;
        let path = self.resolver.resolve(&p.path)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| ServiceError::NotFound(p.path.clone()))?;

        let cap = p.max_length.unwrap_or(MAX_READ_BYTES).min(MAX_READ_BYTES);
        let truncated = bytes.len() > cap;
        let slice = &bytes[..bytes.len().min(cap)];

        let content = match p.encoding.as_deref().unwrap_or("utf8") {
            "base64" => {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD.encode(slice)
            }
            _ => String::from_utf8_lossy(slice).to_string(),
        };

        Ok(json!({
            "path": self.rel(&path),
            "content": content,
            "truncated": truncated,
            "size": bytes.len(),
        }))
    }

    // ── mutations ────────────────────────────────────────────────────────────

    async fn create(&self, body: Value) -> Result<Value> {
        let p: CreateParams = params(body)?;
        let path = self.resolver.resolve(&p.path)?;
        if path.exists() {
            return Err(ServiceError::Conflict(format!("{} exists", p.path)).into());
        }
        match p.kind.as_str() {
            "dir" => tokio::fs::create_dir_all(&path).await?,
            "file" => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, p.content.unwrap_or_default()).await?;
            }
            other => {
                return Err(ServiceError::Malformed(format!("unknown type '{other}'")).into())
            }
        }
        Ok(json!({ "ok": true, "path": self.rel(&path) }))
    }

    async fn delete(&self, body: Value) -> Result<Value> {
        let p: DeleteParams = params(body)?;
        let path = self.resolver.resolve(&p.path)?;
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|_| ServiceError::NotFound(p.path.clone()))?;
        if meta.is_dir() {
            if p.recursive.unwrap_or(false) {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_dir(&path)
                    .await
                    .map_err(|e| ServiceError::Refused(format!("{}: {e}", p.path)))?;
            }
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(json!({ "ok": true }))
    }

    async fn rename(&self, body: Value) -> Result<Value> {
        let p: RenameParams = params(body)?;
        let from = self.resolver.resolve(&p.path)?;
        let to = self.resolver.resolve(&p.new_path)?;
        if !from.exists() {
            return Err(ServiceError::NotFound(p.path.clone()).into());
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from, &to).await?;
        Ok(json!({ "ok": true, "path": self.rel(&to) }))
    }

    // ── watchers ─────────────────────────────────────────────────────────────

    fn watch(&self, connection_id: &str, body: Value) -> Result<Value> {
        let p: WatchParams = params(body)?;
        let path = self.resolver.resolve(&p.path)?;
        if !path.exists() {
            return Err(ServiceError::NotFound(p.path.clone()).into());
        }

        let mut watchers = self.watchers.lock().unwrap();
        let per_client = watchers.entry(connection_id.to_string()).or_default();
        if per_client.len() >= MAX_WATCHERS_PER_CLIENT {
            return Err(ServiceError::Conflict(format!(
                "watch limit reached ({MAX_WATCHERS_PER_CLIENT})"
            ))
            .into());
        }
        let key = self.rel(&path);
        if per_client.contains_key(&key) {
            return Ok(json!({ "ok": true, "path": key }));
        }

        let registry = self.registry.clone();
        let conn = connection_id.to_string();
        let watched = key.clone();
        let root = self.resolver.root().to_path_buf();
        let mut debouncer = new_debouncer(
            Duration::from_millis(WATCH_DEBOUNCE_MS),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let changes: Vec<String> = events
                        .iter()
                        .flat_map(|e| e.paths.iter())
                        .map(|p| {
                            p.strip_prefix(&root).unwrap_or(p).to_string_lossy().to_string()
                        })
                        .collect();
                    if changes.is_empty() {
                        return;
                    }
                    let frame = Envelope::event(
                        "fileSystem",
                        json!({ "op": "watch", "path": watched, "changes": changes }),
                    );
                    registry.send_to(&conn, &frame);
                }
                Err(errors) => {
                    for e in errors {
                        warn!(err = %e, "file watcher error");
                    }
                }
            },
        )
        .map_err(|e| ServiceError::Upstream(format!("watcher: {e}")))?;

        debouncer
            .watcher()
            .watch(&path, RecursiveMode::Recursive)
            .map_err(|e| ServiceError::Upstream(format!("watcher: {e}")))?;

        if self.debug {
            debug!(conn = %connection_id, path = %key, "watch started");
        }
        per_client.insert(key.clone(), debouncer);
        Ok(json!({ "ok": true, "path": key }))
    }

    fn unwatch(&self, connection_id: &str, body: Value) -> Result<Value> {
        let p: WatchParams = params(body)?;
        let path = self.resolver.resolve(&p.path)?;
        let key = self.rel(&path);
        let removed = self
            .watchers
            .lock()
            .unwrap()
            .get_mut(connection_id)
            .and_then(|m| m.remove(&key))
            .is_some();
        if !removed {
            return Err(ServiceError::NotFound(format!("watch {key}")).into());
        }
        Ok(json!({ "ok": true }))
    }
}

#[async_trait]
impl ServiceHandler for FsService {
    async fn handle(&self, connection_id: &str, envelope: &Envelope) -> Result<HandlerOutcome> {
        let body = envelope.body();
        let result = match envelope.op_name()? {
            "tree" => self.tree(body)?,
            "open" => self.open(body).await?,
            "create" => self.create(body).await?,
            "delete" => self.delete(body).await?,
            "rename" => self.rename(body).await?,
            "watch" => self.watch(connection_id, body)?,
            "unwatch" => self.unwatch(connection_id, body)?,
            other => {
                return Err(
                    ServiceError::Malformed(format!("unknown fileSystem op '{other}'")).into()
                )
            }
        };
        Ok(HandlerOutcome::Reply(result))
    }

    async fn on_disconnect(&self, connection_id: &str) {
        // Watchers die with their client.
        let dropped = self.watchers.lock().unwrap().remove(connection_id);
        if let Some(map) = dropped {
            if !map.is_empty() {
                debug!(conn = %connection_id, count = map.len(), "dropped watchers for closed connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(root: &Path) -> Arc<FsService> {
        let mut config = DaemonConfig::load(None, None, Some(root.to_path_buf()));
        config.workspace_root = root.to_path_buf();
        FsService::new(&config, Arc::new(ConnectionRegistry::new()))
    }

    #[tokio::test]
    async fn open_reads_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        let svc = service(dir.path());

        let out = svc.open(json!({ "path": "a.txt" })).await.unwrap();
        assert_eq!(out["content"], "hello world");
        assert_eq!(out["truncated"], false);

        let out = svc.open(json!({ "path": "a.txt", "maxLength": 5 })).await.unwrap();
        assert_eq!(out["content"], "hello");
        assert_eq!(out["truncated"], true);
        assert_eq!(out["size"], 11);
    }

    #[tokio::test]
    async fn open_outside_workspace_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc.open(json!({ "path": "../outside.txt" })).await.unwrap_err();
        assert!(err.to_string().contains("PathOutsideWorkspace"), "{err}");
    }

    #[tokio::test]
    async fn create_delete_rename_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        svc.create(json!({ "path": "sub/new.txt", "type": "file", "content": "x" }))
            .await
            .unwrap();
        assert!(dir.path().join("sub/new.txt").is_file());

        // Creating over an existing path conflicts.
        let err = svc
            .create(json!({ "path": "sub/new.txt", "type": "file" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exists"));

        svc.rename(json!({ "path": "sub/new.txt", "newPath": "sub/renamed.txt" }))
            .await
            .unwrap();
        assert!(dir.path().join("sub/renamed.txt").is_file());

        svc.delete(json!({ "path": "sub", "recursive": true })).await.unwrap();
        assert!(!dir.path().join("sub").exists());
    }

    #[tokio::test]
    async fn tree_lists_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        let svc = service(dir.path());

        let tree = svc.tree(json!({})).unwrap();
        assert_eq!(tree["type"], "dir");
        let names: Vec<&str> = tree["children"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"src"));
        assert!(names.contains(&"README.md"));

        // depth 0 keeps children empty.
        let flat = svc.tree(json!({ "path": "src", "depth": 0 })).unwrap();
        assert!(flat["children"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn watch_limit_and_disconnect_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        std::fs::create_dir_all(dir.path().join("w")).unwrap();

        svc.watch("c1", json!({ "path": "w" })).unwrap();
        assert_eq!(svc.watchers.lock().unwrap()["c1"].len(), 1);

        svc.on_disconnect("c1").await;
        assert!(svc.watchers.lock().unwrap().get("c1").is_none());
    }

    #[tokio::test]
    async fn unwatch_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc.unwatch("c1", json!({ "path": "nope" })).unwrap_err();
        let kind = err.downcast_ref::<ServiceError>().unwrap().kind();
        assert_eq!(kind, "NotFound");
    }
}
