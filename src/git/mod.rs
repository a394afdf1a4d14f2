// SPDX-License-Identifier: MIT
//! Git service: a thin wrapper over the `git` command line.
//!
//! Output parsing is format-pinned — `log` uses a tab-separated pretty
//! format, `status` uses `--porcelain` — so upstream porcelain changes
//! cannot silently break the client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::config::DaemonConfig;
use crate::error::ServiceError;
use crate::server::envelope::Envelope;
use crate::server::{HandlerOutcome, ServiceHandler};

const GIT_TIMEOUT_SECS: u64 = 30;
/// Hard cap on captured stdout/stderr.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
const LOG_FORMAT: &str = "--pretty=format:%H\t%an\t%ad\t%s";

pub struct GitService {
    workspace_root: PathBuf,
    allow_destructive: bool,
    /// Upward `.git` walk results, cached per starting path.
    root_cache: StdMutex<HashMap<PathBuf, Option<PathBuf>>>,
    debug: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogParams {
    count: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiffParams {
    file: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShowParams {
    commit_hash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddParams {
    files: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitParams {
    message: String,
    files: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteParams {
    remote: Option<String>,
    branch: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BranchParams {
    action: String,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindReposParams {
    path: Option<String>,
}

fn params<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| ServiceError::Malformed(e.to_string()).into())
}

impl GitService {
    pub fn new(config: &DaemonConfig) -> Arc<Self> {
        Arc::new(Self {
            workspace_root: config.workspace_root.clone(),
            allow_destructive: config.git_allow_destructive,
            root_cache: StdMutex::new(HashMap::new()),
            debug: std::env::var("KIRO_GIT_DEBUG").map(|v| v == "1").unwrap_or(false),
        })
    }

    /// Locate the repository root by walking upward looking for `.git`.
    fn repo_root(&self) -> Result<PathBuf> {
        let start = self.workspace_root.clone();
        if let Some(cached) = self.root_cache.lock().unwrap().get(&start) {
            return cached
                .clone()
                .ok_or_else(|| ServiceError::NotFound("no git repository".into()).into());
        }

        let mut current = Some(start.as_path());
        let mut found = None;
        while let Some(dir) = current {
            if dir.join(".git").exists() {
                found = Some(dir.to_path_buf());
                break;
            }
            current = dir.parent();
        }

        self.root_cache.lock().unwrap().insert(start, found.clone());
        found.ok_or_else(|| ServiceError::NotFound("no git repository".into()).into())
    }

    /// Run one git command with the service's timeout and output cap.
    async fn run_git(&self, args: &[&str]) -> Result<String> {
        let cwd = self.repo_root()?;
        if self.debug {
            debug!(args = ?args, cwd = %cwd.display(), "git");
        }

        let output = tokio::time::timeout(
            Duration::from_secs(GIT_TIMEOUT_SECS),
            Command::new("git")
                .args(args)
                .current_dir(&cwd)
                .stdin(std::process::Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| ServiceError::Timeout(format!("git {} exceeded {GIT_TIMEOUT_SECS}s", args[0])))?
        .map_err(|e| ServiceError::Upstream(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Upstream(format!(
                "git {} failed: {}",
                args[0],
                stderr.trim()
            ))
            .into());
        }

        let mut bytes = output.stdout;
        if bytes.len() > MAX_OUTPUT_BYTES {
            bytes.truncate(MAX_OUTPUT_BYTES);
        }
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    // ── Operations ───────────────────────────────────────────────────────────

    async fn status(&self) -> Result<Value> {
        let branch = self
            .run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "HEAD".to_string());
        let porcelain = self.run_git(&["status", "--porcelain"]).await?;
        Ok(json!({
            "branch": branch,
            "files": parse_porcelain(&porcelain),
        }))
    }

    async fn log(&self, body: Value) -> Result<Value> {
        let p: LogParams = params(body)?;
        let count = p.count.unwrap_or(50).max(1).to_string();
        let out = self
            .run_git(&["log", "-n", &count, LOG_FORMAT, "--date=iso-strict"])
            .await?;
        Ok(json!({ "commits": parse_log(&out) }))
    }

    async fn diff(&self, body: Value) -> Result<Value> {
        let p: DiffParams = params(body)?;
        let out = match p.file.as_deref() {
            Some(file) => self.run_git(&["diff", "--", file]).await?,
            None => self.run_git(&["diff"]).await?,
        };
        Ok(json!({ "diff": out }))
    }

    async fn show(&self, body: Value) -> Result<Value> {
        let p: ShowParams = params(body)?;
        if !is_commit_ish(&p.commit_hash) {
            return Err(ServiceError::Malformed(format!(
                "not a commit hash: {}",
                p.commit_hash
            ))
            .into());
        }
        let out = self.run_git(&["show", &p.commit_hash]).await?;
        Ok(json!({ "commit": p.commit_hash, "patch": out }))
    }

    async fn add(&self, body: Value) -> Result<Value> {
        let p: AddParams = params(body)?;
        if p.files.is_empty() {
            return Err(ServiceError::Malformed("files must be non-empty".into()).into());
        }
        let mut args = vec!["add", "--"];
        args.extend(p.files.iter().map(String::as_str));
        self.run_git(&args).await?;
        Ok(json!({ "ok": true }))
    }

    async fn commit(&self, body: Value) -> Result<Value> {
        let p: CommitParams = params(body)?;
        if p.message.is_empty() || p.message.len() > 1000 {
            return Err(ServiceError::Malformed(
                "commit message must be 1-1000 characters".into(),
            )
            .into());
        }
        if let Some(files) = &p.files {
            if !files.is_empty() {
                let mut args = vec!["add", "--"];
                args.extend(files.iter().map(String::as_str));
                self.run_git(&args).await?;
            }
        }
        let out = self.run_git(&["commit", "-m", &p.message]).await?;
        Ok(json!({ "ok": true, "output": out }))
    }

    async fn push_or_pull(&self, verb: &str, body: Value) -> Result<Value> {
        let p: RemoteParams = params(body)?;
        let mut args = vec![verb];
        if let Some(remote) = &p.remote {
            args.push(remote);
            if let Some(branch) = &p.branch {
                args.push(branch);
            }
        }
        let out = self.run_git(&args).await?;
        Ok(json!({ "ok": true, "output": out }))
    }

    async fn branch(&self, body: Value) -> Result<Value> {
        let p: BranchParams = params(body)?;
        match p.action.as_str() {
            "list" => {
                let out = self.run_git(&["branch", "--list", "--no-color"]).await?;
                let mut current = String::new();
                let branches: Vec<String> = out
                    .lines()
                    .map(|l| {
                        if let Some(name) = l.strip_prefix("* ") {
                            current = name.trim().to_string();
                            current.clone()
                        } else {
                            l.trim().to_string()
                        }
                    })
                    .filter(|l| !l.is_empty())
                    .collect();
                Ok(json!({ "branches": branches, "current": current }))
            }
            "create" => {
                let name = p.name.ok_or_else(|| {
                    ServiceError::Malformed("branch create requires name".into())
                })?;
                self.run_git(&["checkout", "-b", &name]).await?;
                Ok(json!({ "ok": true, "branch": name }))
            }
            "switch" => {
                let name = p.name.ok_or_else(|| {
                    ServiceError::Malformed("branch switch requires name".into())
                })?;
                self.run_git(&["checkout", &name]).await?;
                Ok(json!({ "ok": true, "branch": name }))
            }
            "delete" => {
                if !self.allow_destructive {
                    return Err(ServiceError::Refused(
                        "destructive git operations are disabled".into(),
                    )
                    .into());
                }
                let name = p.name.ok_or_else(|| {
                    ServiceError::Malformed("branch delete requires name".into())
                })?;
                self.run_git(&["branch", "-D", &name]).await?;
                Ok(json!({ "ok": true }))
            }
            other => {
                Err(ServiceError::Malformed(format!("unknown branch action '{other}'")).into())
            }
        }
    }

    /// Shallow scan for git repositories under a directory.
    async fn find_repos(&self, body: Value) -> Result<Value> {
        let p: FindReposParams = params(body)?;
        let base = match p.path {
            Some(rel) if Path::new(&rel).is_absolute() => PathBuf::from(rel),
            Some(rel) => self.workspace_root.join(rel),
            None => self.workspace_root.clone(),
        };
        let mut repos = Vec::new();
        scan_for_repos(&base, 3, &mut repos);
        let repos: Vec<String> =
            repos.into_iter().map(|p| p.display().to_string()).collect();
        Ok(json!({ "repos": repos }))
    }
}

/// Depth-limited walk collecting directories that contain `.git`.
fn scan_for_repos(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    if dir.join(".git").exists() {
        out.push(dir.to_path_buf());
        return;
    }
    if depth == 0 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if path.is_dir() && !hidden {
            scan_for_repos(&path, depth - 1, out);
        }
    }
}

fn is_commit_ish(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse `git status --porcelain` into `{path, staged, worktree}` entries.
fn parse_porcelain(out: &str) -> Vec<Value> {
    out.lines()
        .filter(|l| l.len() > 3)
        .map(|line| {
            let staged = &line[0..1];
            let worktree = &line[1..2];
            let path = line[3..].to_string();
            json!({ "path": path, "staged": staged, "worktree": worktree })
        })
        .collect()
}

/// Parse the pinned `%H\t%an\t%ad\t%s` log format.
fn parse_log(out: &str) -> Vec<Value> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, '\t');
            let hash = parts.next()?;
            let author = parts.next()?;
            let date = parts.next()?;
            let subject = parts.next().unwrap_or("");
            Some(json!({
                "hash": hash,
                "author": author,
                "date": date,
                "subject": subject,
            }))
        })
        .collect()
}

#[async_trait]
impl ServiceHandler for GitService {
    async fn handle(&self, _connection_id: &str, envelope: &Envelope) -> Result<HandlerOutcome> {
        let body = envelope.body();
        let result = match envelope.op_name()? {
            "status" => self.status().await?,
            "log" => self.log(body).await?,
            "diff" => self.diff(body).await?,
            "show" => self.show(body).await?,
            "add" => self.add(body).await?,
            "commit" => self.commit(body).await?,
            "push" => self.push_or_pull("push", body).await?,
            "pull" => self.push_or_pull("pull", body).await?,
            "branch" => self.branch(body).await?,
            "find-repos" => self.find_repos(body).await?,
            // Reset/clean are deliberately not exposed as ops at all;
            // everything else shells out through the fixed arg lists above.
            other => {
                return Err(ServiceError::Malformed(format!("unknown git op '{other}'")).into())
            }
        };
        Ok(HandlerOutcome::Reply(result))
    }

    fn deadline(&self, _op: &str) -> Duration {
        // Git's own 30 s timeout plus scheduling headroom.
        Duration::from_secs(GIT_TIMEOUT_SECS + 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_parsing() {
        let out = " M src/main.rs\n?? notes.txt\nA  staged.rs\n";
        let files = parse_porcelain(out);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0]["path"], "src/main.rs");
        assert_eq!(files[0]["worktree"], "M");
        assert_eq!(files[1]["staged"], "?");
        assert_eq!(files[2]["staged"], "A");
    }

    #[test]
    fn log_parsing_is_tab_pinned() {
        let out = "abc123\tAda Lovelace\t2026-01-02T03:04:05+00:00\tfix: tab\tin subject\n";
        let commits = parse_log(out);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0]["hash"], "abc123");
        assert_eq!(commits[0]["author"], "Ada Lovelace");
        // Tabs inside the subject stay in the subject.
        assert_eq!(commits[0]["subject"], "fix: tab\tin subject");
    }

    #[test]
    fn commit_ish_validation() {
        assert!(is_commit_ish("deadbeef"));
        assert!(is_commit_ish(&"a".repeat(40)));
        assert!(!is_commit_ish(""));
        assert!(!is_commit_ish("HEAD; rm -rf /"));
        assert!(!is_commit_ish("main"));
    }

    #[tokio::test]
    async fn no_repo_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::load(None, None, Some(dir.path().to_path_buf()));
        config.workspace_root = dir.path().to_path_buf();
        let svc = GitService::new(&config);
        let err = svc.repo_root().unwrap_err();
        let kind = err.downcast_ref::<ServiceError>().unwrap().kind();
        assert_eq!(kind, "NotFound");
        // The negative result is cached.
        assert!(svc.root_cache.lock().unwrap().len() == 1);
    }

    #[tokio::test]
    async fn finds_repo_root_upward() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let mut config = DaemonConfig::load(None, None, Some(nested.clone()));
        config.workspace_root = nested;
        let svc = GitService::new(&config);
        assert_eq!(svc.repo_root().unwrap(), dir.path());
    }

    #[tokio::test]
    async fn commit_message_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::load(None, None, Some(dir.path().to_path_buf()));
        config.workspace_root = dir.path().to_path_buf();
        let svc = GitService::new(&config);

        let err = svc.commit(json!({ "message": "" })).await.unwrap_err();
        assert!(err.to_string().contains("1-1000"));
        let err = svc
            .commit(json!({ "message": "m".repeat(1001) }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1-1000"));
    }

    #[test]
    fn scan_finds_nested_repos() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("one/.git")).unwrap();
        std::fs::create_dir_all(dir.path().join("two/inner/.git")).unwrap();
        std::fs::create_dir_all(dir.path().join(".hidden/skip/.git")).unwrap();

        let mut repos = Vec::new();
        scan_for_repos(dir.path(), 3, &mut repos);
        assert_eq!(repos.len(), 2, "{repos:?}");
    }
}
