use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const DEFAULT_PORT: u16 = 3900;
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_MAX_SESSIONS: usize = 50;
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ACP_CONNECT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_ACP_PROMPT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_WARN_SLOW_CONNECT_MS: u64 = 10_000;

/// The daemon's working directory layout, rooted at `./.on-the-go/`.
pub const DATA_DIR_NAME: &str = ".on-the-go";

// ─── config.json ──────────────────────────────────────────────────────────────

/// `./.on-the-go/config.json` — every field is an optional override.
/// Priority: CLI / env var  >  config.json  >  built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub version: Option<u32>,
    pub server: ServerSection,
    pub terminal: TerminalSection,
    pub acp: AcpSection,
    pub fs: FsSection,
    pub git: GitSection,
    pub prompts: DirSection,
    pub results: DirSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub host: Option<String>,
    /// Origin allowlist for WS upgrades; `["*"]` permits all.
    pub origins: Option<Vec<String>>,
    pub max_connections: Option<usize>,
    /// Optional shared token; when set, the first envelope must authenticate.
    pub token: Option<String>,
    /// Directory holding the SPA bundle served at `GET /`.
    pub static_dir: Option<PathBuf>,
    /// Reject envelopes carrying unknown keys instead of warning.
    pub strict_envelopes: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSection {
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub max_sessions: Option<usize>,
    pub allow_unsafe: Option<bool>,
    /// First-token command allowlist; empty uses the built-in default set.
    pub allowlist: Option<Vec<String>>,
    /// Environment variable names never forwarded to shell children.
    pub env_deny: Option<Vec<String>>,
    pub exec_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcpSection {
    pub connect_timeout_ms: Option<u64>,
    pub prompt_timeout_ms: Option<u64>,
    pub autostart: Option<bool>,
    pub autostart_agents: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FsSection {
    /// Path substrings denied outright (e.g. ".ssh", "id_rsa").
    pub deny: Option<Vec<String>>,
    pub allow_symlinks: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSection {
    /// Permit reset / clean / force-push style operations.
    pub allow_destructive: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirSection {
    pub dir: Option<PathBuf>,
}

fn load_file(path: &Path) -> Option<FileConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<FileConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.json — using defaults");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

/// Fully-resolved runtime configuration shared by every service.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub host: String,
    /// Root of the workspace the daemon exposes.
    pub workspace_root: PathBuf,
    /// `{workspace_root}/.on-the-go` — persisted state lives here.
    pub data_dir: PathBuf,
    pub origins: Vec<String>,
    pub max_connections: usize,
    pub token: Option<String>,
    pub static_dir: Option<PathBuf>,
    pub strict_envelopes: bool,

    pub shell: String,
    pub terminal_cwd: PathBuf,
    pub max_pty_sessions: usize,
    pub allow_unsafe: bool,
    pub command_allowlist: Vec<String>,
    pub env_deny: Vec<String>,
    pub inject_ai_creds: bool,
    pub exec_timeout_secs: u64,

    pub acp_connect_timeout_ms: u64,
    pub acp_prompt_timeout_ms: u64,
    pub warn_slow_connect_ms: u64,
    pub acp_autostart: bool,
    pub acp_autostart_agents: Vec<String>,

    pub fs_deny: Vec<String>,
    pub fs_allow_symlinks: bool,
    pub git_allow_destructive: bool,
}

/// Default first-token allowlist for shell commands. Deliberately boring:
/// build tools, VCS, and read-only inspection commands.
fn default_allowlist() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "echo", "pwd", "env", "which", "wc", "grep", "rg", "find",
        "git", "node", "npm", "npx", "pnpm", "yarn", "bun", "cargo", "rustc", "go", "python",
        "python3", "pip", "pip3", "make", "cmake", "tsc", "curl", "touch", "mkdir", "cp", "mv",
        "rm", "diff", "sed", "awk", "sort", "uniq", "tar", "du", "df", "ps", "uname", "date",
        "clear", "cd",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Environment variables never forwarded into PTY children unless credential
/// injection is explicitly enabled.
fn default_env_deny() -> Vec<String> {
    ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "GEMINI_API_KEY", "AWS_SECRET_ACCESS_KEY"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl DaemonConfig {
    /// Build config from CLI args + `config.json` + `KIRO_*` env overrides.
    ///
    /// `workspace_root` defaults to the current directory; the data dir is
    /// always `{workspace_root}/.on-the-go` unless an explicit config path
    /// was given (then its parent directory is the data dir).
    pub fn load(
        port: Option<u16>,
        config_path: Option<PathBuf>,
        workspace_root: Option<PathBuf>,
    ) -> Self {
        let workspace_root = workspace_root
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let (data_dir, file_path) = match config_path {
            Some(p) => (
                p.parent().map(Path::to_path_buf).unwrap_or_else(|| workspace_root.clone()),
                p,
            ),
            None => {
                let dir = workspace_root.join(DATA_DIR_NAME);
                let file = dir.join("config.json");
                (dir, file)
            }
        };

        let file = load_file(&file_path).unwrap_or_default();

        let port = port.or(file.server.port).unwrap_or(DEFAULT_PORT);
        let host = file.server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

        let allow_unsafe = env_flag("KIRO_EXEC_ALLOW_UNSAFE")
            .or(file.terminal.allow_unsafe)
            .unwrap_or(false);

        let shell = file.terminal.shell.unwrap_or_else(default_shell);
        let terminal_cwd = file.terminal.cwd.unwrap_or_else(|| workspace_root.clone());

        Self {
            port,
            host,
            data_dir,
            origins: file.server.origins.unwrap_or_else(|| vec!["*".to_string()]),
            max_connections: file.server.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            token: file.server.token.filter(|t| !t.is_empty()),
            static_dir: file.server.static_dir,
            strict_envelopes: file.server.strict_envelopes.unwrap_or(false),

            shell,
            terminal_cwd,
            max_pty_sessions: file.terminal.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
            allow_unsafe,
            command_allowlist: file
                .terminal
                .allowlist
                .filter(|l| !l.is_empty())
                .unwrap_or_else(default_allowlist),
            env_deny: file.terminal.env_deny.unwrap_or_else(default_env_deny),
            inject_ai_creds: env_flag("KIRO_INJECT_AI_CREDS").unwrap_or(false),
            exec_timeout_secs: file
                .terminal
                .exec_timeout_secs
                .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS),

            acp_connect_timeout_ms: env_u64("KIRO_ACP_CONNECT_TIMEOUT_MS")
                .or(file.acp.connect_timeout_ms)
                .unwrap_or(DEFAULT_ACP_CONNECT_TIMEOUT_MS),
            acp_prompt_timeout_ms: env_u64("KIRO_ACP_PROMPT_TIMEOUT_MS")
                .or(file.acp.prompt_timeout_ms)
                .unwrap_or(DEFAULT_ACP_PROMPT_TIMEOUT_MS),
            warn_slow_connect_ms: env_u64("KIRO_WARN_SLOW_CONNECT_MS")
                .unwrap_or(DEFAULT_WARN_SLOW_CONNECT_MS),
            acp_autostart: env_flag("KIRO_ACP_AUTOSTART")
                .or(file.acp.autostart)
                .unwrap_or(false),
            acp_autostart_agents: std::env::var("KIRO_ACP_AUTOSTART_AGENTS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .or(file.acp.autostart_agents)
                .unwrap_or_default(),

            fs_deny: file.fs.deny.unwrap_or_default(),
            fs_allow_symlinks: file.fs.allow_symlinks.unwrap_or(false),
            git_allow_destructive: file.git.allow_destructive.unwrap_or(false),

            workspace_root,
        }
    }

    pub fn acp_data_dir(&self) -> PathBuf {
        self.data_dir.join("acp")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("otgd.pid")
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::load(None, None, Some(dir.path().to_path_buf()));
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.max_pty_sessions, 50);
        assert_eq!(cfg.origins, vec!["*".to_string()]);
        assert!(cfg.data_dir.ends_with(".on-the-go"));
        assert!(!cfg.allow_unsafe);
        assert!(cfg.command_allowlist.contains(&"git".to_string()));
    }

    #[test]
    fn file_overrides_defaults_and_cli_wins() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(
            data.join("config.json"),
            r#"{"version":1,"server":{"port":4100,"max_connections":3},"terminal":{"shell":"/bin/bash"}}"#,
        )
        .unwrap();

        let cfg = DaemonConfig::load(None, None, Some(dir.path().to_path_buf()));
        assert_eq!(cfg.port, 4100);
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.shell, "/bin/bash");

        let cfg = DaemonConfig::load(Some(5000), None, Some(dir.path().to_path_buf()));
        assert_eq!(cfg.port, 5000);
    }

    #[test]
    fn explicit_config_path_sets_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, r#"{"server":{"port":4200}}"#).unwrap();
        let cfg = DaemonConfig::load(None, Some(file), Some(dir.path().to_path_buf()));
        assert_eq!(cfg.port, 4200);
        assert_eq!(cfg.data_dir, dir.path());
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("config.json"), "{ not json").unwrap();
        let cfg = DaemonConfig::load(None, None, Some(dir.path().to_path_buf()));
        assert_eq!(cfg.port, DEFAULT_PORT);
    }
}
