use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use otgd::{config::DaemonConfig, AppContext};
use tracing::{info, warn};

/// Exit codes: 0 clean, 1 configuration error, 2 port in use after the
/// fallback attempt, 3 unrecoverable server error, 130 SIGINT.
const EXIT_CONFIG: i32 = 1;
const EXIT_PORT_IN_USE: i32 = 2;
const EXIT_SERVER: i32 = 3;
const EXIT_SIGINT: i32 = 130;

#[derive(Parser)]
#[command(
    name = "otgd",
    about = "On-The-Go daemon — control a workstation from a mobile browser",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket/HTTP server port
    #[arg(long, env = "KIRO_PORT", global = true)]
    port: Option<u16>,

    /// Path to config.json (default: ./.on-the-go/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "KIRO_LOG", global = true)]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "KIRO_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the ./.on-the-go/ directory with a starter config.
    ///
    /// Lays out config.json, prompts/, results/, and a README. Safe to
    /// re-run: existing files are never overwritten.
    ///
    /// Examples:
    ///   otgd init
    ///   otgd init /path/to/workspace
    Init {
        /// Workspace to initialize (default: current directory)
        path: Option<PathBuf>,
    },
    /// Run the daemon in the foreground (default when no subcommand given).
    ///
    /// Examples:
    ///   otgd start
    ///   otgd start --port 4100 --config ./custom/config.json
    Start,
    /// Signal a running daemon to exit.
    ///
    /// Finds the daemon by PID file, falling back to a localhost health
    /// ping to report whether one is running at all.
    ///
    /// Examples:
    ///   otgd stop
    Stop,
    /// Print server status (port, connections, uptime).
    ///
    /// Exit code 0 when a daemon is running, 1 otherwise.
    ///
    /// Examples:
    ///   otgd status
    ///   otgd status --json
    Status {
        /// Output as JSON (for piping)
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(log: Option<String>, log_file: Option<PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = log
        .and_then(|l| EnvFilter::try_new(l).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "otgd.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log.clone(), args.log_file.clone());

    match args.command {
        Some(Command::Init { path }) => run_init(path),
        Some(Command::Stop) => run_stop(args.port, args.config).await,
        Some(Command::Status { json }) => run_status(args.port, args.config, json).await,
        Some(Command::Start) | None => run_server(args.port, args.config).await,
    }
}

// ── otgd init ─────────────────────────────────────────────────────────────────

fn run_init(path: Option<PathBuf>) -> Result<()> {
    let workspace = path
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let data_dir = workspace.join(otgd::config::DATA_DIR_NAME);

    std::fs::create_dir_all(data_dir.join("prompts"))?;
    std::fs::create_dir_all(data_dir.join("results"))?;

    let config_path = data_dir.join("config.json");
    if !config_path.exists() {
        let starter = serde_json::json!({
            "version": 1,
            "server": { "port": 3900, "host": "127.0.0.1" },
            "terminal": {},
            "prompts": { "dir": "prompts" },
            "results": { "dir": "results" },
        });
        std::fs::write(&config_path, serde_json::to_string_pretty(&starter)?)?;
    }

    let readme = data_dir.join("README.md");
    if !readme.exists() {
        std::fs::write(
            &readme,
            "# .on-the-go\n\n\
             Daemon state for this workspace.\n\n\
             - `config.json` — server, terminal, and service settings\n\
             - `prompts/` — saved prompt templates\n\
             - `results/` — exported session results\n\
             - `acp/` — agent session and thread state (managed)\n",
        )?;
    }

    println!("Initialized {}", data_dir.display());
    Ok(())
}

// ── otgd start ────────────────────────────────────────────────────────────────

/// What ended the serve loop.
enum ShutdownReason {
    Interrupt,
    Terminate,
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (all platforms).
async fn shutdown_signal() -> ShutdownReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
            _ = sigterm.recv() => ShutdownReason::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        ShutdownReason::Interrupt
    }
}

/// Probe a port; on AddrInUse fall back to `port + 1` exactly once.
fn pick_port(host: &str, port: u16) -> Result<u16, i32> {
    for (attempt, candidate) in [port, port.wrapping_add(1)].into_iter().enumerate() {
        match std::net::TcpListener::bind((host, candidate)) {
            Ok(probe) => {
                drop(probe);
                if attempt > 0 {
                    warn!(port = candidate, "configured port busy — using fallback");
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => {
                eprintln!("cannot bind {host}:{candidate}: {e}");
                return Err(EXIT_CONFIG);
            }
        }
    }
    eprintln!("port {port} (and fallback) already in use");
    Err(EXIT_PORT_IN_USE)
}

async fn run_server(port: Option<u16>, config_path: Option<PathBuf>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "otgd starting");

    let mut config = DaemonConfig::load(port, config_path, None);
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        eprintln!("cannot create data dir {}: {e}", config.data_dir.display());
        std::process::exit(EXIT_CONFIG);
    }

    config.port = match pick_port(&config.host.clone(), config.port) {
        Ok(p) => p,
        Err(code) => std::process::exit(code),
    };

    let config = Arc::new(config);
    info!(
        workspace = %config.workspace_root.display(),
        port = config.port,
        max_connections = config.max_connections,
        "config loaded"
    );

    let ctx = AppContext::build(config.clone());

    // PID file so `otgd stop` can find us.
    let pid_file = config.pid_file();
    if let Err(e) = std::fs::write(&pid_file, std::process::id().to_string()) {
        warn!(err = %e, "cannot write pid file");
    }

    if config.acp_autostart && !config.acp_autostart_agents.is_empty() {
        let acp = ctx.acp.clone();
        let agents = config.acp_autostart_agents.clone();
        tokio::spawn(async move { acp.autostart(&agents).await });
    }

    let reason = Arc::new(std::sync::Mutex::new(None::<ShutdownReason>));
    let reason_slot = reason.clone();
    let shutdown = async move {
        let r = shutdown_signal().await;
        *reason_slot.lock().unwrap() = Some(r);
    };

    let result = otgd::server::run(ctx.hub.clone(), shutdown).await;

    info!("draining services");
    ctx.shutdown().await;
    let _ = std::fs::remove_file(&pid_file);

    if let Err(e) = result {
        eprintln!("server error: {e:#}");
        std::process::exit(EXIT_SERVER);
    }
    if matches!(*reason.lock().unwrap(), Some(ShutdownReason::Interrupt)) {
        std::process::exit(EXIT_SIGINT);
    }
    Ok(())
}

// ── otgd stop / status ────────────────────────────────────────────────────────

async fn fetch_health(config: &DaemonConfig) -> Option<serde_json::Value> {
    let url = format!("http://{}:{}/health", config.host, config.port);
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(2))
        .send()
        .await
        .ok()?;
    response.json().await.ok()
}

async fn run_stop(port: Option<u16>, config_path: Option<PathBuf>) -> Result<()> {
    let config = DaemonConfig::load(port, config_path, None);

    let pid = std::fs::read_to_string(config.pid_file())
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());

    match pid {
        Some(pid) => {
            #[cfg(unix)]
            {
                // SAFETY: pid read from our own pid file.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            #[cfg(not(unix))]
            {
                eprintln!("stop by pid is unsupported on this platform (pid {pid})");
                std::process::exit(1);
            }

            // Wait for the health endpoint to stop answering.
            for _ in 0..20 {
                if fetch_health(&config).await.is_none() {
                    println!("stopped");
                    return Ok(());
                }
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            eprintln!("daemon did not exit");
            std::process::exit(1);
        }
        None => {
            if fetch_health(&config).await.is_some() {
                eprintln!(
                    "daemon is running on port {} but no pid file was found",
                    config.port
                );
                std::process::exit(1);
            }
            println!("not running");
            Ok(())
        }
    }
}

async fn run_status(port: Option<u16>, config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let config = DaemonConfig::load(port, config_path, None);
    match fetch_health(&config).await {
        Some(health) => {
            if json {
                println!("{health}");
            } else {
                println!("otgd running");
                println!("  port:        {}", health["port"]);
                println!("  version:     {}", health["version"].as_str().unwrap_or("?"));
                println!("  uptime:      {}s", health["uptime"]);
                println!("  connections: {}", health["connections"]);
            }
            Ok(())
        }
        None => {
            if json {
                println!("{}", serde_json::json!({ "status": "stopped" }));
            } else {
                println!("otgd is not running on port {}", config.port);
            }
            std::process::exit(1);
        }
    }
}
