pub mod acp;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod git;
pub mod server;
pub mod terminal;
pub mod tunnel;

use std::sync::Arc;

use acp::bridge::AcpBridge;
use acp::store::AcpStore;
use acp::AcpService;
use config::DaemonConfig;
use events::EventBus;
use fs::FsService;
use git::GitService;
use server::registry::ConnectionRegistry;
use server::WsHub;
use terminal::TerminalService;
use tunnel::TunnelService;

/// The daemon's singletons, wired in dependency order:
/// event bus → stores → services → hub. Shutdown runs in reverse.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<ConnectionRegistry>,
    pub hub: Arc<WsHub>,
    pub terminal: Arc<TerminalService>,
    pub acp: Arc<AcpService>,
    pub tunnels: Arc<TunnelService>,
    reaper: tokio::task::JoinHandle<()>,
}

impl AppContext {
    /// Build every service and register it with the multiplexer.
    pub fn build(config: Arc<DaemonConfig>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ConnectionRegistry::new());

        let store = Arc::new(AcpStore::open(config.acp_data_dir()));
        let bridge = AcpBridge::new(config.clone(), bus.clone(), store);

        let terminal = TerminalService::new(config.clone(), registry.clone());
        let acp = AcpService::new(bridge);
        let tunnels = TunnelService::new(config.clone(), bus.clone());
        let fs = FsService::new(&config, registry.clone());
        let git = GitService::new(&config);

        let hub = Arc::new(WsHub::new(config.clone(), registry.clone(), bus.clone()));
        hub.register("terminal", terminal.clone());
        hub.register("acp", acp.clone());
        hub.register("tunnels", tunnels.clone());
        hub.register("fileSystem", fs);
        hub.register("git", git);

        let reaper = terminal.spawn_reaper();

        Arc::new(Self {
            config,
            bus,
            registry,
            hub,
            terminal,
            acp,
            tunnels,
            reaper,
        })
    }

    /// Drain and stop everything, reverse of construction order.
    pub async fn shutdown(&self) {
        self.reaper.abort();
        self.tunnels.shutdown().await;
        self.acp.bridge().teardown().await;
        self.terminal.shutdown().await;
    }
}
