//! # wardend
//!
//! Warden session broker daemon: loads settings, wires the broker to its
//! collaborators, and serves the WebSocket transport until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use warden_broker::testing::{EchoTransactionService, MemoryKeyring, StaticChainRegistry};
use warden_broker::{BrokerConfig, Services, SessionBroker};
use warden_server::{DEFAULT_SHUTDOWN_TIMEOUT, ServerConfig, WardenServer};
use warden_settings::{SettingsStore, WardenSettings};

/// Chains the in-memory registry serves.
const DEFAULT_CHAINS: &[&str] = &["polkadot", "kusama"];

/// Warden session broker.
#[derive(Parser, Debug)]
#[command(name = "wardend", about = "Warden session broker")]
struct Cli {
    /// Settings file (defaults to `~/.warden/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(warden_settings::settings_path)
    }

    /// Fold command-line overrides into the loaded settings.
    fn apply(&self, settings: &mut WardenSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

/// `settings` is the effective value; `persisted` is the file layer that
/// settings changes are written back over.
fn build_services(settings: WardenSettings, persisted: WardenSettings, path: PathBuf) -> Services {
    Services {
        keyring: Arc::new(MemoryKeyring::fresh()),
        chains: Arc::new(StaticChainRegistry::new(DEFAULT_CHAINS)),
        transactions: Arc::new(EchoTransactionService::default()),
        settings: Arc::new(SettingsStore::layered(settings, persisted, Some(path))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli.settings_path();
    let persisted = warden_settings::load_file_layer(&settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;
    let mut settings = persisted.clone();
    warden_settings::apply_env_overrides(&mut settings);
    cli.apply(&mut settings);
    warden_settings::validate(&settings).context("invalid settings")?;

    warden_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    tracing::info!(path = %settings_path.display(), "settings loaded");

    let metrics = match warden_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    let broker_config = BrokerConfig::from_settings(&settings.broker);
    let server_config = ServerConfig::from_settings(&settings.server);
    let services = build_services(settings, persisted, settings_path);
    let broker = SessionBroker::new(broker_config, services)
        .await
        .context("failed to start session broker")?;

    let server = WardenServer::new(server_config, broker, metrics);
    let addr = server.listen().await.context("failed to bind server")?;
    tracing::info!(%addr, "wardend ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    server.shutdown_gracefully(DEFAULT_SHUTDOWN_TIMEOUT).await;
    tracing::info!("wardend stopped");
    Ok(())
}
