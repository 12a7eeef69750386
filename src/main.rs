mod admin;
mod app;
mod auth;
mod config;
mod http;
mod registry;
mod relay;
mod state;
mod tls;
mod tunnel;

use clap::Parser;

use config::{Config, ConfigFile};

/// Default config file name.
const DEFAULT_CONFIG: &str = "medlink-relay.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    // Load config file values as env-var defaults (before clap parsing)
    let config_path =
        std::env::var("MEDLINK_RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = std::path::Path::new(&config_path);
    let mut hospitals = Vec::new();
    if config_path.exists() {
        let file_cfg = ConfigFile::load(config_path)?;
        file_cfg.inject_env();
        hospitals = file_cfg.hospitals;
    }

    let config = Config::parse();
    app::run(config, hospitals).await
}
