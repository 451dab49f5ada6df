//! Folio sync server.
//!
//! ```text
//! folio-server [--config PATH] [--bind ADDR] [--storage PATH]
//! ```
//!
//! Flags override values from the TOML config file.

use clap::Parser;
use folio_collab::{ServerConfig, SyncServer};
use log::info;
use std::path::PathBuf;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(version, about = "Folio collaborative document server", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind, e.g. 0.0.0.0:9090
    #[arg(short, long)]
    bind: Option<String>,

    /// RocksDB directory; rooms are kept in memory only when absent
    #[arg(short, long)]
    storage: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<ServerConfig, BoxError> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
            toml::from_str::<ServerConfig>(&text).map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => ServerConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(storage) = &cli.storage {
        config.storage_path = Some(storage.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!("Starting Folio server on {}...", config.bind_addr);
    match &config.storage_path {
        Some(path) => info!("Persisting rooms to {}", path.display()),
        None => info!("No storage path configured; rooms are not persisted"),
    }

    let server = SyncServer::new(config)?;
    server.run().await
}
