mod config;
mod serve;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use resman_core::manager::ResourceManager;
use resman_store::memory::MemoryStore;

use config::{default_config_path, read_config, write_default_config};
use upstream::{LoggingClusterClient, StaticFrameworkInfo};

#[derive(Parser)]
#[command(name = "resmand", about = "Cluster workload resource manager")]
struct Cli {
    /// Config file path (defaults to ./resmand.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the resource-manager service
    Serve {
        /// Listen address (overrides RESMAN_BIND and the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Listen port (overrides RESMAN_PORT and the config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Init { force } => {
            write_default_config(&config_path, force)?;
            println!("wrote {}", config_path.display());
            Ok(())
        }
        Commands::Serve { bind, port } => {
            let file = read_config(&config_path)?;
            let resolved = file.resolve(bind, port);

            let store = Arc::new(MemoryStore::new());
            store.set_pools(resolved.pools.clone());

            let manager = ResourceManager::new(
                store.clone(),
                store.clone(),
                store,
                Arc::new(LoggingClusterClient),
                Arc::new(StaticFrameworkInfo {
                    stream_id: resolved.framework.stream_id.clone(),
                    framework_id: resolved.framework.framework_id.clone(),
                }),
                resolved.manager,
            )
            .await
            .context("failed to build resource manager")?;
            manager.start();

            let result = serve::run_serve(manager.handler(), &resolved.bind, resolved.port).await;
            manager.stop();
            result
        }
    }
}
