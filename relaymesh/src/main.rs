mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use relaymesh_sfu::{ConnectionSupervisor, LoopbackEngine, SfuManager};

use config::{Config, CONFIG_PATH_ENV};
use server::{RelayMeshServer, ShutdownReason};

#[derive(Parser, Debug)]
#[command(name = "relaymesh")]
#[command(about = "RelayMesh SFU signaling server", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./config.yaml when present)
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("relaymesh starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Start the media engine and the SFU on top of it
    let engine = Arc::new(LoopbackEngine::new());
    let manager = SfuManager::start(config.sfu.clone(), engine).await?;
    let supervisor = ConnectionSupervisor::new(manager);
    let _monitor = supervisor.spawn_monitor();
    info!("SFU initialized");

    // 5. Serve until shutdown
    match RelayMeshServer::new(config, supervisor).run().await? {
        ShutdownReason::Signal => {
            info!("relaymesh stopped");
            Ok(())
        }
        ShutdownReason::ServerStopped => Err(anyhow::anyhow!("HTTP server stopped unexpectedly")),
        ShutdownReason::Fatal(reason) => Err(anyhow::anyhow!("terminated after fatal failure: {reason}")),
    }
}
