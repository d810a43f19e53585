//! posewatch_api - query API over an existing detection database
//!
//! This daemon:
//! 1. Opens the detection database
//! 2. Serves the read-only query API
//! 3. Does NOT ingest camera streams

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use posewatch::{
    api::{ApiServer, ApiServerConfig},
    ApiConfig, DetectionStore,
};

#[derive(Parser, Debug)]
#[command(name = "posewatch_api", about = "Serve pose detections over HTTP")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "POSEWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = ApiConfig::load_from(args.config.as_deref())?;

    let store = Arc::new(
        DetectionStore::open(&cfg.db_path, cfg.pool_size)
            .with_context(|| format!("open detection database {}", cfg.db_path))?,
    );
    let api_handle = ApiServer::new(
        ApiServerConfig {
            addr: cfg.addr.clone(),
        },
        store.clone(),
    )
    .spawn()?;
    log::info!("posewatch_api running. serving {}", cfg.db_path);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("posewatch_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    store.close();

    Ok(())
}
