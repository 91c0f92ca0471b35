// src/main.rs

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use camhub::config::Config;
use camhub::engine::TestPatternEngine;
use camhub::server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("camhub v{VERSION}");
        return Ok(());
    }

    let config = match args.iter().position(|a| a == "--config") {
        Some(idx) => {
            let path = args.get(idx + 1).map(String::as_str).ok_or_else(|| {
                anyhow::anyhow!("--config requires a file path argument")
            })?;
            Config::from_file(path)?
        }
        None => Config::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    info!(version = VERSION, "starting camhub arbiter");
    if std::fs::create_dir_all(&config.socket_dir).is_err() {
        warn!(dir = %config.socket_dir.display(), "could not create socket directory");
    }

    // The built-in synthetic engine; a real deployment links its own
    // CameraEngine implementation and embeds server::Server directly.
    let engine = Arc::new(TestPatternEngine::default());
    server::run(config, engine).await
}
