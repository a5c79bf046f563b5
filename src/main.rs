// Zenfeed daemon: load config, open the engine, run until interrupted.
//
// Exit codes: 0 clean shutdown, 1 configuration error, 2 storage
// corruption unrecoverable on startup, 3 forced shutdown timeout.

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;
use zenfeed::atoms::constants::{EXIT_CONFIG, EXIT_CORRUPTION, EXIT_FORCED_SHUTDOWN, EXIT_OK};
use zenfeed::{AppConfig, Engine, EngineError};

#[derive(Parser, Debug)]
#[command(name = "zenfeed", version, about = "Feed intelligence engine")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "zenfeed.toml", env = "ZENFEED_CONFIG")]
    config: PathBuf,

    /// Override the configured data directory.
    #[arg(long, env = "ZENFEED_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// How long to wait for in-flight work on shutdown.
    #[arg(long, default_value = "30", env = "ZENFEED_SHUTDOWN_TIMEOUT_SECS")]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    std::process::exit(run(Args::parse()).await);
}

async fn run(args: Args) -> i32 {
    let text = match std::fs::read_to_string(&args.config) {
        Ok(t) => t,
        Err(e) => {
            error!("cannot read config {}: {}", args.config.display(), e);
            return EXIT_CONFIG;
        }
    };
    let mut config = match AppConfig::from_toml_str(&text) {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return EXIT_CONFIG;
        }
    };
    if let Some(dir) = args.data_dir {
        config.engine.data_dir = dir;
    }

    let engine = match Engine::new(config) {
        Ok(e) => e,
        Err(e @ EngineError::Config(_)) => {
            error!("startup failed: {}", e);
            return EXIT_CONFIG;
        }
        Err(e) => {
            error!("startup failed: {}", e);
            return EXIT_CORRUPTION;
        }
    };

    engine.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = engine.wait() => {}
    }
    engine.cancel_token().cancel();

    let timeout = Duration::from_secs(args.shutdown_timeout_secs);
    match tokio::time::timeout(timeout, engine.shutdown()).await {
        Ok(Ok(())) => EXIT_OK,
        Ok(Err(e)) => {
            error!("shutdown error: {}", e);
            EXIT_CORRUPTION
        }
        Err(_) => {
            error!("shutdown exceeded {:?}, forcing exit", timeout);
            EXIT_FORCED_SHUTDOWN
        }
    }
}
