//! Caching file proxy: serve files from a remote origin through a bounded
//! local cache with check-on-open consistency.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::error;

mod app_config;
mod trc;

use crate::app_config::Config;
use proxyfs::cache::Cache;
use proxyfs::origin::OriginServer;
use proxyfs::rpc::client::OriginClient;
use proxyfs::{dispatcher, origin};

#[derive(Parser)]
#[command(version, about = "A caching file proxy with check-on-open consistency.")]
struct Args {
    #[arg(short, long, value_parser, help = "Optional path to a config TOML.")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the caching proxy.
    Serve,
    /// Run the authoritative origin server.
    Origin,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Load config first — errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    trc::init();

    let result = match args.command {
        Command::Serve => spawn(run_proxy(config)),
        Command::Origin => spawn(run_origin(config)),
    };
    if let Err(e) = result {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

type FatalError = Box<dyn std::error::Error>;

fn spawn(task: impl Future<Output = Result<(), FatalError>>) -> Result<(), FatalError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(task)
}

async fn run_proxy(config: Config) -> Result<(), FatalError> {
    let cache = Arc::new(
        Cache::new(&config.proxy.cache_dir, config.proxy.cache_capacity.as_u64()).await?,
    );
    let origin = Arc::new(OriginClient::connect(config.proxy.origin.as_str()).await?);
    let listener = TcpListener::bind(config.proxy.listen.as_str()).await?;
    dispatcher::serve(listener, cache, origin).await?;
    Ok(())
}

async fn run_origin(config: Config) -> Result<(), FatalError> {
    let server = Arc::new(OriginServer::new(config.origin.root).await?);
    let listener = TcpListener::bind(config.origin.listen.as_str()).await?;
    origin::serve(listener, server).await?;
    Ok(())
}
