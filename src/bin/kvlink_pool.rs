//! # kvlink-pool - Pooling Relay
//!
//! Binds one public local endpoint and relays each accepted client over the
//! first free member of a fixed-size pool of supervised upstream sessions.
//! Exits 0 on a clean shutdown and non-zero on fatal setup failure, such as
//! being unable to bind the public endpoint.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use kvlink::config::Config;
use kvlink::pool::{Endpoint, Pool};

/// Connection-pooling byte relay for RESP-style key-value servers
#[derive(Parser, Debug)]
#[command(name = "kvlink-pool", version, about)]
struct Cli {
    /// Upstream server hostname or IP
    #[arg(long)]
    host: Option<String>,

    /// Upstream server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Auth token each pool member sends after connecting
    #[arg(short = 'a', long)]
    auth: Option<String>,

    /// Database index each pool member selects after connecting
    #[arg(short = 'n', long)]
    db: Option<u32>,

    /// Keepalive probe interval in seconds (0 disables it)
    #[arg(short = 'k', long)]
    keepalive: Option<u64>,

    /// Number of upstream connections to maintain
    #[arg(short = 's', long)]
    pool_size: Option<usize>,

    /// Path to a TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Public endpoint: a numeric value binds that loopback TCP port,
    /// anything else names a Unix domain socket path
    endpoint: String,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    // Configuration priority: command line > file > defaults
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(auth) = cli.auth {
        config.auth_token = Some(auth);
    }
    if let Some(db) = cli.db {
        config.db_index = db;
    }
    if let Some(keepalive) = cli.keepalive {
        config.keepalive_seconds = keepalive;
    }
    if let Some(size) = cli.pool_size {
        config.pool_size = size;
    }

    let endpoint = Endpoint::parse(&cli.endpoint)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let pool = Pool::bind(config, &endpoint)
            .await
            .context("failed to bind the public endpoint")?;

        tokio::select! {
            result = pool.run() => result.map_err(Into::into),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping relay");
                Ok(())
            }
        }
    })
}
