//! # kvlink - Interactive Console
//!
//! Entry point for the interactive client. It:
//! 1. Initializes logging using env_logger (`RUST_LOG` controls verbosity)
//! 2. Loads configuration, with command-line flags overriding the optional
//!    TOML file, which overrides the defaults
//! 3. Creates a multi-threaded Tokio runtime (the keepalive monitor keeps
//!    ticking on worker threads while the prompt blocks on stdin)
//! 4. Connects the session and either starts the prompt or runs the single
//!    command given on the command line
//!
//! Exit codes follow the stable taxonomy: 0 success, 1 server-reported
//! error, 2 not-connected/needs-reconnect, 3 lock not acquired.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use kvlink::config::Config;
use kvlink::console;
use kvlink::session::{Session, SessionConfig};

/// Interactive console for RESP-style key-value servers
#[derive(Parser, Debug)]
#[command(name = "kvlink", version, about)]
struct Cli {
    /// Server hostname or IP
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Auth token sent via AUTH after connecting
    #[arg(short = 'a', long)]
    auth: Option<String>,

    /// Database index selected after connecting
    #[arg(short = 'n', long)]
    db: Option<u32>,

    /// Keepalive probe interval in seconds (0 disables it)
    #[arg(short = 'k', long)]
    keepalive: Option<u64>,

    /// Path to a TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Run this single command and exit instead of starting the prompt
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
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

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let session = Session::new(SessionConfig::from(&config));

    if let Err(e) = runtime.block_on(session.connect()) {
        eprintln!("(error) {}", e);
        std::process::exit(e.exit_code());
    }

    let code = if cli.command.is_empty() {
        console::run_interactive(runtime.handle(), &session)
    } else {
        console::run_command(runtime.handle(), &session, &cli.command.join(" "))
    };

    runtime.block_on(session.disconnect());
    std::process::exit(code)
}
