//! Line relay server - Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:12345, database at data/chat_server.db
//! line_relay
//!
//! # JSON config file, with flags applied on top
//! line_relay --config relay.json --bind 127.0.0.1:9000 --no-echo
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use line_relay::{ChatServer, PersistenceQueue, ServerConfig, SqliteStore};

/// Time allowed for queued history writes after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Line-oriented chat relay server
#[derive(Parser, Debug)]
#[command(name = "line_relay")]
#[command(about = "Line-oriented TCP chat relay server")]
#[command(version)]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(short, long)]
    bind: Option<String>,

    /// SQLite database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Seconds of silence before a connection is closed (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Do not echo broadcasts back to the sender
    #[arg(long)]
    no_echo: bool,

    /// Bad first lines tolerated before a connection is closed
    #[arg(long)]
    max_handshake_failures: Option<u32>,

    /// Longest accepted line in bytes; longer lines close the connection
    #[arg(long)]
    max_line_bytes: Option<usize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "line_relay=info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(db) = self.db {
            config.db_path = db;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if self.no_echo {
            config.echo_to_sender = false;
        }
        if let Some(max) = self.max_handshake_failures {
            config.max_handshake_failures = max;
        }
        if let Some(max) = self.max_line_bytes {
            config.max_line_bytes = max;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = args.into_config()?;

    let store = Arc::new(SqliteStore::open(&config.db_path).await?);
    info!("Database opened at {}", config.db_path.display());

    let (persistence, worker) = PersistenceQueue::spawn(store.clone(), config.persistence_queue);
    let server = ChatServer::bind(config, store, persistence).await?;
    info!("Listening on {}", server.local_addr()?);

    tokio::select! {
        _ = server.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        }
    }

    // Open connections still hold queue handles, so only wait briefly
    match tokio::time::timeout(SHUTDOWN_GRACE, worker).await {
        Ok(Err(e)) => error!("Persistence worker failed: {}", e),
        Ok(Ok(())) => {}
        Err(_) => info!("Persistence worker still busy, exiting"),
    }

    Ok(())
}
