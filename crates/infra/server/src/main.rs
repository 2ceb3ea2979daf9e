//! Tripwire worker binary.
//!
//! Usage: `tripwire-worker [config.toml]`. Reads newline-delimited JSON
//! events from stdin. After stdin closes the worker stays up until pending
//! retries are delivered or given up on; Ctrl-C stops it at any time.

use std::str::FromStr;
use tokio::io::BufReader;
use tracing::Level;
use tripwire_server::{Worker, load_config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "tripwire.toml".to_string());

    // Load configuration
    let config = load_config(&path)?;

    // Initialize tracing
    let level = Level::from_str(&config.worker.log_level).unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let worker = Worker::build(config).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    worker.run(BufReader::new(tokio::io::stdin()), shutdown).await?;

    Ok(())
}
