use std::process;
use std::sync::Arc;

use superstress::{run_rounds, AppConfig, SessionClient};
use tracing_subscriber::{fmt, EnvFilter};

/// Exit status for any fatal condition (authentication failure, listing
/// failure, non-success lookup status, unhandled error in a round).
const FATAL_EXIT: i32 = 77;

#[tokio::main]
async fn main() {
    // Initialise structured logging. Reads RUST_LOG environment variable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    if let Err(err) = run().await {
        eprintln!("Error: {:#}", err);
        process::exit(FATAL_EXIT);
    }
}

async fn run() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env()?;
    tracing::info!(
        url = %cfg.base_url,
        kind = %cfg.kind,
        rounds = cfg.rounds,
        batch_size = cfg.batch_size,
        ignored = cfg.ignore.len(),
        "starting consistency run"
    );

    let mut client = SessionClient::new(&cfg);
    client.authenticate().await?;

    let summary = run_rounds(Arc::new(client), &cfg).await?;
    summary.print_summary();
    Ok(())
}
