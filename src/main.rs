use anyhow::Result;
use clap::Parser;

use docfeed::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so the summary on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse()).await
}
