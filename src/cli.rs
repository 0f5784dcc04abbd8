use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use url::Url;

use crate::client::{ClientOptions, Compression, FeedClient};
use crate::dispatch::{Dispatcher, DispatcherOptions};
use crate::feed::feed;
use crate::throttle::{Throttler, ThrottlerOptions};

/// CLI for docfeed: feed JSON document operations to a document store.
#[derive(Parser)]
#[clap(
    name = "docfeed",
    version,
    about = "Feed JSON document operations to a document-store HTTP API with adaptive concurrency"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Feed documents from a JSON array or JSONL file ('-' reads stdin)
    Feed {
        /// Input file
        file: PathBuf,

        /// Base URL of the document store
        #[clap(long, env = "DOCFEED_TARGET", default_value = "http://127.0.0.1:8080")]
        target: Url,

        /// HTTP connections to round-robin requests across
        #[clap(long, default_value_t = 8)]
        connections: usize,

        /// Request body compression
        #[clap(long, value_enum, default_value = "auto")]
        compression: CompressionArg,

        /// Per-request timeout
        #[clap(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Ceiling for the adaptive concurrency window
        #[clap(long, default_value_t = 256)]
        max_inflight: usize,

        /// Queue capacity between decoding and dispatch
        #[clap(long, default_value_t = 256)]
        queue: usize,

        /// Give up draining on shutdown after this long
        #[clap(long, value_parser = humantime::parse_duration)]
        drain_timeout: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CompressionArg {
    Auto,
    Always,
    Never,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Auto => Compression::Auto,
            CompressionArg::Always => Compression::Always,
            CompressionArg::Never => Compression::Never,
        }
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Feed {
            file,
            target,
            connections,
            compression,
            timeout,
            max_inflight,
            queue,
            drain_timeout,
        } => {
            let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
                Box::new(BufReader::new(io::stdin()))
            } else {
                let opened = File::open(&file)
                    .with_context(|| format!("failed to open feed input {}", file.display()))?;
                Box::new(BufReader::new(opened))
            };

            let client = Arc::new(FeedClient::with_connections(
                ClientOptions {
                    base_url: target.clone(),
                    timeout,
                    compression: compression.into(),
                },
                connections,
            )?);
            let throttler = Arc::new(Throttler::with_options(ThrottlerOptions {
                max_window: max_inflight,
                ..Default::default()
            }));
            let dispatcher = Dispatcher::new(
                client,
                throttler,
                DispatcherOptions {
                    queue_capacity: queue,
                    drain_timeout,
                },
            );

            info!(target = %target, connections, max_inflight, "feeding starts");
            let report = feed(reader, &dispatcher).await?;
            let drained = dispatcher.close().await;

            let summary = dispatcher.stats().summary(dispatcher.elapsed());
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("failed to render summary")?
            );
            if report.skipped > 0 {
                eprintln!(
                    "[WARN] {} input operation(s) failed to decode and were skipped",
                    report.skipped
                );
            }

            // Per-document failures are reported in the summary only; a
            // non-zero error count is not fatal to the process.
            drained.map_err(|e| anyhow::Error::new(e).context("shutdown incomplete"))
        }
    }
}
