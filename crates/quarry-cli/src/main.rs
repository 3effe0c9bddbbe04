//! # Quarry CLI Entry Point
//!
//! Main binary for the Quarry search-cluster client.
//!
//! ## Usage
//!
//! ```bash
//! # Send a request, failing over between two nodes
//! quarry call -n http://127.0.0.1:9200 -n http://127.0.0.1:9201 GET /_cluster/health
//!
//! # Index a document, discovering the rest of the cluster first
//! quarry call -n http://127.0.0.1:9200 --sniff-on-start -d '{"title": "rust"}' POST /books/_doc
//!
//! # Check whether an index exists
//! quarry exists -n http://127.0.0.1:9200 /books
//!
//! # Show the discovered cluster and node health as JSON
//! quarry sniff -n http://127.0.0.1:9200
//! ```
//!
//! Set `RUST_LOG=debug` to see every attempt.

use anyhow::Result;
use bytes::Bytes;
use quarry_cli::{
    parse_method, parse_query, parse_seeds, parse_statuses, CallArgs, Cli, Commands, ExistsArgs,
    SniffArgs,
};
use quarry_common::TransportError;
use quarry_transport::{RequestOptions, Transport};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Set default log level to INFO, but allow RUST_LOG env var to override.
    // Logs go to stderr so stdout stays clean for piping.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Call(args) => call(args).await,
        Commands::Exists(args) => exists(args).await,
        Commands::Sniff(args) => sniff(args).await,
    }
}

async fn call(args: CallArgs) -> Result<()> {
    let seeds = parse_seeds(&args.nodes)?;
    let transport = Transport::new(seeds, args.transport_config()?)?;
    let method = parse_method(&args.method)?;

    // Ctrl-C aborts the in-flight attempt and skips the remaining retries
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling request");
                cancel.cancel();
            }
        });
    }

    let mut options = RequestOptions::default().with_cancellation(cancel);
    options.query = parse_query(&args.query)?;
    options.ignore_statuses = parse_statuses(&args.ignore_status)?;

    let body = args.data.map(Bytes::from);
    match transport
        .perform_request(method, &args.path, body, options)
        .await
    {
        Ok(response) => {
            println!("{}", response.text());
            Ok(())
        }
        Err(e) => {
            if let TransportError::NodeResponse { body, .. } = &e {
                if !body.is_empty() {
                    eprintln!("{}", String::from_utf8_lossy(body));
                }
            }
            Err(e.into())
        }
    }
}

async fn exists(args: ExistsArgs) -> Result<()> {
    let seeds = parse_seeds(&args.nodes)?;
    let transport = Transport::new(seeds, args.transport_config()?)?;

    let found = transport.exists(&args.path).await?;
    println!("{}", found);
    Ok(())
}

async fn sniff(args: SniffArgs) -> Result<()> {
    let seeds = parse_seeds(&args.nodes)?;
    let transport = Transport::new(seeds, args.transport_config()?)?;

    let update = transport.sniff().await?;
    let report = json!({
        "update": update,
        "nodes": transport.pool().status(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
