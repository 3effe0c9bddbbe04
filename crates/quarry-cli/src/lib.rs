// Copyright 2025 Quarry Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Quarry CLI
//!
//! Command-line front end for the Quarry transport.
//!
//! ## Key Commands
//!
//! - `quarry call`: send one request to the cluster and print the body
//! - `quarry exists`: `HEAD` a path and print whether it exists
//! - `quarry sniff`: discover the cluster and print every node's health
//!
//! Argument parsing uses `argh`; everything here maps flags onto a
//! [`TransportConfig`] and leaves the actual work to `quarry-transport`.

use anyhow::{anyhow, bail, Context, Result};
use argh::FromArgs;
use hyper::{Method, StatusCode};
use quarry_common::NodeAddress;
use quarry_transport::{
    BackoffConfig, PoolConfig, RetryConfig, Selector, SniffConfig, TransportConfig,
};
use std::time::Duration;


/// Validates that a URL string starts with http:// or https://
///
/// # Arguments
///
/// * `url` - The URL string to validate
/// * `description` - Human-readable description of what the URL is for
///
/// # Errors
///
/// Returns an error if the URL doesn't start with http:// or https://
pub fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// Parses the `--node` flags into seed addresses.
pub fn parse_seeds(nodes: &[String]) -> Result<Vec<NodeAddress>> {
    if nodes.is_empty() {
        bail!("at least one --node is required");
    }
    nodes
        .iter()
        .map(|node| {
            validate_http_url(node, "node address")?;
            NodeAddress::parse(node).with_context(|| format!("bad node address '{}'", node))
        })
        .collect()
}

/// Parses an HTTP method name, case-insensitively.
pub fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| anyhow!("invalid HTTP method '{}'", method))
}

pub fn parse_statuses(codes: &[u16]) -> Result<Vec<StatusCode>> {
    codes
        .iter()
        .map(|&code| {
            StatusCode::from_u16(code).map_err(|_| anyhow!("invalid HTTP status {}", code))
        })
        .collect()
}

/// Parses `key=value` query parameters.
pub fn parse_query(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(anyhow!("query parameter '{}' must look like key=value", pair)),
        })
        .collect()
}

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs, Debug)]
/// Quarry - pooled, retrying client for search clusters
pub struct Cli {
    #[argh(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands.
#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Call(CallArgs),
    Exists(ExistsArgs),
    Sniff(SniffArgs),
}

/// Arguments for sending one request.
///
/// The response body is written to stdout unchanged, so the output can be
/// piped into `jq` and friends. Logs go to stderr.
///
/// # Example
///
/// ```bash
/// quarry call -n http://127.0.0.1:9200 -n http://127.0.0.1:9201 \
///   GET /_cluster/health
///
/// quarry call -n http://127.0.0.1:9200 -d '{"title": "rust"}' \
///   POST /books/_doc -q refresh=true
/// ```
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "call")]
/// send one request to the cluster
pub struct CallArgs {
    /// HTTP method (GET, POST, PUT, DELETE, HEAD, ...)
    #[argh(positional)]
    pub method: String,

    /// request path, e.g. /_cluster/health
    #[argh(positional)]
    pub path: String,

    /// node to connect to, repeatable
    ///
    /// Must include the http:// or https:// prefix (e.g., http://127.0.0.1:9200).
    #[argh(option, short = 'n', long = "node")]
    pub nodes: Vec<String>,

    /// request body, sent as application/json
    #[argh(option, short = 'd', long = "data")]
    pub data: Option<String>,

    /// query parameter as key=value, repeatable
    #[argh(option, short = 'q', long = "query")]
    pub query: Vec<String>,

    /// status to treat as success, repeatable
    #[argh(option, long = "ignore-status")]
    pub ignore_status: Vec<u16>,

    /// total attempts per request. Defaults to 3.
    #[argh(option, long = "retries", default = "3")]
    pub retries: usize,

    /// per-attempt timeout in milliseconds. Defaults to 10000ms.
    #[argh(option, long = "timeout-ms", default = "10000")]
    pub timeout_ms: u64,

    /// node selection strategy: round-robin or random
    #[argh(option, long = "selector", default = "\"round-robin\".into()")]
    pub selector: String,

    /// status that is retried on another node, repeatable
    ///
    /// Defaults to 502, 503 and 504 when not given.
    #[argh(option, long = "retry-on-status")]
    pub retry_on_status: Vec<u16>,

    /// return timeouts immediately instead of retrying them
    #[argh(switch, long = "no-retry-on-timeout")]
    pub no_retry_on_timeout: bool,

    /// shuffle the node list before the first request
    #[argh(switch, long = "randomize")]
    pub randomize: bool,

    /// discover the cluster before the first request
    #[argh(switch, long = "sniff-on-start")]
    pub sniff_on_start: bool,

    /// rediscover the cluster after a node fails
    #[argh(switch, long = "sniff-on-failure")]
    pub sniff_on_failure: bool,

    /// base delay in seconds before a failed node is retried. Defaults to 60.
    #[argh(option, long = "dead-timeout-secs", default = "60")]
    pub dead_timeout_secs: u64,
}

/// Arguments for checking whether a path exists.
///
/// # Example
///
/// ```bash
/// quarry exists -n http://127.0.0.1:9200 /books
/// ```
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "exists")]
/// check whether a path exists with HEAD
pub struct ExistsArgs {
    /// path to check, e.g. /books
    #[argh(positional)]
    pub path: String,

    /// node to connect to, repeatable
    #[argh(option, short = 'n', long = "node")]
    pub nodes: Vec<String>,

    /// per-attempt timeout in milliseconds. Defaults to 10000ms.
    #[argh(option, long = "timeout-ms", default = "10000")]
    pub timeout_ms: u64,
}

/// Arguments for a one-off discovery round.
///
/// Prints what changed and the health of every node as JSON.
///
/// # Example
///
/// ```bash
/// quarry sniff -n http://127.0.0.1:9200
/// ```
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "sniff")]
/// discover the cluster and print node health
pub struct SniffArgs {
    /// node to ask, repeatable
    #[argh(option, short = 'n', long = "node")]
    pub nodes: Vec<String>,

    /// discovery request timeout in milliseconds. Defaults to 1000ms.
    #[argh(option, long = "timeout-ms", default = "1000")]
    pub timeout_ms: u64,

    /// keep dedicated master nodes in the node list
    #[argh(switch, long = "include-masters")]
    pub include_masters: bool,
}

impl CallArgs {
    /// Maps the flags onto a transport configuration.
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let mut retry = RetryConfig {
            retries: self.retries,
            retry_on_timeout: !self.no_retry_on_timeout,
            timeout: Duration::from_millis(self.timeout_ms),
            ..Default::default()
        };
        if !self.retry_on_status.is_empty() {
            retry.retry_on_status = parse_statuses(&self.retry_on_status)?;
        }

        let pool = PoolConfig::default()
            .with_selector(Selector::from_name(&self.selector)?)
            .with_randomized_nodes(self.randomize)
            .with_backoff(BackoffConfig {
                base_delay: Duration::from_secs(self.dead_timeout_secs),
                factor: 2.0,
                // five doublings, like the default 60s/1920s pair
                max_delay: Duration::from_secs(self.dead_timeout_secs.saturating_mul(32)),
            });

        let sniff = SniffConfig::default()
            .with_on_start(self.sniff_on_start)
            .with_on_failure(self.sniff_on_failure);

        let config = TransportConfig::default()
            .with_pool(pool)
            .with_retry(retry)
            .with_sniff(sniff);
        config.validate()?;
        Ok(config)
    }
}

impl ExistsArgs {
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let config = TransportConfig::default().with_retry(RetryConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            ..Default::default()
        });
        config.validate()?;
        Ok(config)
    }
}

impl SniffArgs {
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let mut sniff = SniffConfig::default().with_timeout(Duration::from_millis(self.timeout_ms));
        if self.include_masters {
            sniff = sniff.with_filter(|_| true);
        }

        let config = TransportConfig::default().with_sniff(sniff);
        config.validate()?;
        Ok(config)
    }
}
