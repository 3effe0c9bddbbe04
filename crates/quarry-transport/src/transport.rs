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

use crate::pool::{ConnectionPool, PoolConfig, PoolUpdate};
use crate::sniffer::{SniffConfig, Sniffer};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use quarry_common::protocol::error::{CancelReason, ConnectionFailure, Result, TransportError};
use quarry_common::{
    ExecutorFactory, HttpRequest, HttpResponse, HyperExecutorFactory, Node, NodeAddress,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry policy for one logical request.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per request, the first one included
    ///
    /// Values below 1 are treated as 1.
    /// Default: 3
    pub retries: usize,
    /// Statuses that mark the node dead and are retried elsewhere
    ///
    /// Default: 502, 503, 504
    pub retry_on_status: Vec<StatusCode>,
    /// Whether an attempt timeout is retried on another node
    ///
    /// When false, a timeout is returned to the caller at once and the node
    /// is left alone.
    /// Default: true
    pub retry_on_timeout: bool,
    /// Upper bound for one attempt, overridable per request
    ///
    /// Default: 10s
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_on_status: vec![
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
            retry_on_timeout: true,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(TransportError::InvalidConfig(
                "retries must allow at least one attempt".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a [`Transport`] is configured with.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub sniff: SniffConfig,
}

impl TransportConfig {
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sniff(mut self, sniff: SniffConfig) -> Self {
        self.sniff = sniff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.backoff.validate()?;
        self.retry.validate()?;
        self.sniff.validate()
    }
}

/// Per-request knobs for [`Transport::perform_request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides [`RetryConfig::timeout`] for each attempt of this request
    pub timeout: Option<Duration>,
    /// Statuses treated as success for this request
    pub ignore_statuses: Vec<StatusCode>,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
    /// Give up once this instant passes, even mid-attempt
    pub deadline: Option<Instant>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ignored_status(mut self, status: StatusCode) -> Self {
        self.ignore_statuses.push(status);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn cancel_reason(&self) -> Option<CancelReason> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Some(CancelReason::Token);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(CancelReason::Deadline);
        }
        None
    }
}

/// Result of one attempt after classification.
enum AttemptOutcome {
    Success(HttpResponse),
    Retryable(TransportError),
    Fatal(TransportError),
}

/// Resets the single-flight discovery flag when dropped.
struct SniffGuard<'a>(&'a AtomicBool);

impl Drop for SniffGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Quarry Transport - pooled, retrying HTTP access to a search cluster.
///
/// The transport drives one logical request at a time through the
/// [`ConnectionPool`]: it asks the pool for a node, runs the call through
/// that node's executor, classifies the outcome, reports the node's health
/// back to the pool and retries on another node when the failure allows it.
///
/// # Request Lifecycle
///
/// 1. **Sniff on start**: the very first request discovers the cluster once
/// 2. **Periodic sniff**: discovery again once `sniff.interval` has elapsed
/// 3. **Attempt**: a node not tried yet for this request, one bounded call
/// 4. **Classify**: success, retryable failure or fatal failure
/// 5. **Sniff on failure**: discovery after a retryable failure, if enabled
///
/// Discovery problems are logged and never fail the request itself.
///
/// # Thread Safety
///
/// `Transport` is `Send + Sync`; share it behind an `Arc` and call it from
/// as many tasks as needed.
pub struct Transport {
    pool: Arc<ConnectionPool>,
    sniffer: Sniffer,
    retry: RetryConfig,
    /// Set once the sniff-on-start round has run
    started: OnceCell<()>,
    last_sniff: Mutex<Instant>,
    sniffing: AtomicBool,
}

impl Transport {
    /// Creates a transport over `seeds`, talking HTTP through hyper.
    ///
    /// # Arguments
    /// * `seeds` - Initial node addresses
    /// * `config` - Pool, retry and discovery configuration
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration does not validate or a seed uses
    /// an unsupported scheme.
    ///
    /// # Example
    /// ```no_run
    /// # use quarry_transport::{RequestOptions, Transport, TransportConfig};
    /// # use quarry_common::NodeAddress;
    /// # use hyper::Method;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let seeds = vec![NodeAddress::parse("http://127.0.0.1:9200")?];
    /// let transport = Transport::new(seeds, TransportConfig::default())?;
    /// let response = transport
    ///     .perform_request(Method::GET, "/_cluster/health", None, RequestOptions::default())
    ///     .await?;
    /// println!("{}", response.text());
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(seeds: Vec<NodeAddress>, config: TransportConfig) -> Result<Self> {
        Self::with_factory(seeds, config, Arc::new(HyperExecutorFactory::default()))
    }

    /// Creates a transport whose executors come from `factory`.
    ///
    /// The factory serves both the seeds and every node found by discovery.
    /// Discovered nodes inherit the scheme and path prefix of the first seed.
    pub fn with_factory(
        seeds: Vec<NodeAddress>,
        config: TransportConfig,
        factory: Arc<dyn ExecutorFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let nodes = seeds
            .iter()
            .map(|address| Ok(Node::new(address.clone(), factory.build(address)?)))
            .collect::<Result<Vec<_>>>()?;

        let sniffer = Sniffer::new(config.sniff, factory, seeds.first());
        let pool = Arc::new(ConnectionPool::new(nodes, config.pool));

        info!(
            "Transport initialized with {} nodes, {} attempts per request",
            pool.len(),
            config.retry.retries
        );

        Ok(Self {
            pool,
            sniffer,
            retry: config.retry,
            started: OnceCell::new(),
            last_sniff: Mutex::new(Instant::now()),
            sniffing: AtomicBool::new(false),
        })
    }

    /// Performs one logical request against the cluster.
    ///
    /// Each attempt goes to a node not yet tried for this request while such
    /// a node is alive. Attempts are bounded by the request timeout, so total
    /// latency can reach `retries × timeout`.
    ///
    /// # Arguments
    /// * `method` - HTTP method
    /// * `path` - Path relative to the node's path prefix
    /// * `body` - Opaque request body
    /// * `options` - Per-request overrides, cancellation and deadline
    ///
    /// # Returns
    /// - `Ok(response)` - 2xx, an ignored status, or 404 on `HEAD`
    /// - `Err(NodeResponse)` - the node answered with a non-retryable error status
    /// - `Err(RetriesExhausted)` - every attempt failed retryably
    /// - `Err(Connection)` - a timeout while `retry_on_timeout` is off
    /// - `Err(Cancelled)` - the token fired or the deadline passed
    /// - `Err(NoNodesAvailable)` - the pool is empty
    pub async fn perform_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<HttpResponse> {
        self.sniff_on_start().await;
        self.sniff_if_due().await;

        let timeout = options.timeout.unwrap_or(self.retry.timeout);
        let mut request = HttpRequest::new(method, path).with_timeout(timeout);
        request.query = options.query.clone();
        request.headers = options.headers.clone();
        request.body = body;

        let budget = self.retry.retries.max(1);
        let mut tried = HashSet::new();
        let mut last_error = None;

        for attempt in 1..=budget {
            if let Some(reason) = options.cancel_reason() {
                return Err(TransportError::Cancelled(reason));
            }

            let node = self.pool.get_connection_excluding(&tried)?;
            tried.insert(node.address().clone());
            debug!(
                "{} {} on {} (attempt {}/{})",
                request.method,
                request.path,
                node.address(),
                attempt,
                budget
            );

            let result = self.attempt(&node, request.clone(), timeout, &options).await?;

            match self.classify(&node, &request.method, result, &options) {
                AttemptOutcome::Success(response) => return Ok(response),
                AttemptOutcome::Fatal(error) => return Err(error),
                AttemptOutcome::Retryable(error) => {
                    if attempt < budget {
                        warn!("{} (attempt {}/{}), retrying", error, attempt, budget);
                    } else {
                        warn!("{} (attempt {}/{}), giving up", error, attempt, budget);
                    }
                    last_error = Some(error);

                    if self.sniffer.config().on_failure && attempt < budget {
                        self.run_sniff("failure").await;
                    }
                }
            }
        }

        Err(TransportError::RetriesExhausted {
            attempts: budget,
            last: Box::new(last_error.unwrap_or(TransportError::NoNodesAvailable)),
        })
    }

    /// Checks whether `path` exists with a `HEAD` request.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let response = self
            .perform_request(Method::HEAD, path, None, RequestOptions::default())
            .await?;
        Ok(response.status.is_success())
    }

    /// Runs discovery now and returns what changed in the pool.
    pub async fn sniff(&self) -> Result<PoolUpdate> {
        *self.last_sniff.lock() = Instant::now();
        self.sniffer.sniff(&self.pool).await
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn sniff_config(&self) -> &SniffConfig {
        self.sniffer.config()
    }

    /// One bounded call, raced against the caller's token and deadline.
    ///
    /// The outer `Err` is a cancellation, the inner result is what the node
    /// did.
    async fn attempt(
        &self,
        node: &Node,
        request: HttpRequest,
        timeout: Duration,
        options: &RequestOptions,
    ) -> Result<std::result::Result<HttpResponse, ConnectionFailure>> {
        let call = tokio::time::timeout(timeout, node.execute(request));

        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let deadline = async {
            match options.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = call => Ok(result.unwrap_or_else(|_| {
                Err(ConnectionFailure::timeout(node.address().clone(), timeout))
            })),
            _ = cancelled => {
                debug!("Request to {} cancelled by caller", node.address());
                Err(TransportError::Cancelled(CancelReason::Token))
            }
            _ = deadline => {
                debug!("Request to {} hit its deadline", node.address());
                Err(TransportError::Cancelled(CancelReason::Deadline))
            }
        }
    }

    /// Maps an attempt result to an outcome and reports node health.
    fn classify(
        &self,
        node: &Node,
        method: &Method,
        result: std::result::Result<HttpResponse, ConnectionFailure>,
        options: &RequestOptions,
    ) -> AttemptOutcome {
        let response = match result {
            Ok(response) => response,
            Err(failure) if failure.is_timeout() && !self.retry.retry_on_timeout => {
                return AttemptOutcome::Fatal(failure.into());
            }
            Err(failure) => {
                self.pool.mark_dead(node);
                return AttemptOutcome::Retryable(failure.into());
            }
        };

        let status = response.status;
        let head_not_found = *method == Method::HEAD && status == StatusCode::NOT_FOUND;

        if status.is_success() || options.ignore_statuses.contains(&status) || head_not_found {
            self.pool.mark_live(node);
            return AttemptOutcome::Success(response);
        }

        if self.retry.retry_on_status.contains(&status) {
            self.pool.mark_dead(node);
            return AttemptOutcome::Retryable(TransportError::RetryableStatus {
                node: node.address().clone(),
                status,
                body: response.body,
            });
        }

        // The node answered, so it is healthy even though the request failed
        self.pool.mark_live(node);
        AttemptOutcome::Fatal(TransportError::NodeResponse {
            node: node.address().clone(),
            status,
            headers: response.headers,
            body: response.body,
        })
    }

    async fn sniff_on_start(&self) {
        if !self.sniffer.config().on_start {
            return;
        }
        self.started
            .get_or_init(|| async {
                self.run_sniff("start").await;
            })
            .await;
    }

    async fn sniff_if_due(&self) {
        let Some(interval) = self.sniffer.config().interval else {
            return;
        };
        if self.last_sniff.lock().elapsed() < interval {
            return;
        }
        self.run_sniff("interval").await;
    }

    /// Runs discovery unless another round is already in flight.
    async fn run_sniff(&self, trigger: &str) {
        if self
            .sniffing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Discovery already running, skipping {} trigger", trigger);
            return;
        }
        let _guard = SniffGuard(&self.sniffing);
        *self.last_sniff.lock() = Instant::now();

        match self.sniffer.sniff(&self.pool).await {
            Ok(update) => debug!(
                "Discovery on {} finished: {} added, {} removed",
                trigger,
                update.added.len(),
                update.removed.len()
            ),
            Err(e) => warn!("Discovery on {} failed: {}", trigger, e),
        }
    }
}
