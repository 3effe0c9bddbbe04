use super::{ExecutorFactory, HttpExecutor};
use crate::node::{NodeAddress, Scheme};
use crate::protocol::error::{ConnectionFailure, Result, TransportError};
use crate::protocol::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default bound for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound for a whole exchange when the request carries no timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain-HTTP executor bound to one node.
///
/// Keeps a pooled `hyper-util` client, so keep-alive connections are reused
/// across requests to the same node. The timeout covers sending the request
/// and reading the full body.
pub struct HyperExecutor {
    address: NodeAddress,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HyperExecutor {
    /// Creates an executor with the default timeouts.
    pub fn new(address: NodeAddress) -> Result<Self> {
        Self::with_timeouts(address, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates an executor with explicit connect and request timeouts.
    ///
    /// # Errors
    /// `InvalidConfig` for `https` addresses: this executor has no TLS stack.
    pub fn with_timeouts(
        address: NodeAddress,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        if address.scheme() == Scheme::Https {
            return Err(TransportError::InvalidConfig(format!(
                "{}: the built-in executor only speaks plain HTTP",
                address
            )));
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            address,
            client,
            timeout,
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn classify(&self, err: hyper_util::client::legacy::Error) -> ConnectionFailure {
        let message = match err.source() {
            Some(source) => format!("{}: {}", err, source),
            None => err.to_string(),
        };
        debug!("Request to {} failed: {}", self.address, message);
        if err.is_connect() {
            ConnectionFailure::connect(self.address.clone(), message)
        } else {
            ConnectionFailure::io(self.address.clone(), message)
        }
    }
}

#[async_trait]
impl HttpExecutor for HyperExecutor {
    async fn execute(
        &self,
        request: HttpRequest,
    ) -> std::result::Result<HttpResponse, ConnectionFailure> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        let uri = self.address.url_for(&request.path_and_query());

        let mut builder = hyper::Request::builder().method(request.method).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers);
            if request.body.is_some() && !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
        }
        let http_request = builder
            .body(Full::new(request.body.unwrap_or_default()))
            .map_err(|e| {
                ConnectionFailure::io(
                    self.address.clone(),
                    format!("Failed to build request: {}", e),
                )
            })?;

        let exchange = async {
            let response = self
                .client
                .request(http_request)
                .await
                .map_err(|e| self.classify(e))?;

            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| {
                    ConnectionFailure::io(
                        self.address.clone(),
                        format!("Failed to read response: {}", e),
                    )
                })?
                .to_bytes();

            Ok::<_, ConnectionFailure>(HttpResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                debug!("Request to {} timed out after {:?}", self.address, timeout);
                ConnectionFailure::timeout(self.address.clone(), timeout)
            })?
    }
}

/// Builds a [`HyperExecutor`] per address.
#[derive(Debug, Clone)]
pub struct HyperExecutorFactory {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HyperExecutorFactory {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ExecutorFactory for HyperExecutorFactory {
    fn build(&self, address: &NodeAddress) -> Result<Arc<dyn HttpExecutor>> {
        let executor =
            HyperExecutor::with_timeouts(address.clone(), self.connect_timeout, self.request_timeout)?;
        Ok(Arc::new(executor))
    }
}
