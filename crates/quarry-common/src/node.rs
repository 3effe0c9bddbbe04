use crate::executor::HttpExecutor;
use crate::protocol::error::{ConnectionFailure, Result, TransportError};
use crate::protocol::{HttpRequest, HttpResponse};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use url::{Host, Url};

/// Port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 9200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network address of one node: scheme, host, port and path prefix.
///
/// Two nodes are the same node exactly when their addresses are equal.
///
/// # Example
///
/// ```
/// use quarry_common::NodeAddress;
///
/// let addr: NodeAddress = "https://search.local/proxy/".parse().unwrap();
/// assert_eq!(addr.port(), 9200);
/// assert_eq!(addr.path_prefix(), "/proxy");
/// assert_eq!(addr.to_string(), "https://search.local:9200/proxy");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    scheme: Scheme,
    host: String,
    port: u16,
    path_prefix: String,
}

impl NodeAddress {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            path_prefix: String::new(),
        }
    }

    pub fn with_path_prefix(mut self, prefix: &str) -> Self {
        self.path_prefix = normalize_prefix(prefix);
        self
    }

    /// Parses `[scheme://]host[:port][/prefix]`.
    ///
    /// The scheme defaults to `http` and the port to [`DEFAULT_PORT`].
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransportError::InvalidAddress("empty address".to_string()));
        }

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("http://{}", input)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", input, e)))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(TransportError::InvalidAddress(format!(
                    "{}: unsupported scheme '{}'",
                    input, other
                )))
            }
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(TransportError::InvalidAddress(format!(
                    "{}: missing host",
                    input
                )))
            }
        };

        // `Url` hides ports equal to the scheme default, so `http://h:80`
        // and `http://h` look the same unless we check the raw authority.
        let port = match url.port() {
            Some(port) => port,
            None if has_explicit_port(&with_scheme) => {
                url.port_or_known_default().unwrap_or(DEFAULT_PORT)
            }
            None => DEFAULT_PORT,
        };

        Ok(Self {
            scheme,
            host,
            port,
            path_prefix: normalize_prefix(url.path()),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path prefix, either empty or starting with `/` and without a trailing `/`.
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Builds the absolute URL for a path (and optional query) on this node.
    pub fn url_for(&self, path_and_query: &str) -> String {
        let separator = if path_and_query.starts_with('/') { "" } else { "/" };
        format!(
            "{}://{}:{}{}{}{}",
            self.scheme,
            self.host_for_url(),
            self.port,
            self.path_prefix,
            separator,
            path_and_query
        )
    }

    fn host_for_url(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme,
            self.host_for_url(),
            self.port,
            self.path_prefix
        )
    }
}

impl FromStr for NodeAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

fn has_explicit_port(url: &str) -> bool {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host_port = authority.rsplit_once('@').map(|(_, hp)| hp).unwrap_or(authority);
    match host_port.strip_prefix('[') {
        Some(v6) => v6.split_once(']').is_some_and(|(_, tail)| tail.starts_with(':')),
        None => host_port.contains(':'),
    }
}

/// An immutable handle to one remote node.
///
/// Cloning is cheap. Health state is tracked by the connection pool, never
/// by the node itself. Equality and hashing only consider the address.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    address: NodeAddress,
    metadata: BTreeMap<String, String>,
    executor: Arc<dyn HttpExecutor>,
}

impl Node {
    pub fn new(address: NodeAddress, executor: Arc<dyn HttpExecutor>) -> Self {
        Self::with_metadata(address, BTreeMap::new(), executor)
    }

    pub fn with_metadata(
        address: NodeAddress,
        metadata: BTreeMap<String, String>,
        executor: Arc<dyn HttpExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                address,
                metadata,
                executor,
            }),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.inner.address
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.inner.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.inner.metadata.get(key).map(String::as_str)
    }

    pub fn executor(&self) -> &Arc<dyn HttpExecutor> {
        &self.inner.executor
    }

    /// Sends one request to this node through its executor.
    pub async fn execute(
        &self,
        request: HttpRequest,
    ) -> std::result::Result<HttpResponse, ConnectionFailure> {
        self.inner.executor.execute(request).await
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.inner.address == other.inner.address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.address.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.inner.address)
            .field("metadata", &self.inner.metadata)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.address.fmt(f)
    }
}
