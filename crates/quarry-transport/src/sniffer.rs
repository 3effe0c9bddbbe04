//! Cluster topology discovery ("sniffing").
//!
//! Asks one of the known nodes for the cluster's node list and turns the
//! answer into a fresh set of [`Node`]s for the pool.

use crate::pool::{ConnectionPool, PoolUpdate};
use hyper::Method;
use quarry_common::protocol::error::{ConnectionFailure, Result, TransportError};
use quarry_common::{ExecutorFactory, HttpRequest, Node, NodeAddress, Scheme};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Endpoint listing every node with its HTTP publish address.
pub const NODES_INFO_PATH: &str = "/_nodes/_all/http";

/// Decides whether a discovered node joins the pool.
pub type NodeFilter = Arc<dyn Fn(&DiscoveredNode) -> bool + Send + Sync>;

/// Discovery configuration.
///
/// # Default Configuration
///
/// - `on_start`: false
/// - `on_failure`: false
/// - `interval`: none (no periodic discovery)
/// - `timeout`: 1s per discovery request
/// - `filter`: [`default_node_filter`], which skips master-only nodes
#[derive(Clone)]
pub struct SniffConfig {
    /// Discover before the first request
    pub on_start: bool,
    /// Discover after every retryable failure
    pub on_failure: bool,
    /// Rediscover once this much time has passed since the last discovery
    pub interval: Option<Duration>,
    pub timeout: Duration,
    pub filter: NodeFilter,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            on_start: false,
            on_failure: false,
            interval: None,
            timeout: Duration::from_secs(1),
            filter: Arc::new(default_node_filter),
        }
    }
}

impl fmt::Debug for SniffConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniffConfig")
            .field("on_start", &self.on_start)
            .field("on_failure", &self.on_failure)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SniffConfig {
    pub fn with_on_start(mut self, enabled: bool) -> Self {
        self.on_start = enabled;
        self
    }

    pub fn with_on_failure(mut self, enabled: bool) -> Self {
        self.on_failure = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_filter(
        mut self,
        filter: impl Fn(&DiscoveredNode) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// Whether any discovery trigger is configured.
    pub fn is_enabled(&self) -> bool {
        self.on_start || self.on_failure || self.interval.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "sniff timeout must be greater than zero".to_string(),
            ));
        }
        if self.interval.is_some_and(|interval| interval.is_zero()) {
            return Err(TransportError::InvalidConfig(
                "sniff interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One node as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredNode {
    pub host: String,
    pub port: u16,
    pub roles: Vec<String>,
    /// `id`, `name`, `roles`, `version` and `attr.<key>` entries
    pub metadata: BTreeMap<String, String>,
}

impl DiscoveredNode {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_master_only(&self) -> bool {
        self.roles.len() == 1 && self.roles[0] == "master"
    }
}

/// Keeps every node except dedicated masters.
pub fn default_node_filter(node: &DiscoveredNode) -> bool {
    !node.is_master_only()
}

#[derive(Debug, Deserialize)]
struct NodesInfo {
    #[serde(default)]
    nodes: BTreeMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
    http: Option<HttpInfo>,
}

#[derive(Debug, Deserialize)]
struct HttpInfo {
    publish_address: String,
}

/// Splits a publish address into host and port.
///
/// Accepts `hostname/ip:port` (the hostname wins), `ip:port` and
/// `[ipv6]:port`.
pub fn parse_publish_address(address: &str) -> Result<(String, u16)> {
    let invalid = || TransportError::Sniff(format!("invalid publish address '{}'", address));

    let (hostname, bound) = match address.split_once('/') {
        Some((hostname, bound)) => (Some(hostname), bound),
        None => (None, address),
    };

    let (ip, port) = bound.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');

    let host = match hostname {
        Some(hostname) if !hostname.is_empty() => hostname,
        _ => ip,
    };
    if host.is_empty() {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}

/// Parses a node info response body.
///
/// Nodes without an HTTP section or with an unreadable publish address are
/// skipped.
pub fn parse_nodes_info(body: &[u8]) -> Result<Vec<DiscoveredNode>> {
    let info: NodesInfo = serde_json::from_slice(body)?;
    let mut discovered = Vec::with_capacity(info.nodes.len());

    for (id, node) in info.nodes {
        let Some(http) = node.http else {
            debug!("Skipping node {} without HTTP publish address", id);
            continue;
        };
        let (host, port) = match parse_publish_address(&http.publish_address) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Skipping node {}: {}", id, e);
                continue;
            }
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("id".to_string(), id);
        if let Some(name) = node.name {
            metadata.insert("name".to_string(), name);
        }
        if let Some(version) = node.version {
            metadata.insert("version".to_string(), version);
        }
        metadata.insert("roles".to_string(), node.roles.join(","));
        for (key, value) in node.attributes {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            metadata.insert(format!("attr.{}", key), value);
        }

        discovered.push(DiscoveredNode {
            host,
            port,
            roles: node.roles,
            metadata,
        });
    }

    Ok(discovered)
}

/// Discovers cluster nodes through the pool and refreshes it.
pub struct Sniffer {
    config: SniffConfig,
    factory: Arc<dyn ExecutorFactory>,
    scheme: Scheme,
    path_prefix: String,
}

impl Sniffer {
    /// Discovered nodes inherit the scheme and path prefix of `template`.
    pub fn new(
        config: SniffConfig,
        factory: Arc<dyn ExecutorFactory>,
        template: Option<&NodeAddress>,
    ) -> Self {
        Self {
            config,
            factory,
            scheme: template.map(NodeAddress::scheme).unwrap_or_default(),
            path_prefix: template
                .map(|t| t.path_prefix().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn config(&self) -> &SniffConfig {
        &self.config
    }

    /// Fetches the node list, trying each known node at most once.
    ///
    /// Nodes that cannot be reached or answer with garbage are marked dead.
    pub async fn discover(&self, pool: &ConnectionPool) -> Result<Vec<DiscoveredNode>> {
        let mut tried = HashSet::new();
        let mut last_error = None;

        for _ in 0..pool.len() {
            let node = pool.get_connection_excluding(&tried)?;
            if !tried.insert(node.address().clone()) {
                break;
            }

            let request =
                HttpRequest::new(Method::GET, NODES_INFO_PATH).with_timeout(self.config.timeout);
            let outcome = tokio::time::timeout(self.config.timeout, node.execute(request))
                .await
                .unwrap_or_else(|_| {
                    Err(ConnectionFailure::timeout(
                        node.address().clone(),
                        self.config.timeout,
                    ))
                });

            match outcome {
                Ok(response) if response.is_success() => {
                    match parse_nodes_info(&response.body) {
                        Ok(discovered) => {
                            pool.mark_live(&node);
                            return Ok(discovered);
                        }
                        Err(e) => {
                            warn!("Unreadable node info from {}: {}", node.address(), e);
                            pool.mark_dead(&node);
                            last_error = Some(e.to_string());
                        }
                    }
                }
                Ok(response) => {
                    debug!(
                        "Node {} answered discovery with status {}",
                        node.address(),
                        response.status
                    );
                    last_error = Some(format!(
                        "{} returned status {}",
                        node.address(),
                        response.status
                    ));
                }
                Err(failure) => {
                    warn!("Discovery request failed: {}", failure);
                    pool.mark_dead(&node);
                    last_error = Some(failure.to_string());
                }
            }
        }

        Err(TransportError::Sniff(match last_error {
            Some(error) => format!("no node answered, last error: {}", error),
            None => "no node to ask".to_string(),
        }))
    }

    /// Turns discovered nodes into pool nodes.
    ///
    /// Addresses in `known` reuse the existing handle, everything else gets a
    /// new executor from the factory.
    pub fn build_nodes(
        &self,
        discovered: Vec<DiscoveredNode>,
        known: &HashMap<NodeAddress, Node>,
    ) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();

        for candidate in discovered {
            if !(self.config.filter)(&candidate) {
                debug!(
                    "Filtered out node {}:{} with roles {:?}",
                    candidate.host, candidate.port, candidate.roles
                );
                continue;
            }

            let address = NodeAddress::new(self.scheme, candidate.host, candidate.port)
                .with_path_prefix(&self.path_prefix);
            let node = match known.get(&address) {
                Some(existing) => existing.clone(),
                None => {
                    let executor = self.factory.build(&address)?;
                    Node::with_metadata(address, candidate.metadata, executor)
                }
            };
            nodes.push(node);
        }

        if nodes.is_empty() {
            return Err(TransportError::Sniff(
                "no viable nodes found in cluster state".to_string(),
            ));
        }
        Ok(nodes)
    }

    /// Runs one discovery round and applies the result to the pool.
    ///
    /// The pool is left untouched if discovery fails.
    pub async fn sniff(&self, pool: &ConnectionPool) -> Result<PoolUpdate> {
        let discovered = self.discover(pool).await?;
        let known: HashMap<NodeAddress, Node> = pool
            .nodes()
            .into_iter()
            .map(|node| (node.address().clone(), node))
            .collect();

        let nodes = self.build_nodes(discovered, &known)?;
        let update = pool.update_nodes(nodes);
        info!(
            "Discovery found {} nodes ({} new, {} gone)",
            update.kept + update.added.len(),
            update.added.len(),
            update.removed.len()
        );
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::testing::{address, MockFactory, Reply};
    use serde_json::json;

    fn nodes_info() -> serde_json::Value {
        json!({
            "_nodes": {"total": 3, "successful": 3, "failed": 0},
            "cluster_name": "test",
            "nodes": {
                "n1": {
                    "name": "search-1",
                    "version": "8.15.0",
                    "roles": ["data", "ingest"],
                    "attributes": {"zone": "a", "ml.max_jvm_size": 1024},
                    "http": {"publish_address": "10.0.0.1:9200"}
                },
                "n2": {
                    "name": "search-2",
                    "roles": ["data"],
                    "http": {"publish_address": "10.0.0.2:9200"}
                },
                "n3": {
                    "name": "master-1",
                    "roles": ["master"],
                    "http": {"publish_address": "master-1.local/10.0.0.3:9200"}
                },
                "n4": {
                    "name": "transport-only",
                    "roles": ["data"]
                }
            }
        })
    }

    fn sniffer(factory: &Arc<MockFactory>) -> Sniffer {
        Sniffer::new(SniffConfig::default(), factory.clone(), Some(&address(0)))
    }

    #[test]
    fn test_parse_publish_address() {
        assert_eq!(
            parse_publish_address("10.0.0.1:9200").unwrap(),
            ("10.0.0.1".to_string(), 9200)
        );
        assert_eq!(
            parse_publish_address("search-1.local/10.0.0.1:9201").unwrap(),
            ("search-1.local".to_string(), 9201)
        );
        assert_eq!(
            parse_publish_address("/10.0.0.1:9200").unwrap(),
            ("10.0.0.1".to_string(), 9200)
        );
        assert_eq!(
            parse_publish_address("[::1]:9200").unwrap(),
            ("::1".to_string(), 9200)
        );
    }

    #[test]
    fn test_parse_publish_address_invalid() {
        assert!(parse_publish_address("10.0.0.1").is_err());
        assert!(parse_publish_address("10.0.0.1:http").is_err());
        assert!(parse_publish_address(":9200").is_err());
    }

    #[test]
    fn test_parse_nodes_info() {
        let body = nodes_info().to_string();
        let discovered = parse_nodes_info(body.as_bytes()).unwrap();

        assert_eq!(discovered.len(), 3);

        let first = &discovered[0];
        assert_eq!(first.host, "10.0.0.1");
        assert_eq!(first.port, 9200);
        assert_eq!(first.metadata["id"], "n1");
        assert_eq!(first.metadata["name"], "search-1");
        assert_eq!(first.metadata["version"], "8.15.0");
        assert_eq!(first.metadata["roles"], "data,ingest");
        assert_eq!(first.metadata["attr.zone"], "a");
        assert_eq!(first.metadata["attr.ml.max_jvm_size"], "1024");

        assert_eq!(discovered[2].host, "master-1.local");
        assert!(discovered[2].is_master_only());
    }

    #[test]
    fn test_parse_nodes_info_rejects_garbage() {
        assert!(matches!(
            parse_nodes_info(b"<html>"),
            Err(TransportError::Json(_))
        ));
        assert!(parse_nodes_info(b"{}").unwrap().is_empty());
    }

    #[test]
    fn test_default_filter() {
        let mut node = DiscoveredNode {
            host: "h".to_string(),
            port: 9200,
            roles: vec!["master".to_string()],
            metadata: BTreeMap::new(),
        };
        assert!(!default_node_filter(&node));

        node.roles.push("data".to_string());
        assert!(default_node_filter(&node));
        assert!(node.has_role("data"));

        node.roles.clear();
        assert!(default_node_filter(&node));
    }

    #[tokio::test]
    async fn test_sniff_updates_pool() {
        let factory = Arc::new(MockFactory::default());
        let seed = factory.node(0);
        let pool = ConnectionPool::new(vec![seed.clone()], PoolConfig::default());
        factory.executor(seed.address()).set(Reply::json(nodes_info()));

        let update = sniffer(&factory).sniff(&pool).await.unwrap();

        assert_eq!(update.kept, 1);
        assert_eq!(update.added, vec![address(1)]);
        assert!(update.removed.is_empty());
        assert_eq!(pool.len(), 2);
        assert!(pool.contains(&address(1)));

        let paths = factory.executor(seed.address()).paths();
        assert_eq!(paths, vec![NODES_INFO_PATH.to_string()]);

        let added = pool
            .nodes()
            .into_iter()
            .find(|n| n.address() == &address(1))
            .unwrap();
        assert_eq!(added.meta("name"), Some("search-2"));
    }

    #[tokio::test]
    async fn test_custom_filter() {
        let factory = Arc::new(MockFactory::default());
        let seed = factory.node(0);
        let pool = ConnectionPool::new(vec![seed.clone()], PoolConfig::default());
        factory.executor(seed.address()).set(Reply::json(nodes_info()));

        let config = SniffConfig::default().with_filter(|node| node.has_role("ingest"));
        let sniffer = Sniffer::new(config, factory.clone(), Some(&address(0)));
        sniffer.sniff(&pool).await.unwrap();

        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&address(0)));
    }

    #[tokio::test]
    async fn test_discovered_nodes_inherit_scheme_and_prefix() {
        let factory = Arc::new(MockFactory::default());
        let template = NodeAddress::parse("https://seed.local:9243/search").unwrap();
        let sniffer = Sniffer::new(SniffConfig::default(), factory, Some(&template));

        let discovered = parse_nodes_info(nodes_info().to_string().as_bytes()).unwrap();
        let nodes = sniffer.build_nodes(discovered, &HashMap::new()).unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].address().to_string(), "https://10.0.0.1:9200/search");
    }

    #[tokio::test]
    async fn test_failed_node_is_marked_dead_and_next_is_tried() {
        let factory = Arc::new(MockFactory::default());
        let nodes = vec![factory.node(0), factory.node(1)];
        let pool = ConnectionPool::new(nodes.clone(), PoolConfig::default());
        factory.executor(nodes[0].address()).set(Reply::Refuse);
        factory.executor(nodes[1].address()).set(Reply::json(nodes_info()));

        sniffer(&factory).sniff(&pool).await.unwrap();

        assert_eq!(factory.executor(nodes[0].address()).calls(), 1);
        assert_eq!(factory.executor(nodes[1].address()).calls(), 1);
        let record = pool.failure_record(nodes[0].address()).unwrap();
        assert_eq!(record.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_node_times_out() {
        let factory = Arc::new(MockFactory::default());
        let nodes = vec![factory.node(0), factory.node(1)];
        let pool = ConnectionPool::new(nodes.clone(), PoolConfig::default());
        factory.executor(nodes[0].address()).set(Reply::Hang);
        factory.executor(nodes[1].address()).set(Reply::json(nodes_info()));

        let update = sniffer(&factory).sniff(&pool).await.unwrap();

        assert_eq!(update.kept, 2);
        assert!(pool.failure_record(nodes[0].address()).is_some());
    }

    #[tokio::test]
    async fn test_no_viable_nodes_leaves_pool_untouched() {
        let factory = Arc::new(MockFactory::default());
        let seed = factory.node(0);
        let pool = ConnectionPool::new(vec![seed.clone()], PoolConfig::default());
        factory.executor(seed.address()).set(Reply::json(json!({
            "nodes": {"m": {"roles": ["master"], "http": {"publish_address": "10.0.0.9:9200"}}}
        })));

        let result = sniffer(&factory).sniff(&pool).await;

        assert!(matches!(result, Err(TransportError::Sniff(_))));
        assert_eq!(pool.nodes(), vec![seed]);
    }

    #[tokio::test]
    async fn test_all_nodes_failing_is_sniff_error() {
        let factory = Arc::new(MockFactory::default());
        let nodes = vec![factory.node(0), factory.node(1)];
        let pool = ConnectionPool::new(nodes.clone(), PoolConfig::default());
        for node in &nodes {
            factory.executor(node.address()).set(Reply::Refuse);
        }

        let result = sniffer(&factory).sniff(&pool).await;

        assert!(matches!(result, Err(TransportError::Sniff(_))));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.dead_count(), 2);
        for node in &nodes {
            assert_eq!(factory.executor(node.address()).calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_error_status_tries_next_node_without_marking_dead() {
        let factory = Arc::new(MockFactory::default());
        let nodes = vec![factory.node(0), factory.node(1)];
        let pool = ConnectionPool::new(nodes.clone(), PoolConfig::default());
        factory.executor(nodes[0].address()).set(Reply::status(403));
        factory.executor(nodes[1].address()).set(Reply::json(nodes_info()));

        sniffer(&factory).sniff(&pool).await.unwrap();

        assert!(pool.failure_record(nodes[0].address()).is_none());
        assert_eq!(pool.alive_count(), 2);
    }
}
