//! Connection management core of the Quarry client.
//!
//! Tracks a set of cluster nodes, picks one per request, takes failing
//! nodes out of rotation with exponential backoff, retries on other nodes
//! and optionally rediscovers the cluster topology.

pub mod health;
pub mod pool;
pub mod selector;
pub mod sniffer;
pub mod transport;

#[cfg(test)]
mod testing;

pub use health::{BackoffConfig, FailureRecord, NodeStatus};
pub use pool::{ConnectionPool, PoolConfig, PoolUpdate};
pub use selector::{RandomSelector, RoundRobinSelector, SelectNode, Selector};
pub use sniffer::{default_node_filter, DiscoveredNode, NodeFilter, SniffConfig, Sniffer};
pub use transport::{RequestOptions, RetryConfig, Transport, TransportConfig};
