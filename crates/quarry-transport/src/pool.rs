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

use crate::health::{BackoffConfig, FailureRecord, NodeStatus};
use crate::selector::{SelectNode, Selector};
use parking_lot::Mutex;
use quarry_common::protocol::error::{Result, TransportError};
use quarry_common::{Node, NodeAddress};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `selector`: round-robin
/// - `backoff`: 60s base delay, doubling, capped at 1920s
/// - `randomize_nodes`: false (nodes keep the order they were given in)
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub selector: Selector,
    pub backoff: BackoffConfig,
    /// Shuffle the node list whenever it is (re)built
    pub randomize_nodes: bool,
}

impl PoolConfig {
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_randomized_nodes(mut self, randomize: bool) -> Self {
        self.randomize_nodes = randomize;
        self
    }
}

/// What [`ConnectionPool::update_nodes`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolUpdate {
    pub added: Vec<NodeAddress>,
    pub removed: Vec<NodeAddress>,
    pub kept: usize,
}

/// Registry of known nodes and their health.
///
/// The pool is the only component that moves nodes between alive and dead.
/// Every node is in exactly one of the two sets. Dead nodes carry a
/// [`FailureRecord`] with an exponentially growing resurrection time; when
/// it passes, the node is put back into rotation on the next
/// [`get_connection`](Self::get_connection). A resurrected node keeps its
/// record until a request to it succeeds, so failing again extends the
/// backoff instead of restarting it.
///
/// # Thread Safety
///
/// All state sits behind one mutex. Operations are O(nodes) bookkeeping and
/// never hold the lock across I/O.
pub struct ConnectionPool {
    selector: Selector,
    backoff: BackoffConfig,
    randomize_nodes: bool,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Every known node, in pool order
    nodes: Vec<Node>,
    /// Alive nodes, always a subsequence of `nodes`
    alive: Vec<Node>,
    failures: HashMap<NodeAddress, FailureRecord>,
}

impl PoolState {
    fn order_of(&self, address: &NodeAddress) -> Option<usize> {
        self.nodes.iter().position(|n| n.address() == address)
    }

    fn is_alive(&self, address: &NodeAddress) -> bool {
        self.alive.iter().any(|n| n.address() == address)
    }

    /// Puts a known node back into the alive list at its pool-order position.
    fn insert_alive(&mut self, node: Node) {
        let Some(order) = self.order_of(node.address()) else {
            return;
        };
        if self.is_alive(node.address()) {
            return;
        }
        let index = self
            .alive
            .iter()
            .position(|n| self.order_of(n.address()).is_some_and(|o| o > order))
            .unwrap_or(self.alive.len());
        self.alive.insert(index, node);
    }

    /// The dead node that resurrects first: earliest resurrect-at, then fewest
    /// failures, then pool order.
    fn next_dead(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !self.is_alive(n.address()))
            .min_by_key(|(order, n)| {
                let record = self.failures.get(n.address());
                (
                    record.map(|r| r.resurrect_at),
                    record.map(|r| r.consecutive_failures),
                    *order,
                )
            })
            .map(|(_, n)| n)
    }

    /// Moves at most one dead node whose backoff has elapsed back to alive.
    fn resurrect(&mut self, now: Instant) {
        let Some(node) = self.next_dead().cloned() else {
            return;
        };
        let due = self
            .failures
            .get(node.address())
            .map_or(true, |r| r.is_due(now));
        if due {
            info!("Resurrecting node {} for a trial request", node.address());
            self.insert_alive(node);
        }
    }
}

impl ConnectionPool {
    /// Creates a pool over `nodes`, all initially alive.
    ///
    /// Duplicate addresses are dropped, keeping the first occurrence.
    pub fn new(nodes: Vec<Node>, config: PoolConfig) -> Self {
        let mut nodes = dedupe(nodes);
        if config.randomize_nodes {
            nodes.shuffle(&mut rand::rng());
        }

        Self {
            selector: config.selector,
            backoff: config.backoff,
            randomize_nodes: config.randomize_nodes,
            state: Mutex::new(PoolState {
                alive: nodes.clone(),
                nodes,
                failures: HashMap::new(),
            }),
        }
    }

    /// Picks the node for the next request.
    ///
    /// Resurrects the next dead node first if its backoff has elapsed. When
    /// every node is dead, the one due to resurrect first is returned anyway
    /// for a trial request, so the client never locks itself out.
    ///
    /// # Errors
    /// `NoNodesAvailable` if the pool holds no nodes at all.
    pub fn get_connection(&self) -> Result<Node> {
        self.get_connection_excluding(&HashSet::new())
    }

    /// Like [`get_connection`](Self::get_connection), but skips alive nodes in
    /// `tried` as long as some other alive node remains.
    pub fn get_connection_excluding(&self, tried: &HashSet<NodeAddress>) -> Result<Node> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.nodes.is_empty() {
            return Err(TransportError::NoNodesAvailable);
        }

        state.resurrect(now);

        if state.alive.is_empty() {
            let node = state
                .next_dead()
                .cloned()
                .ok_or(TransportError::NoNodesAvailable)?;
            debug!(
                "All nodes are dead, trying {} ahead of its resurrection",
                node.address()
            );
            return Ok(node);
        }

        if !tried.is_empty() {
            let untried: Vec<Node> = state
                .alive
                .iter()
                .filter(|n| !tried.contains(n.address()))
                .cloned()
                .collect();
            if !untried.is_empty() {
                return self.selector.select(&untried).cloned();
            }
        }

        self.selector.select(&state.alive).cloned()
    }

    /// Takes a node out of rotation after a failure.
    ///
    /// Creates or bumps its failure record and pushes its resurrection time to
    /// `now + min(base * factor^(failures - 1), max)`. Nodes the pool does not
    /// know (for example dropped by a concurrent discovery) are ignored.
    pub fn mark_dead(&self, node: &Node) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let address = node.address();

        if state.order_of(address).is_none() {
            debug!("Ignoring failure of unknown node {}", address);
            return;
        }

        state.alive.retain(|n| n.address() != address);
        let record = state
            .failures
            .entry(address.clone())
            .or_insert_with(|| FailureRecord::new(now));
        let delay = record.record_failure(now, &self.backoff);

        warn!(
            "Marking node {} dead for {:?} after {} consecutive failures",
            address, delay, record.consecutive_failures
        );
    }

    /// Confirms a node is reachable: clears its failure record and returns it
    /// to rotation. No-op for nodes without a record.
    pub fn mark_live(&self, node: &Node) {
        let mut state = self.state.lock();
        if state.failures.remove(node.address()).is_none() {
            return;
        }

        // Use the pool's own handle, the caller's may predate a node update
        let known = state.nodes.iter().find(|n| *n == node).cloned();
        if let Some(known) = known {
            state.insert_alive(known);
            info!("Node {} is alive again", node.address());
        }
    }

    /// Replaces the known node set, typically after discovery.
    ///
    /// Nodes present before and after keep their handle, alive/dead status
    /// and failure record. Nodes no longer listed are dropped with their
    /// record. New nodes start alive.
    pub fn update_nodes(&self, nodes: Vec<Node>) -> PoolUpdate {
        let mut state = self.state.lock();

        let mut next = Vec::new();
        let mut added = HashSet::new();
        let mut update = PoolUpdate::default();

        for node in dedupe(nodes) {
            match state.nodes.iter().find(|n| n.address() == node.address()) {
                Some(existing) => {
                    update.kept += 1;
                    next.push(existing.clone());
                }
                None => {
                    added.insert(node.address().clone());
                    update.added.push(node.address().clone());
                    next.push(node);
                }
            }
        }

        let listed: HashSet<&NodeAddress> = next.iter().map(Node::address).collect();
        update.removed = state
            .nodes
            .iter()
            .filter(|n| !listed.contains(n.address()))
            .map(|n| n.address().clone())
            .collect();
        drop(listed);

        for address in &update.removed {
            state.failures.remove(address);
        }

        if self.randomize_nodes {
            next.shuffle(&mut rand::rng());
        }

        let was_alive: HashSet<NodeAddress> =
            state.alive.iter().map(|n| n.address().clone()).collect();
        state.alive = next
            .iter()
            .filter(|n| was_alive.contains(n.address()) || added.contains(n.address()))
            .cloned()
            .collect();
        state.nodes = next;

        info!(
            "Node list updated: {} added, {} removed, {} kept",
            update.added.len(),
            update.removed.len(),
            update.kept
        );
        update
    }

    /// Number of known nodes, alive or dead.
    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().nodes.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.state.lock().alive.len()
    }

    pub fn dead_count(&self) -> usize {
        let state = self.state.lock();
        state.nodes.len() - state.alive.len()
    }

    /// All known nodes in pool order.
    pub fn nodes(&self) -> Vec<Node> {
        self.state.lock().nodes.clone()
    }

    pub fn alive_nodes(&self) -> Vec<Node> {
        self.state.lock().alive.clone()
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.state.lock().order_of(address).is_some()
    }

    pub fn failure_record(&self, address: &NodeAddress) -> Option<FailureRecord> {
        self.state.lock().failures.get(address).copied()
    }

    /// Health snapshot of every node in pool order.
    pub fn status(&self) -> Vec<NodeStatus> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .nodes
            .iter()
            .map(|node| {
                let alive = state.is_alive(node.address());
                let record = state.failures.get(node.address());
                NodeStatus {
                    address: node.address().clone(),
                    alive,
                    consecutive_failures: record.map_or(0, |r| r.consecutive_failures),
                    resurrect_in_ms: record
                        .filter(|_| !alive)
                        .map(|r| r.remaining(now).as_millis() as u64),
                }
            })
            .collect()
    }
}

fn dedupe(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|node| {
            let fresh = seen.insert(node.address().clone());
            if !fresh {
                debug!("Ignoring duplicate node {}", node.address());
            }
            fresh
        })
        .collect()
}
