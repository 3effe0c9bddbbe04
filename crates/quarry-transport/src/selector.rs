use quarry_common::protocol::error::{Result, TransportError};
use quarry_common::Node;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Strategy that picks the node for the next request.
///
/// Implementations receive the alive nodes in pool order and must return one
/// of them, or [`TransportError::EmptyPool`] when the slice is empty. They may
/// be called concurrently.
pub trait SelectNode: Send + Sync {
    fn select<'a>(&self, alive: &'a [Node]) -> Result<&'a Node>;
}

/// Round-robin over the alive nodes.
///
/// The cursor survives across requests and is reduced modulo the current
/// length on every call, so it stays in range when nodes die or come back.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clone for RoundRobinSelector {
    fn clone(&self) -> Self {
        Self {
            cursor: AtomicUsize::new(self.cursor.load(Ordering::Relaxed)),
        }
    }
}

impl SelectNode for RoundRobinSelector {
    fn select<'a>(&self, alive: &'a [Node]) -> Result<&'a Node> {
        if alive.is_empty() {
            return Err(TransportError::EmptyPool);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % alive.len();
        Ok(&alive[index])
    }
}

/// Uniformly random choice, no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSelector;

impl SelectNode for RandomSelector {
    fn select<'a>(&self, alive: &'a [Node]) -> Result<&'a Node> {
        if alive.is_empty() {
            return Err(TransportError::EmptyPool);
        }
        Ok(&alive[rand::random_range(0..alive.len())])
    }
}

/// The selection strategy configured for a pool.
#[derive(Clone)]
pub enum Selector {
    RoundRobin(RoundRobinSelector),
    Random(RandomSelector),
    Custom(Arc<dyn SelectNode>),
}

impl Selector {
    pub fn round_robin() -> Self {
        Selector::RoundRobin(RoundRobinSelector::new())
    }

    pub fn random() -> Self {
        Selector::Random(RandomSelector)
    }

    pub fn custom(selector: impl SelectNode + 'static) -> Self {
        Selector::Custom(Arc::new(selector))
    }

    /// Parses a strategy name as used on the command line.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "round-robin" | "round_robin" | "rr" => Ok(Self::round_robin()),
            "random" => Ok(Self::random()),
            other => Err(TransportError::InvalidConfig(format!(
                "unknown selector '{}', expected 'round-robin' or 'random'",
                other
            ))),
        }
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::round_robin()
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::RoundRobin(_) => f.write_str("RoundRobin"),
            Selector::Random(_) => f.write_str("Random"),
            Selector::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl SelectNode for Selector {
    fn select<'a>(&self, alive: &'a [Node]) -> Result<&'a Node> {
        match self {
            Selector::RoundRobin(selector) => selector.select(alive),
            Selector::Random(selector) => selector.select(alive),
            Selector::Custom(selector) => selector.select(alive),
        }
    }
}
