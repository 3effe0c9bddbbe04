use crate::node::NodeAddress;
use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What went wrong below the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The node could not be reached (refused, DNS, unreachable)
    Connect,
    /// The attempt did not complete within its timeout
    Timeout,
    /// The connection broke while sending or receiving
    Io,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Connect => f.write_str("connect"),
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::Io => f.write_str("io"),
        }
    }
}

/// Transport-level failure reported by an [`HttpExecutor`](crate::HttpExecutor).
///
/// The node never produced an HTTP response, so it is treated as unreachable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} failure on {node}: {message}")]
pub struct ConnectionFailure {
    pub node: NodeAddress,
    pub kind: FailureKind,
    pub message: String,
}

impl ConnectionFailure {
    pub fn new(node: NodeAddress, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            node,
            kind,
            message: message.into(),
        }
    }

    pub fn connect(node: NodeAddress, message: impl Into<String>) -> Self {
        Self::new(node, FailureKind::Connect, message)
    }

    pub fn timeout(node: NodeAddress, timeout: Duration) -> Self {
        Self::new(
            node,
            FailureKind::Timeout,
            format!("no response within {}ms", timeout.as_millis()),
        )
    }

    pub fn io(node: NodeAddress, message: impl Into<String>) -> Self {
        Self::new(node, FailureKind::Io, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

/// Why a request was aborted by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired
    Token,
    /// The caller's deadline passed
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Token => f.write_str("cancelled by caller"),
            CancelReason::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionFailure),

    #[error("Node {node} returned retryable status {status}")]
    RetryableStatus {
        node: NodeAddress,
        status: StatusCode,
        body: Bytes,
    },

    #[error("Node {node} returned status {status}")]
    NodeResponse {
        node: NodeAddress,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    #[error("No nodes available in the connection pool")]
    NoNodesAvailable,

    #[error("Selector invoked without alive nodes")]
    EmptyPool,

    #[error("Request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<TransportError>,
    },

    #[error("Request {0}")]
    Cancelled(CancelReason),

    #[error("Unable to sniff nodes: {0}")]
    Sniff(String),

    #[error("Invalid node address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns `true` for failures that mark the node dead and are retried on
    /// another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::RetryableStatus { .. }
        )
    }

    /// HTTP status carried by the error, if the node answered at all.
    ///
    /// For [`TransportError::RetriesExhausted`] this is the status of the last
    /// failure.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::RetryableStatus { status, .. }
            | TransportError::NodeResponse { status, .. } => Some(*status),
            TransportError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Address of the node the error originated from.
    pub fn node(&self) -> Option<&NodeAddress> {
        match self {
            TransportError::Connection(failure) => Some(&failure.node),
            TransportError::RetryableStatus { node, .. }
            | TransportError::NodeResponse { node, .. } => Some(node),
            TransportError::RetriesExhausted { last, .. } => last.node(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
