//! Quarry HTTP Executors
//!
//! An executor is the capability to send one HTTP request to one node. The
//! transport core never talks to the network directly; it calls the executor
//! bound to the node it selected and interprets the result.
//!
//! # Components
//!
//! - **[`HttpExecutor`]**: per-node request capability
//! - **[`ExecutorFactory`]**: builds executors for addresses, used for the
//!   initial node list and for nodes found by discovery
//! - **[`HyperExecutor`]** / **[`HyperExecutorFactory`]**: the default
//!   implementation on top of `hyper-util`'s pooled client

mod hyper_executor;

pub use hyper_executor::{HyperExecutor, HyperExecutorFactory};

use crate::node::NodeAddress;
use crate::protocol::error::{ConnectionFailure, Result};
use crate::protocol::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use std::sync::Arc;

/// Sends requests to the single node it is bound to.
///
/// Any HTTP response, whatever its status, is `Ok`. Only failures where no
/// response was obtained are reported as [`ConnectionFailure`].
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(
        &self,
        request: HttpRequest,
    ) -> std::result::Result<HttpResponse, ConnectionFailure>;
}

/// Creates executors for node addresses.
pub trait ExecutorFactory: Send + Sync {
    fn build(&self, address: &NodeAddress) -> Result<Arc<dyn HttpExecutor>>;
}
