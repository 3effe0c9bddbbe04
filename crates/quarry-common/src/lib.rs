//! Quarry Common Types and Executors
//!
//! This crate provides the shared building blocks of the Quarry client
//! transport for search-and-analytics clusters:
//!
//! - **Protocol Layer**: request/response types and the error taxonomy
//! - **Node Records**: parsed node addresses and immutable node handles
//! - **Executors**: the [`HttpExecutor`] capability used to talk to one node,
//!   plus a hyper-based implementation
//!
//! Health tracking, node selection and retries live in `quarry-transport`.
//!
//! # Example
//!
//! ```no_run
//! use quarry_common::{HttpRequest, HyperExecutor, HttpExecutor, NodeAddress};
//! use hyper::Method;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let address: NodeAddress = "http://127.0.0.1:9200".parse()?;
//! let executor = HyperExecutor::new(address)?;
//! let response = executor.execute(HttpRequest::new(Method::GET, "/")).await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod executor;
pub mod node;
pub mod protocol;

pub use executor::{ExecutorFactory, HttpExecutor, HyperExecutor, HyperExecutorFactory};
pub use node::{Node, NodeAddress, Scheme, DEFAULT_PORT};
pub use protocol::*;
