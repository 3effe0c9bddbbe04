//! In-memory executors for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use hyper::StatusCode;
use parking_lot::Mutex;
use quarry_common::protocol::error::Result;
use quarry_common::{
    ConnectionFailure, ExecutorFactory, HttpExecutor, HttpRequest, HttpResponse, Node,
    NodeAddress,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Status(u16, Bytes),
    Refuse,
    Timeout,
    Hang,
}

impl Reply {
    pub(crate) fn ok() -> Self {
        Reply::Status(200, Bytes::from_static(b"{}"))
    }

    pub(crate) fn status(code: u16) -> Self {
        Reply::Status(code, Bytes::from_static(b"{}"))
    }

    pub(crate) fn json(value: serde_json::Value) -> Self {
        Reply::Status(200, Bytes::from(value.to_string()))
    }
}

/// Answers with queued one-shot replies first, then with the standing reply.
pub(crate) struct MockExecutor {
    address: NodeAddress,
    queued: Mutex<VecDeque<Reply>>,
    standing: Mutex<Reply>,
    calls: AtomicUsize,
    paths: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub(crate) fn new(address: NodeAddress) -> Self {
        Self {
            address,
            queued: Mutex::new(VecDeque::new()),
            standing: Mutex::new(Reply::ok()),
            calls: AtomicUsize::new(0),
            paths: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set(&self, reply: Reply) {
        *self.standing.lock() = reply;
    }

    pub(crate) fn push(&self, reply: Reply) {
        self.queued.lock().push_back(reply);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

#[async_trait]
impl HttpExecutor for MockExecutor {
    async fn execute(
        &self,
        request: HttpRequest,
    ) -> std::result::Result<HttpResponse, ConnectionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().push(request.path_and_query());

        let reply = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.standing.lock().clone());

        match reply {
            Reply::Status(code, body) => Ok(HttpResponse::new(
                StatusCode::from_u16(code).unwrap(),
                body,
            )),
            Reply::Refuse => Err(ConnectionFailure::connect(
                self.address.clone(),
                "connection refused",
            )),
            Reply::Timeout => Err(ConnectionFailure::timeout(
                self.address.clone(),
                request.timeout.unwrap_or(Duration::from_secs(1)),
            )),
            Reply::Hang => std::future::pending().await,
        }
    }
}

pub(crate) fn address(i: usize) -> NodeAddress {
    NodeAddress::parse(&format!("http://10.0.0.{}:9200", i + 1)).unwrap()
}

pub(crate) fn mock_node(i: usize) -> (Node, Arc<MockExecutor>) {
    let executor = Arc::new(MockExecutor::new(address(i)));
    (Node::new(address(i), executor.clone()), executor)
}

pub(crate) fn mock_nodes(n: usize) -> (Vec<Node>, Vec<Arc<MockExecutor>>) {
    (0..n).map(mock_node).unzip()
}

/// Hands out one shared mock per address, creating it on first use.
#[derive(Default)]
pub(crate) struct MockFactory {
    executors: Mutex<HashMap<NodeAddress, Arc<MockExecutor>>>,
}

impl MockFactory {
    pub(crate) fn executor(&self, address: &NodeAddress) -> Arc<MockExecutor> {
        self.executors
            .lock()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(MockExecutor::new(address.clone())))
            .clone()
    }

    pub(crate) fn node(&self, i: usize) -> Node {
        let address = address(i);
        Node::new(address.clone(), self.executor(&address))
    }
}

impl ExecutorFactory for MockFactory {
    fn build(&self, address: &NodeAddress) -> Result<Arc<dyn HttpExecutor>> {
        Ok(self.executor(address))
    }
}
