mod local;

pub use local::LocalNetwork;

use crate::replica::{RaftRequest, RaftResponse};
use std::sync::Arc;

/// Errors crossing the RPC boundary. Everything here is transient from the
/// engine's point of view; protocol-level refusals travel inside responses.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("endpoint '{0}' is unreachable")]
    Unreachable(String),
    #[error("request to '{0}' timed out")]
    Timeout(String),
    #[error("peer dropped the request: {0}")]
    Dropped(String),
}

/// Client side of the wire: one logical connection to one peer. The engine
/// recreates these on reconnect; implementations may connect lazily.
#[async_trait::async_trait]
pub trait PeerRpc: Send + Sync + 'static {
    async fn send(&self, request: RaftRequest) -> Result<RaftResponse, RpcError>;
}

/// Server side of the wire: the engine's single inbound entry point.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: RaftRequest) -> Result<RaftResponse, RpcError>;
}

/// Connection factory. Carriage of bytes is out of the engine's scope; any
/// transport that can deliver a `RaftRequest` to the `RpcHandler` registered
/// at an endpoint and bring back the `RaftResponse` fits here.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, endpoint: &str) -> Arc<dyn PeerRpc>;
}
