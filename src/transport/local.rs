use crate::replica::{RaftRequest, RaftResponse};
use crate::transport::{PeerRpc, RpcError, RpcHandler, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-process transport: routes requests between members of a group living
/// in the same process by endpoint string. This is what the integration
/// tests run on, and what embedding applications can use for single-process
/// multi-replica setups.
///
/// An endpoint can be taken down (simulating a crashed or partitioned
/// server) without deregistering its handler; requests then fail with
/// `RpcError::Unreachable` on the caller side.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
    down: HashMap<String, bool>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        let endpoint = endpoint.into();
        let mut inner = self.inner.lock().expect("local network lock");
        inner.down.insert(endpoint.clone(), false);
        inner.handlers.insert(endpoint, handler);
    }

    pub fn deregister(&self, endpoint: &str) {
        let mut inner = self.inner.lock().expect("local network lock");
        inner.handlers.remove(endpoint);
        inner.down.remove(endpoint);
    }

    /// Take an endpoint down or bring it back without losing its handler.
    pub fn set_down(&self, endpoint: &str, down: bool) {
        let mut inner = self.inner.lock().expect("local network lock");
        if let Some(flag) = inner.down.get_mut(endpoint) {
            *flag = down;
        }
    }

    fn resolve(&self, endpoint: &str) -> Result<Arc<dyn RpcHandler>, RpcError> {
        let inner = self.inner.lock().expect("local network lock");
        if inner.down.get(endpoint).copied().unwrap_or(false) {
            return Err(RpcError::Unreachable(endpoint.to_string()));
        }
        inner
            .handlers
            .get(endpoint)
            .cloned()
            .ok_or_else(|| RpcError::Unreachable(endpoint.to_string()))
    }
}

impl Transport for LocalNetwork {
    fn connect(&self, endpoint: &str) -> Arc<dyn PeerRpc> {
        Arc::new(LocalChannel {
            network: self.clone(),
            endpoint: endpoint.to_string(),
        })
    }
}

/// One logical connection to one endpoint. Resolution happens per request,
/// so a channel created while the target was down starts working as soon as
/// the target comes up (lazy-connect semantics).
struct LocalChannel {
    network: LocalNetwork,
    endpoint: String,
}

#[async_trait::async_trait]
impl PeerRpc for LocalChannel {
    async fn send(&self, request: RaftRequest) -> Result<RaftResponse, RpcError> {
        let handler = self.network.resolve(&self.endpoint)?;
        handler.handle(request).await
    }
}
