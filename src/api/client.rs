use crate::actor::ActorClient;
use crate::api::options::{RaftOptions, ReturnMethod};
use crate::commitlog::{LogIndex, Term};
use crate::replica::{
    CommitListener, LeadershipTransferError, MembershipError, PeerInfo, PriorityChangeError, PriorityChangeResult,
    ReplicateError, ReplicateInput, ServerDescriptor, ServerId, ServerStatus, SharedStatus,
};
use crate::transport::RpcHandler;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Duration;

/// Outcome of a client submission. Under `ReturnMethod::Blocking` the entry
/// is already applied; under `ReturnMethod::Async` the listener resolves
/// when it is.
#[derive(Debug)]
pub enum ReplicateReceipt {
    Committed {
        term: Term,
        index: LogIndex,
        result: Bytes,
    },
    Pending {
        term: Term,
        index: LogIndex,
        listener: CommitListener,
    },
}

/// Handle to a running replica. Cheap to clone; all mutation goes through
/// the coordination task, reads come from the shared status snapshot.
#[derive(Clone)]
pub struct RaftMember {
    actor_client: ActorClient,
    status: Arc<SharedStatus>,
    rpc_handler: Arc<dyn RpcHandler>,
    return_method: ReturnMethod,
    client_req_timeout: Duration,
}

impl RaftMember {
    pub(crate) fn new(
        actor_client: ActorClient,
        status: Arc<SharedStatus>,
        rpc_handler: Arc<dyn RpcHandler>,
        options: &RaftOptions,
    ) -> Self {
        RaftMember {
            actor_client,
            status,
            rpc_handler,
            return_method: options.return_method,
            client_req_timeout: options.with_client_req_timeout,
        }
    }

    /// The inbound half of this member: register it with whatever carries
    /// requests to this process.
    pub fn rpc_handler(&self) -> Arc<dyn RpcHandler> {
        Arc::clone(&self.rpc_handler)
    }

    /// Submit a command for replication. On a follower this redirects (or
    /// auto-forwards, when enabled).
    pub async fn replicate(&self, data: Bytes) -> Result<ReplicateReceipt, ReplicateError> {
        let output = self.actor_client.replicate(ReplicateInput { data }).await?;
        match self.return_method {
            ReturnMethod::Async => Ok(ReplicateReceipt::Pending {
                term: output.term,
                index: output.index,
                listener: output.commit,
            }),
            ReturnMethod::Blocking => {
                let wait = output.commit.wait();
                let result = if self.client_req_timeout.is_zero() {
                    wait.await?
                } else {
                    match tokio::time::timeout(self.client_req_timeout, wait).await {
                        Ok(result) => result?,
                        // The entry may still commit later; the state
                        // machine sees it regardless.
                        Err(_) => return Err(ReplicateError::Timeout),
                    }
                };
                Ok(ReplicateReceipt::Committed {
                    term: output.term,
                    index: output.index,
                    result,
                })
            }
        }
    }

    pub async fn add_server(&self, descriptor: ServerDescriptor) -> Result<(), MembershipError> {
        self.actor_client.add_server(descriptor).await
    }

    pub async fn remove_server(&self, server_id: ServerId) -> Result<(), MembershipError> {
        self.actor_client.remove_server(server_id).await
    }

    pub async fn yield_leadership(
        &self,
        immediate: bool,
        successor: Option<ServerId>,
    ) -> Result<(), LeadershipTransferError> {
        self.actor_client.yield_leadership(immediate, successor).await
    }

    pub async fn set_priority(
        &self,
        server_id: ServerId,
        new_priority: i32,
    ) -> Result<PriorityChangeResult, PriorityChangeError> {
        self.actor_client.set_priority(server_id, new_priority).await
    }

    /// Stop applying committed entries; replication and commit continue.
    pub async fn pause_apply(&self, auto_resume: Option<Duration>) {
        self.actor_client.pause_apply(auto_resume).await;
    }

    pub async fn resume_apply(&self) {
        self.actor_client.resume_apply().await;
    }

    /// Leader: per-peer replication progress. Non-leaders report nothing.
    pub async fn get_peer_info_all(&self) -> Vec<PeerInfo> {
        self.actor_client.get_peer_info().await.unwrap_or_default()
    }

    /// Single-peer variant; answers `PeerInfo::none()` (id `-1`) when this
    /// server is not the leader or does not track the peer.
    pub async fn get_peer_info(&self, server_id: ServerId) -> PeerInfo {
        self.get_peer_info_all()
            .await
            .into_iter()
            .find(|p| p.id == server_id)
            .unwrap_or_else(PeerInfo::none)
    }

    pub fn status(&self) -> ServerStatus {
        self.status.snapshot()
    }

    pub fn is_leader(&self) -> bool {
        self.status.snapshot().is_leader()
    }

    /// Current leader's id, `-1` while unknown.
    pub fn get_leader(&self) -> ServerId {
        self.status.snapshot().leader
    }

    pub async fn shutdown(&self) {
        self.actor_client.shutdown().await;
    }
}
