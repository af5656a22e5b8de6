mod apply;
pub mod cluster_config;
mod election;
mod local_state;
mod membership;
mod messages;
mod peers;
mod replica;
mod replica_api;
mod replication;
mod snapshot;
mod state_machine;
#[cfg(test)]
mod test_support;
pub mod timers;

pub use apply::ApplyItem;
pub use apply::CommitPromise;
pub use cluster_config::ClusterConfig;
pub use cluster_config::ConfigDecodeError;
pub use cluster_config::ServerDescriptor;
pub use cluster_config::ServerId;
pub use local_state::ExitCode;
pub use local_state::InMemoryStateManager;
pub use local_state::PersistentState;
pub use local_state::StateManager;
pub use local_state::StateManagerError;
pub use messages::AppendEntriesRequest;
pub use messages::AppendEntriesResponse;
pub use messages::ClientWriteRequest;
pub use messages::ClientWriteResponse;
pub use messages::CustomNotificationKind;
pub use messages::CustomNotificationRequest;
pub use messages::CustomNotificationResponse;
pub use messages::InstallSnapshotRequest;
pub use messages::InstallSnapshotResponse;
pub use messages::MessageHeader;
pub use messages::PreVoteRequest;
pub use messages::PreVoteResponse;
pub use messages::PriorityChangeRequest;
pub use messages::PriorityChangeResponse;
pub use messages::RaftRequest;
pub use messages::RaftResponse;
pub use messages::ReconnectRequest;
pub use messages::ReconnectResponse;
pub use messages::VoteRequest;
pub use messages::VoteResponse;
pub use replica::Replica;
pub use replica::ReplicaConfig;
pub use replica_api::ActorDead;
pub use replica_api::CommitListener;
pub use replica_api::LeadershipTransferError;
pub use replica_api::MembershipError;
pub use replica_api::PeerInfo;
pub use replica_api::PriorityChangeError;
pub use replica_api::PriorityChangeResult;
pub use replica_api::ReplicateError;
pub use replica_api::ReplicateInput;
pub use replica_api::ReplicateOutput;
pub use replica_api::RequestError;
pub use replica_api::Role;
pub use replica_api::ServerStatus;
pub use replica_api::SharedStatus;
pub use state_machine::NoOpStateMachine;
pub use state_machine::SnapshotMeta;
pub use state_machine::SnapshotUserCtx;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineError;
