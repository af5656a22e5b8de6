mod actor;
mod api;
mod commitlog;
mod replica;
mod transport;

pub use api::start_member;
pub use api::EventHooks;
pub use api::HookDecision;
pub use api::HookEvent;
pub use api::InvalidOptions;
pub use api::MemberStartError;
pub use api::NoOpHooks;
pub use api::RaftLimits;
pub use api::RaftMember;
pub use api::RaftMemberConfig;
pub use api::RaftOptions;
pub use api::ReplicateReceipt;
pub use api::ReturnMethod;
pub use commitlog::EntryKind;
pub use commitlog::InMemoryLogStore;
pub use commitlog::LogEntry;
pub use commitlog::LogIndex;
pub use commitlog::LogStore;
pub use commitlog::LogStoreError;
pub use commitlog::Term;
pub use replica::ClusterConfig;
pub use replica::CommitListener;
pub use replica::ExitCode;
pub use replica::InMemoryStateManager;
pub use replica::LeadershipTransferError;
pub use replica::MembershipError;
pub use replica::NoOpStateMachine;
pub use replica::PeerInfo;
pub use replica::PersistentState;
pub use replica::PriorityChangeError;
pub use replica::PriorityChangeResult;
pub use replica::RaftRequest;
pub use replica::RaftResponse;
pub use replica::ReplicateError;
pub use replica::Role;
pub use replica::ServerDescriptor;
pub use replica::ServerId;
pub use replica::ServerStatus;
pub use replica::SnapshotMeta;
pub use replica::SnapshotUserCtx;
pub use replica::StateMachine;
pub use replica::StateMachineError;
pub use replica::StateManager;
pub use replica::StateManagerError;
pub use transport::LocalNetwork;
pub use transport::PeerRpc;
pub use transport::RpcError;
pub use transport::RpcHandler;
pub use transport::Transport;

// The crate root only exports; implementation lives in the modules. All
// `mod` statements stay private and the public surface is assembled from
// individual `pub use` lines.
