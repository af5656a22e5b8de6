use crate::commitlog::{LogIndex, Term};
use crate::replica::cluster_config::ServerId;
use bytes::Bytes;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;

/// Server role. Learner is a role, not just a config flag: a learner never
/// votes, never campaigns, and never counts toward quorum.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Learner,
}

impl Role {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
            Role::Learner => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Role {
        match raw {
            1 => Role::Candidate,
            2 => Role::Leader,
            3 => Role::Learner,
            _ => Role::Follower,
        }
    }
}

#[derive(Debug)]
pub struct ReplicateInput {
    pub data: Bytes,
}

/// Accepted for replication. `commit` resolves once the entry is applied to
/// the state machine (with its output), or fails on overwrite, leadership
/// loss, or shutdown. Promise resolution order follows log index order, no
/// matter which thread runs the state machine.
#[derive(Debug)]
pub struct ReplicateOutput {
    pub term: Term,
    pub index: LogIndex,
    pub commit: CommitListener,
}

#[derive(Debug)]
pub struct CommitListener {
    rx: oneshot::Receiver<Result<Bytes, ReplicateError>>,
}

impl CommitListener {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Bytes, ReplicateError>>) -> Self {
        CommitListener { rx }
    }

    pub async fn wait(self) -> Result<Bytes, ReplicateError> {
        match self.rx.await {
            Ok(result) => result,
            // Promise dropped without firing: replica shut down.
            Err(_) => Err(ReplicateError::ShuttingDown),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicateError {
    #[error("not the leader; try server {leader_hint}")]
    NotLeader {
        leader_hint: ServerId,
        leader_endpoint: Option<String>,
    },
    #[error("no leader is known right now")]
    NoLeader,
    #[error("failed to persist entry: {0}")]
    LocalIo(String),
    #[error("lost leadership before the entry committed")]
    LeadershipLost,
    #[error("entry was overwritten by a newer leader")]
    Overwritten,
    #[error("timed out waiting for commit")]
    Timeout,
    #[error("request forwarding to leader failed: {0}")]
    ForwardingFailed(String),
    #[error("replica is shutting down")]
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("not the leader; membership changes go through server {leader_hint}")]
    NotLeader { leader_hint: ServerId },
    #[error("another configuration change is in progress")]
    ConfigChanging,
    #[error("server {0} is already a member")]
    AlreadyMember(ServerId),
    #[error("server {0} is not a member")]
    NotAMember(ServerId),
    #[error("cannot remove the current leader; transfer leadership first")]
    CannotRemoveLeader,
    #[error("failed to persist configuration entry: {0}")]
    LocalIo(String),
    #[error("replica is shutting down")]
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum LeadershipTransferError {
    #[error("not the leader")]
    NotLeader,
    #[error("no up-to-date successor is available")]
    NoEligibleSuccessor,
    #[error("not all voting peers are responsive; refusing to transfer")]
    PeersNotReady,
    #[error("a transfer was attempted too recently")]
    TooSoon,
    #[error("replica is shutting down")]
    ShuttingDown,
}

/// Outcome of `set_priority`. `Broadcast` means the call landed on a
/// follower and was relayed; delivery is best-effort and receivers apply
/// the change idempotently.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PriorityChangeResult {
    Set,
    Broadcast,
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum PriorityChangeError {
    #[error("replica is shutting down")]
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("message metadata was rejected by the read-side hook")]
    MetaRejected,
    #[error("replica is shutting down")]
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
#[error("replica coordination task has exited")]
pub struct ActorDead;

/// Leader-side view of one peer, for operators.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: ServerId,
    pub endpoint: String,
    pub next_index: LogIndex,
    pub matched_index: LogIndex,
    pub last_sent_age: Option<Duration>,
    pub last_response_age: Option<Duration>,
    pub in_flight: bool,
    pub is_learner: bool,
    pub is_new_joiner: bool,
    pub priority: i32,
}

impl PeerInfo {
    /// What a non-leader answers: nothing, marked by the `-1` id.
    pub fn none() -> Self {
        PeerInfo {
            id: ServerId::NONE,
            endpoint: String::new(),
            next_index: LogIndex::ZERO,
            matched_index: LogIndex::ZERO,
            last_sent_age: None,
            last_response_age: None,
            in_flight: false,
            is_learner: false,
            is_new_joiner: false,
            priority: 0,
        }
    }
}

/// Point-in-time view of the server, readable without a round-trip through
/// the coordination task.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub id: ServerId,
    pub role: Role,
    pub term: Term,
    pub leader: ServerId,
    pub commit_index: LogIndex,
    pub last_applied_index: LogIndex,
    pub last_log_index: LogIndex,
    pub last_durable_index: LogIndex,
    pub my_priority: i32,
    pub target_priority: i32,
    pub open_snapshot_contexts: u64,
}

impl ServerStatus {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

/// The atomics behind `ServerStatus`. Written by the coordination task (and
/// the apply task, for `last_applied`), read by anyone.
pub struct SharedStatus {
    id: ServerId,
    role: AtomicU8,
    term: AtomicU64,
    leader: AtomicI32,
    commit_index: AtomicU64,
    last_applied_index: AtomicU64,
    last_log_index: AtomicU64,
    last_durable_index: AtomicU64,
    my_priority: AtomicI32,
    target_priority: AtomicI32,
    open_snapshot_contexts: AtomicU64,
}

impl SharedStatus {
    pub fn new(id: ServerId) -> Arc<Self> {
        Arc::new(SharedStatus {
            id,
            role: AtomicU8::new(Role::Follower.as_u8()),
            term: AtomicU64::new(0),
            leader: AtomicI32::new(ServerId::NONE.as_i32()),
            commit_index: AtomicU64::new(0),
            last_applied_index: AtomicU64::new(0),
            last_log_index: AtomicU64::new(0),
            last_durable_index: AtomicU64::new(0),
            my_priority: AtomicI32::new(1),
            target_priority: AtomicI32::new(1),
            open_snapshot_contexts: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> ServerStatus {
        ServerStatus {
            id: self.id,
            role: Role::from_u8(self.role.load(Ordering::Acquire)),
            term: Term::new(self.term.load(Ordering::Acquire)),
            leader: ServerId::new(self.leader.load(Ordering::Acquire)),
            commit_index: LogIndex::new(self.commit_index.load(Ordering::Acquire)),
            last_applied_index: LogIndex::new(self.last_applied_index.load(Ordering::Acquire)),
            last_log_index: LogIndex::new(self.last_log_index.load(Ordering::Acquire)),
            last_durable_index: LogIndex::new(self.last_durable_index.load(Ordering::Acquire)),
            my_priority: self.my_priority.load(Ordering::Acquire),
            target_priority: self.target_priority.load(Ordering::Acquire),
            open_snapshot_contexts: self.open_snapshot_contexts.load(Ordering::Acquire),
        }
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role.as_u8(), Ordering::Release);
    }

    pub fn set_term(&self, term: Term) {
        self.term.store(term.as_u64(), Ordering::Release);
    }

    pub fn set_leader(&self, leader: ServerId) {
        self.leader.store(leader.as_i32(), Ordering::Release);
    }

    pub fn set_commit_index(&self, index: LogIndex) {
        self.commit_index.store(index.as_u64(), Ordering::Release);
    }

    pub fn set_last_applied_index(&self, index: LogIndex) {
        self.last_applied_index.store(index.as_u64(), Ordering::Release);
    }

    pub fn last_applied_index(&self) -> LogIndex {
        LogIndex::new(self.last_applied_index.load(Ordering::Acquire))
    }

    pub fn set_last_log_index(&self, index: LogIndex) {
        self.last_log_index.store(index.as_u64(), Ordering::Release);
    }

    pub fn set_last_durable_index(&self, index: LogIndex) {
        self.last_durable_index.store(index.as_u64(), Ordering::Release);
    }

    pub fn set_priorities(&self, mine: i32, target: i32) {
        self.my_priority.store(mine, Ordering::Release);
        self.target_priority.store(target, Ordering::Release);
    }

    pub fn set_open_snapshot_contexts(&self, count: u64) {
        self.open_snapshot_contexts.store(count, Ordering::Release);
    }
}
