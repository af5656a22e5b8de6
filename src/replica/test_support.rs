//! Shared fixture for engine unit tests: a replica wired to an empty
//! in-process network, driven by calling its handlers directly instead of
//! through the actor loop.

use crate::actor::{ActorClient, Callback, Event};
use crate::api::{NoOpHooks, RaftOptions};
use crate::commitlog::{InMemoryLogStore, LogIndex, Term};
use crate::replica::cluster_config::{ClusterConfig, ServerDescriptor, ServerId};
use crate::replica::local_state::InMemoryStateManager;
use crate::replica::messages::{
    AppendEntriesRequest, AppendEntriesResponse, MessageHeader, RaftRequest, RaftResponse,
};
use crate::replica::replica::{Replica, ReplicaConfig};
use crate::replica::replica_api::SharedStatus;
use crate::replica::state_machine::{
    SnapshotMeta, SnapshotUserCtx, StateMachine, StateMachineError,
};
use crate::transport::LocalNetwork;
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// State machine with knobs the replication tests can turn.
pub(super) struct TestStateMachine {
    pub applied: Vec<(LogIndex, Bytes)>,
    pub last_applied: LogIndex,
    pub batch_hint: i64,
    pub committers: Option<Vec<ServerId>>,
    pub snapshot: Option<SnapshotMeta>,
    pub saved_chunks: Vec<(u64, usize, bool)>,
}

impl TestStateMachine {
    pub fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(TestStateMachine {
            applied: Vec::new(),
            last_applied: LogIndex::ZERO,
            batch_hint: 0,
            committers: None,
            snapshot: None,
            saved_chunks: Vec::new(),
        }))
    }
}

impl StateMachine for TestStateMachine {
    fn commit(&mut self, index: LogIndex, data: &Bytes) -> Bytes {
        self.applied.push((index, data.clone()));
        self.last_applied = index;
        data.clone()
    }

    fn save_snapshot_chunk(
        &mut self,
        _meta: &SnapshotMeta,
        offset: u64,
        data: &Bytes,
        done: bool,
    ) -> Result<(), StateMachineError> {
        self.saved_chunks.push((offset, data.len(), done));
        Ok(())
    }

    fn read_snapshot_chunk(
        &mut self,
        _meta: &SnapshotMeta,
        _ctx: &mut Option<SnapshotUserCtx>,
        _offset: u64,
        _buf: &mut BytesMut,
    ) -> Result<usize, StateMachineError> {
        Ok(0)
    }

    fn apply_snapshot(&mut self, meta: &SnapshotMeta) -> bool {
        self.last_applied = meta.last_index;
        self.snapshot = Some(meta.clone());
        true
    }

    fn last_commit_index(&self) -> LogIndex {
        self.last_applied
    }

    fn last_snapshot(&self) -> Option<SnapshotMeta> {
        self.snapshot.clone()
    }

    fn next_batch_size_hint_in_bytes(&self) -> i64 {
        self.batch_hint
    }

    fn custom_committers(&self, _index: LogIndex) -> Option<Vec<ServerId>> {
        self.committers.clone()
    }
}

pub(super) struct ReplicaFixture {
    pub replica: Replica<InMemoryLogStore, InMemoryStateManager>,
    pub state_machine: Arc<Mutex<TestStateMachine>>,
    pub state_manager: InMemoryStateManager,
    pub log: InMemoryLogStore,
    pub network: LocalNetwork,
    // Kept alive so handler-spawned workers can still post events.
    pub actor_rx: mpsc::Receiver<Event>,
}

pub(super) fn descriptors(ids: &[i32]) -> Vec<ServerDescriptor> {
    ids.iter()
        .map(|id| ServerDescriptor::new(ServerId::new(*id), format!("s{}", id), 1))
        .collect()
}

pub(super) fn fixture(servers: Vec<ServerDescriptor>, my_id: i32) -> ReplicaFixture {
    fixture_with_options(servers, my_id, RaftOptions::default())
}

pub(super) fn fixture_with_options(
    servers: Vec<ServerDescriptor>,
    my_id: i32,
    options: RaftOptions,
) -> ReplicaFixture {
    let my_id = ServerId::new(my_id);
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    let network = LocalNetwork::new();
    let log = InMemoryLogStore::new();
    let state_manager = InMemoryStateManager::new(ClusterConfig::new(servers));
    let state_machine = TestStateMachine::new();
    let status = SharedStatus::new(my_id);
    let (actor_client, actor_rx) = ActorClient::channel(256);

    let replica = Replica::new(ReplicaConfig {
        logger,
        my_id,
        options,
        hooks: Arc::new(NoOpHooks),
        log: log.clone(),
        state_manager: state_manager.clone(),
        state_machine: state_machine.clone() as Arc<Mutex<dyn StateMachine>>,
        transport: Arc::new(network.clone()),
        catching_up: false,
        actor_client,
        status,
    });

    ReplicaFixture {
        replica,
        state_machine,
        state_manager,
        log,
        network,
        actor_rx,
    }
}

impl ReplicaFixture {
    /// Promote directly to leader at `term`, bypassing the vote protocol.
    pub fn make_leader(&mut self, term: u64) {
        self.replica.state.term = Term::new(term);
        self.replica.persist_state();
        self.replica.become_leader();
    }

    pub fn header_from(&self, src: i32, term: u64) -> MessageHeader {
        MessageHeader {
            term: Term::new(term),
            src: ServerId::new(src),
            dst: self.replica.my_id,
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
            commit_index: LogIndex::ZERO,
            meta: None,
        }
    }

    /// Run an append-entries through the full router and hand back the
    /// typed response.
    pub async fn deliver_append(&mut self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.replica
            .handle_incoming_request(RaftRequest::AppendEntries(request), Callback::new(tx));
        match rx.await.expect("append response") {
            Ok(RaftResponse::AppendEntries(response)) => response,
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
