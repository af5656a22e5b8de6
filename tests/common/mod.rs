//! Multi-node test harness over the in-process transport: start members,
//! kill and restart them against the same stores, and poll for conditions
//! with a deadline.

// Each integration test binary compiles its own copy and uses a subset.
#![allow(dead_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quorate::{
    start_member, ClusterConfig, InMemoryLogStore, InMemoryStateManager, LocalNetwork, LogIndex, RaftMember,
    RaftMemberConfig, RaftOptions, ServerDescriptor, ServerId, SnapshotMeta, SnapshotUserCtx, StateMachine,
    StateMachineError, Transport,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};

pub fn endpoint_of(id: i32) -> String {
    format!("127.0.0.1:{}", 20000 + id * 10)
}

/// Quiet by default; set QUORATE_TEST_LOG=1 to watch a scenario unfold.
pub fn test_logger() -> slog::Logger {
    use slog::Drain;
    if std::env::var("QUORATE_TEST_LOG").is_err() {
        return slog::Logger::root(slog::Discard, slog::o!());
    }
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

pub fn descriptor(id: i32) -> ServerDescriptor {
    ServerDescriptor::new(ServerId::new(id), endpoint_of(id), 1)
}

/// Election/heartbeat timings small enough to keep scenarios fast, spread
/// enough to stay stable under load.
pub fn fast_options() -> RaftOptions {
    let mut options = RaftOptions::default();
    options.heartbeat_interval = Duration::from_millis(40);
    options.election_timeout_lower = Duration::from_millis(120);
    options.election_timeout_upper = Duration::from_millis(240);
    options.with_client_req_timeout = Duration::from_secs(5);
    options.limits.response_limit = 5;
    options
}

/// Deterministic application state machine: stores every applied entry,
/// snapshots as a flat byte blob, and can inject snapshot read failures.
pub struct AppStateMachine {
    pub applied: Vec<(u64, Bytes)>,
    pub last_applied: LogIndex,
    snapshot: Option<(SnapshotMeta, Bytes)>,
    incoming: BytesMut,
    pub inject_read_failures: u32,
    pub read_failure_count: u32,
}

impl AppStateMachine {
    pub fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(AppStateMachine {
            applied: Vec::new(),
            last_applied: LogIndex::ZERO,
            snapshot: None,
            incoming: BytesMut::new(),
            inject_read_failures: 0,
            read_failure_count: 0,
        }))
    }

    fn encode_state(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.applied.len() as u32);
        for (index, data) in &self.applied {
            buf.put_u64(*index);
            buf.put_u32(data.len() as u32);
            buf.put_slice(data);
        }
        buf.freeze()
    }

    fn decode_state(mut blob: Bytes) -> Vec<(u64, Bytes)> {
        let count = blob.get_u32() as usize;
        let mut applied = Vec::with_capacity(count);
        for _ in 0..count {
            let index = blob.get_u64();
            let len = blob.get_u32() as usize;
            applied.push((index, blob.copy_to_bytes(len)));
        }
        applied
    }
}

impl StateMachine for AppStateMachine {
    fn commit(&mut self, index: LogIndex, data: &Bytes) -> Bytes {
        self.applied.push((index.as_u64(), data.clone()));
        self.last_applied = index;
        data.clone()
    }

    fn create_snapshot(&mut self, meta: &SnapshotMeta) {
        let blob = self.encode_state();
        let mut meta = meta.clone();
        meta.size_bytes = blob.len() as u64;
        self.snapshot = Some((meta, blob));
    }

    fn save_snapshot_chunk(
        &mut self,
        _meta: &SnapshotMeta,
        offset: u64,
        data: &Bytes,
        _done: bool,
    ) -> Result<(), StateMachineError> {
        if offset as usize != self.incoming.len() {
            self.incoming.clear();
        }
        self.incoming.put_slice(data);
        Ok(())
    }

    fn read_snapshot_chunk(
        &mut self,
        _meta: &SnapshotMeta,
        _ctx: &mut Option<SnapshotUserCtx>,
        offset: u64,
        buf: &mut BytesMut,
    ) -> Result<usize, StateMachineError> {
        if self.inject_read_failures > 0 {
            self.inject_read_failures -= 1;
            self.read_failure_count += 1;
            return Err(StateMachineError::SnapshotRead {
                offset,
                reason: "injected failure".to_string(),
            });
        }
        let Some((_, blob)) = &self.snapshot else {
            return Err(StateMachineError::SnapshotRead {
                offset,
                reason: "no snapshot".to_string(),
            });
        };
        let offset = offset as usize;
        let end = std::cmp::min(offset + 4096, blob.len());
        if offset >= end {
            return Ok(0);
        }
        buf.put_slice(&blob[offset..end]);
        Ok(end - offset)
    }

    fn apply_snapshot(&mut self, meta: &SnapshotMeta) -> bool {
        let blob = self.incoming.split().freeze();
        self.applied = Self::decode_state(blob.clone());
        self.last_applied = meta.last_index;
        self.snapshot = Some((meta.clone(), blob));
        true
    }

    fn last_commit_index(&self) -> LogIndex {
        self.last_applied
    }

    fn last_snapshot(&self) -> Option<SnapshotMeta> {
        self.snapshot.as_ref().map(|(meta, _)| meta.clone())
    }
}

pub struct Member {
    pub member: RaftMember,
    pub log: InMemoryLogStore,
    pub state_manager: InMemoryStateManager,
    pub state_machine: Arc<Mutex<AppStateMachine>>,
    pub options: RaftOptions,
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub members: HashMap<i32, Member>,
}

impl TestCluster {
    pub fn new() -> Self {
        TestCluster {
            network: LocalNetwork::new(),
            members: HashMap::new(),
        }
    }

    /// Start a fresh member. `initial_servers` seeds its state manager;
    /// a joining server typically knows only itself and starts catching up.
    pub fn start(&mut self, id: i32, initial_servers: Vec<ServerDescriptor>, options: RaftOptions, catching_up: bool) {
        let log = InMemoryLogStore::new();
        let state_manager = InMemoryStateManager::new(ClusterConfig::new(initial_servers));
        let state_machine = AppStateMachine::new();
        self.launch(id, log, state_manager, state_machine, options, catching_up);
    }

    /// Bring a previously killed member back on its old stores.
    pub fn restart(&mut self, id: i32) {
        let old = self.members.remove(&id).expect("member to restart");
        self.launch(
            id,
            old.log,
            old.state_manager,
            old.state_machine,
            old.options,
            false,
        );
    }

    fn launch(
        &mut self,
        id: i32,
        log: InMemoryLogStore,
        state_manager: InMemoryStateManager,
        state_machine: Arc<Mutex<AppStateMachine>>,
        options: RaftOptions,
        catching_up: bool,
    ) {
        let member = start_member(
            RaftMemberConfig {
                my_id: ServerId::new(id),
                logger: test_logger(),
                options: options.clone(),
                catching_up,
                hooks: None,
            },
            log.clone(),
            state_manager.clone(),
            state_machine.clone() as Arc<Mutex<dyn StateMachine>>,
            Arc::new(self.network.clone()) as Arc<dyn Transport>,
        )
        .expect("member starts");

        self.network.register(endpoint_of(id), member.rpc_handler());
        self.members.insert(
            id,
            Member {
                member,
                log,
                state_manager,
                state_machine,
                options,
            },
        );
    }

    /// Simulate a crash: unreachable on the wire, coordination task gone.
    /// The member's stores stay in the map for a later `restart`.
    pub async fn kill(&mut self, id: i32) {
        self.network.set_down(&endpoint_of(id), true);
        if let Some(member) = self.members.get(&id) {
            member.member.shutdown().await;
        }
    }

    pub fn member(&self, id: i32) -> &RaftMember {
        &self.members.get(&id).expect("member").member
    }

    pub fn applied_len(&self, id: i32) -> usize {
        self.members
            .get(&id)
            .expect("member")
            .state_machine
            .lock()
            .unwrap()
            .applied
            .len()
    }

    /// Which member currently claims leadership, if any.
    pub fn current_leader(&self) -> Option<i32> {
        self.members
            .iter()
            .filter(|(_, m)| m.member.is_leader())
            .map(|(id, _)| *id)
            .next()
    }
}

/// Add a server through `leader_id`, waiting out any reconfiguration that
/// is still finalizing.
pub async fn add_server_when_ready(cluster: &TestCluster, leader_id: i32, descriptor: ServerDescriptor) {
    let give_up = Instant::now() + Duration::from_secs(10);
    loop {
        match cluster.member(leader_id).add_server(descriptor.clone()).await {
            Ok(()) => return,
            Err(quorate::MembershipError::ConfigChanging) if Instant::now() < give_up => {
                sleep(Duration::from_millis(50)).await;
            }
            Err(error) => panic!("add_server({}) failed: {}", descriptor.id, error),
        }
    }
}

/// Poll `condition` until it holds or `deadline` passes.
pub async fn wait_until<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let give_up = Instant::now() + deadline;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= give_up {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Like `wait_until`, for conditions that need to await.
pub async fn eventually<F, Fut>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let give_up = Instant::now() + deadline;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= give_up {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}
