//! The replica coordinator. One instance per server, exclusively owned by
//! the actor task: every role transition, peer mutation, and timer decision
//! funnels through `&mut self` handlers here and in the sibling modules
//! (election, replication, snapshot, membership).

use crate::actor::{ActorClient, Callback};
use crate::api::{EventHooks, HookEvent, RaftOptions};
use crate::commitlog::{LogIndex, LogStore, Term};
use crate::replica::apply::{ApplyPipeline, CommitPromise};
use crate::replica::cluster_config::{ClusterConfig, ServerId};
use crate::replica::election::{ElectionRound, PreVoteRound};
use crate::replica::local_state::{PersistentState, StateManager};
use crate::replica::membership::ConfigChange;
use crate::replica::messages::{
    CustomNotificationKind, CustomNotificationRequest, CustomNotificationResponse, MessageHeader,
    PriorityChangeRequest, PriorityChangeResponse, RaftRequest, RaftResponse, ReconnectRequest, ReconnectResponse,
};
use crate::replica::peers::PeerTracker;
use crate::replica::replica_api::{
    LeadershipTransferError, PeerInfo, PriorityChangeError, PriorityChangeResult, ReplicateError, RequestError, Role,
    SharedStatus,
};
use crate::replica::replication::ForwardingPool;
use crate::replica::state_machine::{SnapshotMeta, StateMachine};
use crate::replica::timers::{ElectionTimerHandle, HeartbeatTimerHandle, Stopwatch};
use crate::transport::Transport;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

pub struct ReplicaConfig<L, S>
where
    L: LogStore,
    S: StateManager,
{
    pub logger: slog::Logger,
    pub my_id: ServerId,
    pub options: RaftOptions,
    pub hooks: Arc<dyn EventHooks>,
    pub log: L,
    pub state_manager: S,
    pub state_machine: Arc<Mutex<dyn StateMachine>>,
    pub transport: Arc<dyn Transport>,
    /// Start as a catching-up member: accept every pre-vote, never count in
    /// quorum, until a configuration entry makes us a regular member.
    pub catching_up: bool,
    pub actor_client: ActorClient,
    pub status: Arc<SharedStatus>,
}

pub struct Replica<L, S>
where
    L: LogStore,
    S: StateManager,
{
    pub(super) logger: slog::Logger,
    pub(super) my_id: ServerId,
    pub(super) options: RaftOptions,
    pub(super) hooks: Arc<dyn EventHooks>,

    pub(super) log: L,
    pub(super) state_manager: S,
    pub(super) state: PersistentState,
    pub(super) state_machine: Arc<Mutex<dyn StateMachine>>,

    /// Latest (possibly uncommitted) configuration; authoritative.
    pub(super) config: ClusterConfig,
    /// Last configuration whose entry is known committed.
    pub(super) committed_config: ClusterConfig,
    pub(super) config_change: Option<ConfigChange>,
    pub(super) peers: PeerTracker,

    pub(super) role: Role,
    pub(super) leader: ServerId,
    pub(super) hb_alive: bool,
    /// Wall-clock of the last accepted leader append/snapshot; guards
    /// against an election-timeout event that raced with fresh contact.
    pub(super) last_leader_contact: Option<Instant>,
    pub(super) catching_up: bool,
    pub(super) steps_to_down: u8,
    pub(super) shutting_down: bool,

    pub(super) commit_index: LogIndex,
    pub(super) last_enqueued_apply: LogIndex,
    pub(super) lagging_sm_target_index: LogIndex,
    pub(super) index_at_becoming_leader: LogIndex,
    pub(super) cached_snapshot: Option<SnapshotMeta>,

    pub(super) promises: BTreeMap<LogIndex, CommitPromise>,
    pub(super) status: Arc<SharedStatus>,
    pub(super) actor_client: ActorClient,
    pub(super) apply_pipeline: ApplyPipeline,

    pub(super) election_timer: Option<ElectionTimerHandle>,
    pub(super) heartbeat_timers: HashMap<ServerId, HeartbeatTimerHandle>,
    pub(super) pre_vote: PreVoteRound,
    pub(super) election: ElectionRound,

    pub(super) my_priority: i32,
    pub(super) target_priority: i32,
    pub(super) priority_change_timer: Stopwatch,
    pub(super) vote_init_timer: Stopwatch,
    pub(super) vote_init_timer_term: Term,
    pub(super) leadership_transfer_timer: Stopwatch,
    /// While leader: time since a quorum of voters last looked alive.
    pub(super) leader_quorum_timer: Stopwatch,

    pub(super) forwarding: ForwardingPool,
}

impl<L, S> Replica<L, S>
where
    L: LogStore,
    S: StateManager,
{
    pub fn new(config: ReplicaConfig<L, S>) -> Self {
        let state = config
            .state_manager
            .load_state()
            .ok()
            .flatten()
            .unwrap_or_else(PersistentState::initial);
        let cluster_config = config
            .state_manager
            .load_config()
            .ok()
            .flatten()
            .unwrap_or_else(|| ClusterConfig::new(Vec::new()));

        let mut peers = PeerTracker::new(config.my_id, Arc::clone(&config.transport));
        peers.sync_with_config(&cluster_config, config.log.next_slot());

        let my_descriptor = cluster_config.get_server(config.my_id);
        let my_priority = my_descriptor.map(|s| s.priority).unwrap_or(1);
        let is_learner = my_descriptor.map(|s| s.is_learner).unwrap_or(false);
        let role = if is_learner { Role::Learner } else { Role::Follower };
        let target_priority = std::cmp::max(1, cluster_config.max_priority());

        let (commit_floor, cached_snapshot) = {
            let sm = config.state_machine.lock().expect("state machine lock");
            (sm.last_commit_index(), sm.last_snapshot())
        };

        config.status.set_term(state.term);
        config.status.set_role(role);
        config.status.set_commit_index(commit_floor);
        config.status.set_last_applied_index(commit_floor);
        config.status.set_last_log_index(config.log.next_slot().prev());
        config.status.set_last_durable_index(config.log.last_durable_index());
        config.status.set_priorities(my_priority, target_priority);

        let apply_pipeline = ApplyPipeline::spawn(
            config.logger.clone(),
            Arc::clone(&config.state_machine),
            Arc::clone(&config.status),
            config.actor_client.clone(),
        );

        let mut replica = Replica {
            logger: config.logger,
            my_id: config.my_id,
            options: config.options,
            hooks: config.hooks,
            log: config.log,
            state_manager: config.state_manager,
            state,
            state_machine: config.state_machine,
            config: cluster_config.clone(),
            committed_config: cluster_config,
            config_change: None,
            peers,
            role,
            leader: ServerId::NONE,
            hb_alive: false,
            last_leader_contact: None,
            catching_up: config.catching_up,
            steps_to_down: 0,
            shutting_down: false,
            commit_index: commit_floor,
            last_enqueued_apply: commit_floor,
            lagging_sm_target_index: commit_floor,
            index_at_becoming_leader: LogIndex::ZERO,
            cached_snapshot,
            promises: BTreeMap::new(),
            status: config.status,
            actor_client: config.actor_client,
            apply_pipeline,
            election_timer: None,
            heartbeat_timers: HashMap::new(),
            pre_vote: PreVoteRound::new(),
            election: ElectionRound::default(),
            my_priority,
            target_priority,
            priority_change_timer: Stopwatch::new(Duration::ZERO),
            vote_init_timer: Stopwatch::new(Duration::ZERO),
            vote_init_timer_term: Term::ZERO,
            leadership_transfer_timer: Stopwatch::new(Duration::ZERO),
            leader_quorum_timer: Stopwatch::new(Duration::ZERO),
            forwarding: ForwardingPool::new(),
        };
        replica.restart_election_timer();
        replica
    }

    // ------------- request router -------------

    /// Single inbound entry point. Term check first: any message from a
    /// higher term makes us a follower of that term before the per-kind
    /// handler runs. Pre-vote probes are the exception; they never move
    /// anyone's term.
    pub(crate) fn handle_incoming_request(&mut self, request: RaftRequest, callback: Callback<RaftResponse, RequestError>) {
        if self.shutting_down {
            callback.send(Err(RequestError::ShuttingDown));
            return;
        }

        let header = request.header();
        if !self
            .hooks
            .verify_request_meta(header.src, request.kind_name(), header.meta.as_deref())
        {
            slog::warn!(
                self.logger,
                "Dropping {} from peer {}: metadata rejected",
                request.kind_name(),
                header.src
            );
            callback.send(Err(RequestError::MetaRejected));
            return;
        }

        if header.term > self.state.term && !matches!(request, RaftRequest::PreVote(_)) {
            let leader_hint = match &request {
                RaftRequest::AppendEntries(_) | RaftRequest::InstallSnapshot(_) => Some(header.src),
                _ => None,
            };
            self.adopt_term(header.term, leader_hint.unwrap_or(ServerId::NONE));
        }

        match request {
            RaftRequest::PreVote(req) => {
                callback.send(Ok(RaftResponse::PreVote(self.handle_pre_vote_request(&req))));
            }
            RaftRequest::Vote(req) => {
                callback.send(Ok(RaftResponse::Vote(self.handle_vote_request(&req))));
            }
            RaftRequest::AppendEntries(req) => {
                self.handle_append_entries_request(req, callback);
            }
            RaftRequest::InstallSnapshot(req) => {
                callback.send(Ok(RaftResponse::InstallSnapshot(
                    self.handle_install_snapshot_request(&req),
                )));
            }
            RaftRequest::CustomNotification(req) => {
                callback.send(Ok(RaftResponse::CustomNotification(
                    self.handle_custom_notification_request(&req),
                )));
            }
            RaftRequest::Reconnect(req) => {
                callback.send(Ok(RaftResponse::Reconnect(self.handle_reconnect_request(&req))));
            }
            RaftRequest::PriorityChange(req) => {
                callback.send(Ok(RaftResponse::PriorityChange(
                    self.handle_priority_change_request(&req),
                )));
            }
            RaftRequest::ClientWrite(req) => {
                self.handle_client_write_request(req, callback);
            }
        }
    }

    // ------------- role and term transitions -------------

    /// Persist `(term, voted_for)`. Must complete before any message that
    /// reveals the new state leaves this server.
    pub(super) fn persist_state(&mut self) {
        if let Err(error) = self.state_manager.save_state(&self.state) {
            // A server that cannot persist its vote must not participate.
            slog::error!(self.logger, "Persisting server state failed: {}", error);
        }
        self.status.set_term(self.state.term);
    }

    /// Observed a higher term: adopt it and fall back to follower.
    pub(super) fn adopt_term(&mut self, term: Term, leader_hint: ServerId) {
        slog::info!(
            self.logger,
            "Adopting higher term {} (was {}), leader hint {}",
            term,
            self.state.term,
            leader_hint
        );
        self.state.term = term;
        self.state.voted_for = ServerId::NONE;
        self.persist_state();
        let hint = if leader_hint.is_none() { None } else { Some(leader_hint) };
        self.become_follower(hint);
    }

    pub(super) fn become_follower(&mut self, leader: Option<ServerId>) {
        let was_leader = self.role == Role::Leader;
        if was_leader {
            self.heartbeat_timers.clear();
            self.config_change = None;
            for peer_id in self.peers.ids() {
                self.close_snapshot_transfer(peer_id);
            }
            self.fail_pending_promises(|| ReplicateError::LeadershipLost);
        }

        let is_learner = self
            .config
            .get_server(self.my_id)
            .map(|s| s.is_learner)
            .unwrap_or(false);
        self.set_role(if is_learner { Role::Learner } else { Role::Follower });
        self.set_leader(leader.unwrap_or(ServerId::NONE));
        if leader.is_none() {
            self.hb_alive = false;
        }
        self.restart_election_timer();
        self.hooks.on_event(HookEvent::BecomeFollower { term: self.state.term });
    }

    /// Step down without a term change (persistence trouble, leadership
    /// yield).
    pub(super) fn step_down_same_term(&mut self) {
        if self.role == Role::Leader {
            self.become_follower(None);
        }
    }

    pub(super) fn become_leader(&mut self) {
        slog::info!(self.logger, "=== LEADER (term {}) ===", self.state.term);
        self.set_role(Role::Leader);
        self.set_leader(self.my_id);
        // A leader trivially has a live leader; this keeps us from granting
        // pre-votes to restarting peers while we are healthy.
        self.hb_alive = true;
        self.index_at_becoming_leader = self.log.next_slot();
        self.election_timer = None;
        self.forwarding.clear();
        self.update_target_priority();
        self.leadership_transfer_timer.reset();
        self.leader_quorum_timer.reset();

        let next_slot = self.log.next_slot();
        let term = self.state.term;
        let heartbeat = self.options.heartbeat_interval;
        let actor_client = self.actor_client.clone();
        self.heartbeat_timers.clear();
        for peer_id in self.peers.ids() {
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.next_index = next_slot;
                // Re-learn replication progress from scratch this term.
                peer.matched_index = LogIndex::ZERO;
                peer.needs_reconnect = false;
            }
            // The timer fires immediately, so the new leader announces
            // itself without waiting a full interval.
            self.heartbeat_timers.insert(
                peer_id,
                HeartbeatTimerHandle::spawn(heartbeat, actor_client.clone(), peer_id, term),
            );
        }

        self.hooks.on_event(HookEvent::BecomeLeader { term });
        self.try_advance_commit_index();
    }

    pub(super) fn set_role(&mut self, role: Role) {
        if self.role != role {
            slog::info!(self.logger, "Role change: {:?} -> {:?}", self.role, role);
        }
        self.role = role;
        self.status.set_role(role);
    }

    pub(super) fn set_leader(&mut self, leader: ServerId) {
        self.leader = leader;
        self.status.set_leader(leader);
    }

    /// Start a staged shutdown after learning we were removed: fire the
    /// callback now, give pending work two election timeouts to drain.
    pub(super) fn begin_removed_shutdown(&mut self) {
        if self.steps_to_down > 0 {
            return;
        }
        self.hooks.on_event(HookEvent::RemovedFromCluster);
        self.steps_to_down = 2;
        self.restart_election_timer();
    }

    // ------------- timers -------------

    pub(super) fn restart_election_timer(&mut self) {
        if self.shutting_down {
            return;
        }
        self.election_timer = Some(ElectionTimerHandle::spawn(
            self.options.election_timeout_lower,
            self.options.election_timeout_upper,
            self.actor_client.clone(),
        ));
    }

    /// Cheap reset on valid leader contact.
    pub(super) fn reset_election_timer(&mut self) {
        match &self.election_timer {
            Some(timer) => timer.reset(),
            None => self.restart_election_timer(),
        }
    }

    // ------------- configuration -------------

    /// Make `config` the authoritative in-memory configuration, effective
    /// immediately (not on commit). On the leader, removals wait for the
    /// entry to commit so the departing server keeps receiving appends.
    pub(super) fn apply_config(&mut self, config: ClusterConfig) {
        slog::info!(
            self.logger,
            "Applying configuration at log index {} with {} servers",
            config.log_index,
            config.servers.len()
        );

        let next_slot = self.log.next_slot();
        if self.role == Role::Leader {
            let known_before: Vec<ServerId> = self.peers.ids();
            for server in &config.servers {
                if server.id == self.my_id {
                    continue;
                }
                self.peers.insert_or_update(server.clone(), next_slot);
                if !known_before.contains(&server.id) {
                    self.heartbeat_timers.insert(
                        server.id,
                        HeartbeatTimerHandle::spawn(
                            self.options.heartbeat_interval,
                            self.actor_client.clone(),
                            server.id,
                            self.state.term,
                        ),
                    );
                }
            }
        } else {
            let departed = self.peers.sync_with_config(&config, next_slot);
            for peer in departed {
                if let Some(transfer) = peer.snapshot_transfer {
                    Self::free_transfer_ctx(&self.state_machine, transfer);
                }
            }
            self.refresh_open_ctx_count();
        }

        self.config = config;
        if let Err(error) = self.state_manager.save_config(&self.config) {
            slog::warn!(self.logger, "Persisting configuration failed: {}", error);
        }

        // Our own standing may have changed.
        if let Some(me) = self.config.get_server(self.my_id) {
            if self.catching_up && me.is_regular_member() {
                slog::info!(self.logger, "Catch-up complete; now a regular member");
                self.catching_up = false;
            }
            if self.role != Role::Leader && self.role != Role::Candidate {
                self.set_role(if me.is_learner { Role::Learner } else { Role::Follower });
            }
        }

        self.update_target_priority();
        let log_index = self.config.log_index;
        self.hooks.on_event(HookEvent::NewConfig { log_index });
    }

    /// Re-derive `my_priority` and the cluster-wide target priority from
    /// the configuration.
    pub(super) fn update_target_priority(&mut self) {
        if let Some(me) = self.config.get_server(self.my_id) {
            self.my_priority = me.priority;
        }
        let new_target = std::cmp::max(1, self.config.max_priority());
        if new_target != self.target_priority {
            self.target_priority = new_target;
            self.priority_change_timer.reset();
        }
        self.status.set_priorities(self.my_priority, self.target_priority);
    }

    // ------------- quorums and log helpers -------------

    pub(super) fn num_voting_members(&self) -> usize {
        self.config.num_voting_members()
    }

    /// `⌊voting/2⌋`; winning needs quorum + 1 (self included).
    pub(super) fn election_quorum(&self) -> usize {
        if self.options.custom_election_quorum_size > 0 {
            return self.options.custom_election_quorum_size - 1;
        }
        self.num_voting_members() / 2
    }

    pub(super) fn commit_quorum(&self) -> usize {
        if self.options.custom_commit_quorum_size > 0 {
            return self.options.custom_commit_quorum_size - 1;
        }
        self.num_voting_members() / 2
    }

    pub(super) fn last_log_index(&self) -> LogIndex {
        self.log.next_slot().prev()
    }

    pub(super) fn last_log_term(&self) -> Term {
        self.term_for_log(self.last_log_index())
    }

    pub(super) fn term_for_log(&self, index: LogIndex) -> Term {
        if index.is_zero() {
            return Term::ZERO;
        }
        if let Ok(Some(term)) = self.log.term_at(index) {
            return term;
        }
        if let Some(snapshot) = &self.cached_snapshot {
            if snapshot.last_index == index {
                return snapshot.last_term;
            }
        }
        Term::ZERO
    }

    pub(super) fn request_header(&self, dst: ServerId, kind: &'static str) -> MessageHeader {
        MessageHeader {
            term: self.state.term,
            src: self.my_id,
            dst,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
            commit_index: self.commit_index,
            meta: self.hooks.write_request_meta(dst, kind),
        }
    }

    pub(super) fn fail_pending_promises<F>(&mut self, error: F)
    where
        F: Fn() -> ReplicateError,
    {
        if self.promises.is_empty() {
            return;
        }
        slog::info!(self.logger, "Failing {} pending client promises", self.promises.len());
        let promises = std::mem::take(&mut self.promises);
        for (_, promise) in promises {
            let _ = promise.send(Err(error()));
        }
    }

    // ------------- control plane -------------

    fn handle_custom_notification_request(&mut self, request: &CustomNotificationRequest) -> CustomNotificationResponse {
        match &request.kind {
            CustomNotificationKind::LeadershipTakeover => {
                slog::info!(
                    self.logger,
                    "Leadership takeover requested by peer {}",
                    request.header.src
                );
                if self.role != Role::Leader {
                    // Force vote: skip pre-vote, ignore priority gating.
                    self.initiate_vote(true);
                    if self.role != Role::Leader {
                        self.restart_election_timer();
                    }
                }
            }
            CustomNotificationKind::LeaveGroup => {
                slog::info!(self.logger, "Leave-group notification from peer {}", request.header.src);
                self.begin_removed_shutdown();
            }
            CustomNotificationKind::OutOfLogRange(start_index) => {
                slog::warn!(
                    self.logger,
                    "Leader {} no longer holds our next entries (its log starts at {}); expecting snapshot",
                    request.header.src,
                    start_index
                );
            }
        }
        CustomNotificationResponse {
            term: self.state.term,
            src: self.my_id,
            dst: request.header.src,
            accepted: true,
        }
    }

    /// A follower we can't reach claims it can't hear us either; rebuild
    /// our client connection to it.
    fn handle_reconnect_request(&mut self, request: &ReconnectRequest) -> ReconnectResponse {
        let src = request.header.src;
        let transport = Arc::clone(self.peers.transport_arc());
        if let Some(peer) = self.peers.get_mut(src) {
            slog::info!(self.logger, "Rebuilding connection to peer {} on its request", src);
            peer.recreate_client(transport.as_ref());
        }
        ReconnectResponse {
            term: self.state.term,
            src: self.my_id,
            dst: src,
            accepted: true,
        }
    }

    fn handle_priority_change_request(&mut self, request: &PriorityChangeRequest) -> PriorityChangeResponse {
        self.apply_priority_change(request.server_id, request.new_priority);
        PriorityChangeResponse {
            term: self.state.term,
            src: self.my_id,
            dst: request.header.src,
            accepted: true,
        }
    }

    /// Idempotent local application of a priority change.
    fn apply_priority_change(&mut self, server_id: ServerId, new_priority: i32) {
        let mut changed = false;
        for server in &mut self.config.servers {
            if server.id == server_id && server.priority != new_priority {
                slog::info!(
                    self.logger,
                    "Priority of server {} changes {} -> {}",
                    server_id,
                    server.priority,
                    new_priority
                );
                server.priority = new_priority;
                changed = true;
            }
        }
        if changed {
            if let Some(peer) = self.peers.get_mut(server_id) {
                let mut descriptor = peer.descriptor().clone();
                descriptor.priority = new_priority;
                peer.update_descriptor(descriptor);
            }
            self.priority_change_timer.reset();
            self.update_target_priority();
        }
    }

    pub(crate) fn handle_set_priority(
        &mut self,
        server_id: ServerId,
        new_priority: i32,
    ) -> Result<PriorityChangeResult, PriorityChangeError> {
        if self.shutting_down {
            return Err(PriorityChangeError::ShuttingDown);
        }
        if !self.config.contains(server_id) {
            return Ok(PriorityChangeResult::Ignored);
        }

        self.apply_priority_change(server_id, new_priority);

        // Propagate to everyone we can reach; receivers re-apply
        // idempotently, so double delivery is harmless.
        for peer_id in self.peers.ids() {
            let request = RaftRequest::PriorityChange(PriorityChangeRequest {
                header: self.request_header(peer_id, "priority_change"),
                server_id,
                new_priority,
            });
            if let Some(peer) = self.peers.get(peer_id) {
                let client = Arc::clone(&peer.client);
                let logger = self.logger.clone();
                tokio::task::spawn(async move {
                    if let Err(error) = client.send(request).await {
                        slog::info!(logger, "Priority change undeliverable to peer {}: {}", peer_id, error);
                    }
                });
            }
        }

        if self.role == Role::Leader {
            Ok(PriorityChangeResult::Set)
        } else {
            Ok(PriorityChangeResult::Broadcast)
        }
    }

    pub(crate) fn handle_yield_leadership(
        &mut self,
        immediate: bool,
        successor: Option<ServerId>,
    ) -> Result<(), LeadershipTransferError> {
        if self.shutting_down {
            return Err(LeadershipTransferError::ShuttingDown);
        }
        if self.role != Role::Leader {
            return Err(LeadershipTransferError::NotLeader);
        }
        if !immediate {
            if self.leadership_transfer_timer.elapsed() < self.options.leadership_transfer_min_wait_time {
                return Err(LeadershipTransferError::TooSoon);
            }
            // Transfer only when every voter is responsive; handing off
            // into a half-dead cluster helps nobody.
            let alive_threshold = self.options.heartbeat_interval * self.options.limits.response_limit as u32;
            let now = Instant::now();
            for server in self.config.voting_members() {
                if server.id == self.my_id {
                    continue;
                }
                let alive = self
                    .peers
                    .get(server.id)
                    .map(|p| p.inactive_for(now) <= alive_threshold)
                    .unwrap_or(false);
                if !alive {
                    return Err(LeadershipTransferError::PeersNotReady);
                }
            }
        }

        let last = self.last_log_index();
        let chosen = self.pick_successor(successor, last);
        let Some(chosen) = chosen else {
            return Err(LeadershipTransferError::NoEligibleSuccessor);
        };

        slog::info!(self.logger, "Yielding leadership to server {}", chosen);
        if let Some(peer) = self.peers.get(chosen) {
            let request = RaftRequest::CustomNotification(CustomNotificationRequest {
                header: self.request_header(chosen, "custom_notification_request"),
                kind: CustomNotificationKind::LeadershipTakeover,
            });
            let client = Arc::clone(&peer.client);
            let actor_client = self.actor_client.clone();
            let logger = self.logger.clone();
            tokio::task::spawn(async move {
                if let Err(error) = client.send(request).await {
                    slog::warn!(logger, "Leadership takeover notification failed: {}", error);
                }
                actor_client.notification_reply_from_peer(chosen).await;
            });
        }

        self.leadership_transfer_timer.reset();
        self.step_down_same_term();
        Ok(())
    }

    /// Explicit target if it is fresh enough, else the most up-to-date
    /// voting peer, highest priority breaking ties.
    fn pick_successor(&self, explicit: Option<ServerId>, last_log_index: LogIndex) -> Option<ServerId> {
        if let Some(target) = explicit {
            if target != self.my_id {
                if let Some(peer) = self.peers.get(target) {
                    if peer.is_regular_member() && peer.matched_index >= last_log_index {
                        return Some(target);
                    }
                }
            }
        }

        self.peers
            .iter()
            .filter(|p| p.is_regular_member())
            .max_by_key(|p| (p.matched_index, p.priority()))
            .map(|p| p.id())
    }

    pub(crate) fn handle_notification_reply(&mut self, peer_id: ServerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_response_at = Some(Instant::now());
        }
    }

    pub(crate) fn handle_pause_apply(&mut self, auto_resume: Option<Duration>) {
        slog::info!(self.logger, "Pausing state machine apply");
        self.apply_pipeline.pause(auto_resume);
    }

    pub(crate) fn handle_resume_apply(&mut self) {
        slog::info!(self.logger, "Resuming state machine apply");
        self.apply_pipeline.resume();
    }

    pub(crate) fn peer_info(&self) -> Vec<PeerInfo> {
        if self.role != Role::Leader {
            return Vec::new();
        }
        let now = Instant::now();
        self.peers
            .iter()
            .map(|peer| PeerInfo {
                id: peer.id(),
                endpoint: peer.endpoint().to_string(),
                next_index: peer.next_index,
                matched_index: peer.matched_index,
                last_sent_age: peer.last_sent_at.map(|at| now.saturating_duration_since(at)),
                last_response_age: peer.last_response_at.map(|at| now.saturating_duration_since(at)),
                in_flight: peer.is_busy(),
                is_learner: peer.descriptor().is_learner,
                is_new_joiner: peer.descriptor().is_new_joiner,
                priority: peer.priority(),
            })
            .collect()
    }

    // ------------- shutdown -------------

    pub(crate) fn handle_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        slog::info!(self.logger, "Replica shutting down");
        self.shutting_down = true;
        // Stop advertising any role; reporting APIs outlive the replica.
        self.set_role(Role::Follower);
        self.set_leader(ServerId::NONE);
        self.apply_pipeline.shutdown();
        self.election_timer = None;
        self.heartbeat_timers.clear();
        for peer_id in self.peers.ids() {
            self.close_snapshot_transfer(peer_id);
        }
        self.fail_pending_promises(|| ReplicateError::ShuttingDown);
    }

    pub(crate) fn on_actor_exit(&mut self) {
        self.handle_shutdown();
    }
}
