//! Pre-vote and vote coordination. Pre-vote probes election viability
//! without touching the term; only a successful probe escalates to a real
//! vote. Priority gating keeps low-priority members from campaigning until
//! the cluster-wide target priority has decayed down to them.

use crate::actor::ActorClient;
use crate::api::{HookDecision, HookEvent};
use crate::commitlog::{LogIndex, LogStore, Term};
use crate::replica::cluster_config::ServerId;
use crate::replica::local_state::{ExitCode, StateManager};
use crate::replica::messages::{
    force_vote_marker_entry, PreVoteRequest, PreVoteResponse, RaftRequest, RaftResponse, VoteRequest, VoteResponse,
};
use crate::replica::replica::Replica;
use crate::replica::replica_api::Role;
use crate::transport::{PeerRpc, RpcError};
use std::sync::Arc;
use tokio::time::Instant;

/// Tally of one pre-vote round, plus failure counters that survive across
/// rounds and drive the escalation paths.
#[derive(Debug)]
pub(super) struct PreVoteRound {
    pub term: Term,
    /// Grants: peers that see no live leader.
    pub dead: u32,
    /// Denials from peers that still hear a leader.
    pub live: u32,
    /// Strong denials: "you were removed from the cluster".
    pub abandoned: u32,
    /// Peers whose in-flight slot was taken this round.
    pub connection_busy: u32,
    pub done: bool,

    // Cross-round counters.
    pub no_response_failure_count: u32,
    pub quorum_reject_count: u32,
    pub busy_connection_failure_count: u32,
}

impl PreVoteRound {
    pub fn new() -> Self {
        PreVoteRound {
            term: Term::ZERO,
            dead: 0,
            live: 0,
            abandoned: 0,
            connection_busy: 0,
            done: false,
            no_response_failure_count: 0,
            quorum_reject_count: 0,
            busy_connection_failure_count: 0,
        }
    }

    pub fn reset(&mut self, term: Term) {
        self.term = term;
        self.dead = 0;
        self.live = 0;
        self.abandoned = 0;
        self.connection_busy = 0;
        self.done = false;
    }
}

/// Tally of one real vote round.
#[derive(Debug, Default)]
pub(super) struct ElectionRound {
    pub votes_granted: u32,
    pub votes_responded: u32,
    pub election_completed: bool,
}

impl<L, S> Replica<L, S>
where
    L: LogStore,
    S: StateManager,
{
    /// Election timer fired without leader contact. Returns true when the
    /// replica must exit (finished two-step shutdown, or fatal isolation).
    pub(crate) fn handle_election_timeout(&mut self) -> bool {
        if self.shutting_down {
            return false;
        }

        if self.steps_to_down > 0 {
            self.steps_to_down -= 1;
            if self.steps_to_down == 0 {
                slog::warn!(self.logger, "Removed from cluster; shutting down now");
                self.handle_shutdown();
                return true;
            }
            // Still draining callbacks; keep the timer alive.
            self.restart_election_timer();
            return false;
        }

        if self.role == Role::Leader {
            return false;
        }
        let is_voting_member = self
            .config
            .get_server(self.my_id)
            .map(|s| s.is_regular_member())
            .unwrap_or(false);
        if self.role == Role::Learner || self.catching_up || !is_voting_member {
            // Learners and servers still being caught up never campaign.
            self.restart_election_timer();
            return false;
        }

        // A timeout event that raced with fresh leader contact is stale.
        if let Some(contact) = self.last_leader_contact {
            if contact.elapsed() < self.options.election_timeout_lower {
                self.restart_election_timer();
                return false;
            }
        }

        self.decay_target_priority();
        let exit = self.request_prevote();
        if !exit && self.role != Role::Leader {
            self.restart_election_timer();
        }
        exit
    }

    /// Shrink the cluster-wide priority target so lower-priority members
    /// eventually qualify to campaign when nobody better steps up.
    fn decay_target_priority(&mut self) {
        let gap = std::cmp::max(10, self.target_priority / 5);
        let decayed = std::cmp::max(1, self.target_priority - gap);
        if decayed != self.target_priority {
            slog::info!(
                self.logger,
                "Decaying target priority {} -> {}",
                self.target_priority,
                decayed
            );
            self.target_priority = decayed;
            self.priority_change_timer.reset();
            self.status.set_priorities(self.my_priority, self.target_priority);
        }
    }

    /// The temporary zero-priority escape: a zero-priority member may
    /// campaign once the target has fully decayed and nothing changed for
    /// 20 heartbeat intervals.
    pub(super) fn zero_priority_election_allowed(&self) -> bool {
        self.options.allow_temporary_zero_priority_leader
            && self.target_priority == 1
            && self.my_priority == 0
            && self.priority_change_timer.elapsed() > self.options.heartbeat_interval * 20
    }

    /// Start a pre-vote round. Returns true when the replica must exit
    /// (unrecoverable isolation).
    fn request_prevote(&mut self) -> bool {
        // Refresh peer connections first. On the first round after leader
        // loss every client is rebuilt; later rounds rebuild only clients
        // that flagged themselves or have been inactive too long.
        let reconnect_threshold = self.options.heartbeat_interval * self.options.limits.reconnect_limit as u32;
        let first_round_after_leader = self.hb_alive;
        let now = Instant::now();
        let transport = Arc::clone(self.peers.transport_arc());
        for peer in self.peers.iter_mut() {
            if !peer.is_regular_member() {
                continue;
            }
            let recreate = if first_round_after_leader {
                true
            } else if peer.needs_reconnect {
                true
            } else if peer.inactive_for(now) > reconnect_threshold {
                slog::warn!(
                    self.logger,
                    "Connection to peer {} inactive too long; reconnecting for pre-vote",
                    peer.id()
                );
                true
            } else {
                false
            };
            if recreate {
                peer.recreate_client(transport.as_ref());
            }
        }

        // Evaluate the previous round before starting a new one.
        let election_quorum = self.election_quorum() as u32;
        if self.pre_vote.live + self.pre_vote.dead > 0 {
            if self.pre_vote.live + self.pre_vote.dead < election_quorum + 1 {
                self.pre_vote.no_response_failure_count += 1;
                slog::warn!(
                    self.logger,
                    "Pre-vote round got {} responses (live {}, dead {}), needed {}; failure count {}",
                    self.pre_vote.live + self.pre_vote.dead,
                    self.pre_vote.live,
                    self.pre_vote.dead,
                    election_quorum + 1,
                    self.pre_vote.no_response_failure_count
                );
            } else {
                self.pre_vote.no_response_failure_count = 0;
            }
        }

        let num_voting = self.num_voting_members() as u32;
        if self.options.auto_adjust_quorum_for_small_cluster
            && num_voting == 2
            && self.pre_vote.no_response_failure_count > self.options.limits.vote_limit as u32
        {
            slog::warn!(
                self.logger,
                "2-node cluster pre-vote failing persistently; adjusting quorum to 1"
            );
            match self.hooks.on_event(HookEvent::AutoAdjustQuorum) {
                HookDecision::ReturnNull => {
                    slog::warn!(self.logger, "Quorum size adjustment declined by callback");
                }
                HookDecision::Ok => {
                    self.options.custom_commit_quorum_size = 1;
                    self.options.custom_election_quorum_size = 1;
                }
            }
        }

        self.hb_alive = false;
        self.set_leader(ServerId::NONE);
        self.set_role(Role::Candidate);
        self.index_at_becoming_leader = LogIndex::ZERO;
        self.pre_vote.reset(self.state.term);
        // Count ourselves.
        self.pre_vote.dead += 1;

        if self.my_priority < self.target_priority {
            if self.zero_priority_election_allowed() {
                slog::info!(self.logger, "Temporarily allowing election for zero-priority member");
            } else {
                slog::info!(
                    self.logger,
                    "Not initiating pre-vote due to priority: target {}, mine {}",
                    self.target_priority,
                    self.my_priority
                );
                return false;
            }
        }

        slog::info!(
            self.logger,
            "Pre-vote init: term {}, log index {}, log term {}, priority target {} / mine {}",
            self.state.term,
            self.last_log_index(),
            self.last_log_term(),
            self.target_priority,
            self.my_priority
        );

        let peer_ids = self.peers.ids();
        for peer_id in peer_ids {
            let request = RaftRequest::PreVote(PreVoteRequest {
                header: self.request_header(peer_id, "pre_vote_request"),
            });
            let Some(peer) = self.peers.get_mut(peer_id) else {
                continue;
            };
            if !peer.is_regular_member() {
                // Learners and joiners get no voting requests.
                continue;
            }
            if peer.make_busy() {
                peer.last_sent_at = Some(Instant::now());
                tokio::task::spawn(Self::call_peer_pre_vote(
                    Arc::clone(&peer.client),
                    peer_id,
                    self.pre_vote.term,
                    request,
                    self.actor_client.clone(),
                ));
            } else {
                self.pre_vote.connection_busy += 1;
                slog::warn!(
                    self.logger,
                    "Peer {} is busy, cannot send pre-vote; busy count {}",
                    peer_id,
                    self.pre_vote.connection_busy
                );
            }
        }

        // Sole voter: nothing to wait for.
        if self.pre_vote.dead >= election_quorum + 1 {
            self.pre_vote.done = true;
            self.initiate_vote(false);
            return false;
        }

        if self.pre_vote.connection_busy + election_quorum + 1 > num_voting {
            // Couldn't even reach a quorum's worth of peers this round.
            self.pre_vote.busy_connection_failure_count += 1;
            slog::warn!(
                self.logger,
                "Too many busy connections ({} of {} voting members); no hope for quorum, count {}",
                self.pre_vote.connection_busy,
                num_voting,
                self.pre_vote.busy_connection_failure_count
            );
            let limit = self.options.limits.busy_connection_limit as u32;
            if limit > 0 && self.pre_vote.busy_connection_failure_count > limit {
                slog::error!(self.logger, "Too many pre-vote failures due to busy connections");
                self.state_manager.system_exit(ExitCode::UnrecoverableIsolation);
                self.handle_shutdown();
                return true;
            }
        }

        false
    }

    async fn call_peer_pre_vote(
        client: Arc<dyn PeerRpc>,
        peer_id: ServerId,
        round_term: Term,
        request: RaftRequest,
        actor_client: ActorClient,
    ) {
        let reply = client.send(request).await.and_then(|resp| match resp {
            RaftResponse::PreVote(r) => Ok(r),
            other => Err(RpcError::Dropped(format!("unexpected response: {:?}", other))),
        });
        actor_client.pre_vote_reply_from_peer(peer_id, round_term, reply).await;
    }

    pub(super) fn handle_pre_vote_request(&mut self, request: &PreVoteRequest) -> PreVoteResponse {
        // Unknown requester: it has been removed from our configuration.
        // Answer with the abandoned marker. A catching-up server does not
        // know the membership yet, so it never issues strong denials.
        let known = self.catching_up
            || (self.config.contains(request.header.src) && self.peers.contains(request.header.src));
        let next_index_for_resp = if known { self.log.next_slot() } else { LogIndex::MAX };

        // A catching-up server cannot track heartbeat liveness (it gets no
        // regular appends), so it accepts any pre-vote.
        let grant = !self.hb_alive || self.catching_up;
        slog::info!(
            self.logger,
            "Pre-vote request from peer {}: term {} (mine {}), hb {}, decision {}",
            request.header.src,
            request.header.term,
            self.state.term,
            if self.hb_alive { "alive" } else { "dead" },
            if grant && known {
                "grant"
            } else if known {
                "deny"
            } else {
                "strong-deny"
            }
        );

        PreVoteResponse {
            term: request.header.term,
            src: self.my_id,
            dst: request.header.src,
            accepted: grant && known,
            next_index: next_index_for_resp,
        }
    }

    pub(crate) fn handle_pre_vote_reply(
        &mut self,
        peer_id: ServerId,
        round_term: Term,
        reply: Result<PreVoteResponse, RpcError>,
    ) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.set_free();
        }

        let response = match reply {
            Ok(response) => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.last_response_at = Some(Instant::now());
                }
                response
            }
            Err(error) => {
                slog::warn!(self.logger, "Pre-vote to peer {} failed: {}", peer_id, error);
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.needs_reconnect = true;
                }
                return;
            }
        };

        if response.term != self.pre_vote.term || round_term != self.pre_vote.term {
            slog::info!(
                self.logger,
                "Pre-vote response from peer {} for term {} (round is {}); ignoring",
                peer_id,
                response.term,
                self.pre_vote.term
            );
            return;
        }

        if response.accepted {
            self.pre_vote.dead += 1;
        } else if response.is_abandoned_marker() {
            self.pre_vote.abandoned += 1;
        } else {
            self.pre_vote.live += 1;
        }

        let election_quorum_size = self.election_quorum() as u32 + 1;
        slog::info!(
            self.logger,
            "Pre-vote response from peer {} ({}): dead {}, live {}, abandoned {}, quorum {}",
            peer_id,
            if response.accepted { "O" } else { "X" },
            self.pre_vote.dead,
            self.pre_vote.live,
            self.pre_vote.abandoned,
            election_quorum_size
        );

        if self.pre_vote.dead >= election_quorum_size && !self.pre_vote.done {
            slog::info!(self.logger, "Pre-vote succeeded for term {}", self.pre_vote.term);
            self.pre_vote.done = true;
            self.initiate_vote(false);
            if self.role != Role::Leader {
                self.restart_election_timer();
            }
        }

        if self.pre_vote.live >= election_quorum_size {
            self.pre_vote.quorum_reject_count += 1;
            slog::warn!(
                self.logger,
                "Pre-vote rejected by quorum, count {}",
                self.pre_vote.quorum_reject_count
            );
            if self.pre_vote.quorum_reject_count >= self.options.limits.pre_vote_rejection_limit as u32 {
                // A quorum still hears a leader we can't. The network path
                // from the leader to us is probably wedged.
                self.send_reconnect_request();
                self.pre_vote.quorum_reject_count = 0;
            }
        }

        if self.pre_vote.abandoned >= election_quorum_size {
            slog::error!(self.logger, "A quorum says this server was removed; stepping down");
            self.begin_removed_shutdown();
        }
    }

    /// Pre-vote passed (or a leadership-takeover notification arrived):
    /// bump the term and ask for real votes.
    pub(super) fn initiate_vote(&mut self, force_vote: bool) {
        let grace_period = self.options.grace_period_of_lagging_state_machine;
        let current_term = self.state.term;
        if !force_vote && !grace_period.is_zero() && self.status.last_applied_index() < self.lagging_sm_target_index {
            // The local state machine is behind what the cluster has
            // committed. Give it one grace period per term before we go
            // disturb everyone with an election.
            if self.vote_init_timer_term != current_term {
                self.vote_init_timer.set_duration(grace_period);
                self.vote_init_timer.reset();
                self.vote_init_timer_term = current_term;
            }
            if !self.vote_init_timer.timed_out() {
                slog::info!(
                    self.logger,
                    "Lagging state machine ({} < {}); deferring vote for term {}",
                    self.status.last_applied_index(),
                    self.lagging_sm_target_index,
                    current_term
                );
                return;
            }
            slog::info!(
                self.logger,
                "Grace period expired with no new leader for term {}; proceeding",
                current_term
            );
        }

        if self.my_priority >= self.target_priority
            || force_vote
            || self.zero_priority_election_allowed()
            || (self.election_quorum() == 0 && self.my_priority > 0)
        {
            self.state.term = self.state.term.next();
            self.state.voted_for = ServerId::NONE;
            self.set_role(Role::Candidate);
            self.index_at_becoming_leader = LogIndex::ZERO;
            self.election = ElectionRound::default();
            self.status.set_term(self.state.term);
            // request_vote persists the state below.
            self.request_vote(force_vote);
        }

        if self.role != Role::Leader {
            self.hb_alive = false;
            self.set_leader(ServerId::NONE);
        }
    }

    fn request_vote(&mut self, force_vote: bool) {
        self.state.voted_for = self.my_id;
        self.persist_state();
        self.election.votes_granted += 1;
        self.election.votes_responded += 1;
        slog::info!(
            self.logger,
            "Vote init: term {}, log index {}, log term {}, priority target {} / mine {}{}",
            self.state.term,
            self.last_log_index(),
            self.last_log_term(),
            self.target_priority,
            self.my_priority,
            if force_vote { " (forced)" } else { "" }
        );

        // Sole voter?
        if self.election.votes_granted > self.election_quorum() as u32 {
            self.election.election_completed = true;
            self.become_leader();
            return;
        }

        let peer_ids = self.peers.ids();
        for peer_id in peer_ids {
            let mut entries = Vec::new();
            if force_vote {
                // Tell receivers to skip priority gating.
                entries.push(force_vote_marker_entry());
            }
            let request = RaftRequest::Vote(VoteRequest {
                header: self.request_header(peer_id, "request_vote_request"),
                entries,
            });
            let term = self.state.term;
            let Some(peer) = self.peers.get_mut(peer_id) else {
                continue;
            };
            if !peer.is_regular_member() {
                continue;
            }
            if peer.make_busy() {
                peer.last_sent_at = Some(Instant::now());
                tokio::task::spawn(Self::call_peer_request_vote(
                    Arc::clone(&peer.client),
                    peer_id,
                    term,
                    request,
                    self.actor_client.clone(),
                ));
            } else {
                slog::warn!(self.logger, "Peer {} is busy, cannot send vote request", peer_id);
            }
        }
    }

    async fn call_peer_request_vote(
        client: Arc<dyn PeerRpc>,
        peer_id: ServerId,
        term: Term,
        request: RaftRequest,
        actor_client: ActorClient,
    ) {
        let reply = client.send(request).await.and_then(|resp| match resp {
            RaftResponse::Vote(r) => Ok(r),
            other => Err(RpcError::Dropped(format!("unexpected response: {:?}", other))),
        });
        actor_client.vote_reply_from_peer(peer_id, term, reply).await;
    }

    pub(super) fn handle_vote_request(&mut self, request: &VoteRequest) -> VoteResponse {
        let log_okay = request.header.last_log_term > self.last_log_term()
            || (request.header.last_log_term == self.last_log_term()
                && self.last_log_index() <= request.header.last_log_index);

        let mut grant = request.header.term == self.state.term
            && log_okay
            && (self.state.voted_for == request.header.src || self.state.voted_for == ServerId::NONE);

        let ignore_priority = request.is_force_vote() || self.catching_up;

        if grant && !ignore_priority {
            if let Some(candidate) = self.config.get_server(request.header.src) {
                // Zero-priority candidates only campaign via the explicit
                // escape flag; that path skips this gate by design of the
                // non-zero check.
                if candidate.priority != 0 && candidate.priority < self.target_priority {
                    slog::info!(
                        self.logger,
                        "Could vote for peer {} but priority {} is below target {}",
                        request.header.src,
                        candidate.priority,
                        self.target_priority
                    );
                    grant = false;
                }
            }
        }

        if grant {
            self.state.voted_for = request.header.src;
            self.persist_state();
            slog::info!(
                self.logger,
                "Vote granted to peer {} for term {}",
                request.header.src,
                request.header.term
            );
        } else {
            slog::info!(
                self.logger,
                "Vote denied to peer {} (term {} / mine {}, log_okay {}, voted_for {})",
                request.header.src,
                request.header.term,
                self.state.term,
                log_okay,
                self.state.voted_for
            );
        }

        VoteResponse {
            term: self.state.term,
            src: self.my_id,
            dst: request.header.src,
            accepted: grant,
            next_index: self.log.next_slot(),
        }
    }

    pub(crate) fn handle_vote_reply(&mut self, peer_id: ServerId, term: Term, reply: Result<VoteResponse, RpcError>) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.set_free();
        }

        let response = match reply {
            Ok(response) => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.last_response_at = Some(Instant::now());
                }
                response
            }
            Err(error) => {
                slog::warn!(self.logger, "Vote request to peer {} failed: {}", peer_id, error);
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.needs_reconnect = true;
                }
                return;
            }
        };

        if response.term > self.state.term {
            // Responses run the term check too: a denial from a fresher
            // term ends this candidacy on the spot.
            self.adopt_term(response.term, ServerId::NONE);
            return;
        }
        if self.election.election_completed {
            slog::info!(self.logger, "Election completed; ignoring vote from peer {}", peer_id);
            return;
        }
        if response.term != self.state.term || term != self.state.term {
            slog::info!(
                self.logger,
                "Vote response from peer {} for term {} (mine {}); ignoring",
                peer_id,
                response.term,
                self.state.term
            );
            return;
        }

        self.election.votes_responded += 1;
        if response.accepted {
            self.election.votes_granted += 1;
        }

        if self.election.votes_responded >= self.num_voting_members() as u32 {
            // Everyone answered; whatever we have is final.
            self.election.election_completed = true;
        }

        let election_quorum_size = self.election_quorum() as u32 + 1;
        slog::info!(
            self.logger,
            "Vote response from peer {} ({}): granted {}, responded {}, voting members {}, quorum {}",
            peer_id,
            if response.accepted { "O" } else { "X" },
            self.election.votes_granted,
            self.election.votes_responded,
            self.num_voting_members(),
            election_quorum_size
        );

        if self.election.votes_granted >= election_quorum_size {
            slog::info!(self.logger, "Elected leader for term {}", self.state.term);
            self.election.election_completed = true;
            self.become_leader();
        }
    }

    /// Ask the current leader (if any) to rebuild its connection to us.
    fn send_reconnect_request(&mut self) {
        if self.leader.is_none() || self.leader == self.my_id {
            return;
        }
        let Some(peer) = self.peers.get(self.leader) else {
            return;
        };
        let request = RaftRequest::Reconnect(crate::replica::messages::ReconnectRequest {
            header: self.request_header(self.leader, "reconnect_request"),
        });
        let client = Arc::clone(&peer.client);
        let logger = self.logger.clone();
        slog::warn!(self.logger, "Requesting leader {} to reconnect to us", self.leader);
        tokio::task::spawn(async move {
            if let Err(error) = client.send(request).await {
                slog::warn!(logger, "Reconnect request failed: {}", error);
            }
        });
    }
}
