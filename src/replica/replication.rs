//! Leader-side replication pipeline and follower-side append handling.
//! One outstanding request per peer; acks move `matched_index`/`next_index`
//! forward, rejections rewind `next_index` (with the follower's hint when it
//! offers one), and every ack re-evaluates the commit index.

use crate::actor::{ActorClient, Callback};
use crate::api::HookEvent;
use crate::commitlog::{EntryKind, LogEntry, LogIndex, LogStore, LogStoreError, Term};
use crate::replica::cluster_config::{ClusterConfig, ServerId};
use crate::replica::local_state::StateManager;
use crate::replica::messages::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteRequest, ClientWriteResponse, RaftRequest, RaftResponse,
};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    CommitListener, ReplicateError, ReplicateInput, ReplicateOutput, RequestError, Role,
};
use crate::transport::{PeerRpc, RpcError};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

impl<L, S> Replica<L, S>
where
    L: LogStore,
    S: StateManager,
{
    pub(crate) fn handle_replicate(&mut self, input: ReplicateInput, callback: Callback<ReplicateOutput, ReplicateError>) {
        if self.shutting_down {
            callback.send(Err(ReplicateError::ShuttingDown));
            return;
        }

        match self.role {
            Role::Leader => {
                callback.send(self.append_application_entry(input.data));
            }
            _ => {
                if self.leader.is_none() {
                    callback.send(Err(ReplicateError::NoLeader));
                } else if self.options.auto_forwarding {
                    self.forward_to_leader(input, callback);
                } else {
                    let leader_endpoint = self
                        .config
                        .get_server(self.leader)
                        .map(|s| s.endpoint.clone());
                    callback.send(Err(ReplicateError::NotLeader {
                        leader_hint: self.leader,
                        leader_endpoint,
                    }));
                }
            }
        }
    }

    /// Leader: append locally, register the completion promise, kick off
    /// durability and peer dispatch.
    pub(super) fn append_application_entry(&mut self, data: Bytes) -> Result<ReplicateOutput, ReplicateError> {
        let term = self.state.term;
        let entry = LogEntry::new(term, EntryKind::Application, data.clone());
        let index = self
            .log
            .append(entry)
            .map_err(|e| ReplicateError::LocalIo(e.to_string()))?;
        self.status.set_last_log_index(index);
        self.hooks.on_event(HookEvent::AppendLogs {
            first_index: index,
            count: 1,
        });
        {
            let mut sm = self.state_machine.lock().expect("state machine lock");
            sm.pre_commit(index, &data);
        }

        let (tx, rx) = oneshot::channel();
        self.promises.insert(index, tx);
        self.after_local_append(index);

        Ok(ReplicateOutput {
            term,
            index,
            commit: CommitListener::new(rx),
        })
    }

    /// Durability policy after a local append. With parallel appending the
    /// peers see the entries before our own disk confirms them; commit
    /// accounting still counts only durable copies (ours included).
    pub(super) fn after_local_append(&mut self, up_to: LogIndex) {
        if self.options.parallel_log_appending {
            let actor_client = self.actor_client.clone();
            self.log.request_flush(
                up_to,
                Box::new(move |result| {
                    // May run on any worker thread.
                    tokio::task::spawn(async move {
                        actor_client.log_durable(result).await;
                    });
                }),
            );
            self.dispatch_append_to_peers();
        } else {
            match self.log.flush() {
                Ok(durable) => {
                    self.status.set_last_durable_index(durable);
                    self.dispatch_append_to_peers();
                    self.try_advance_commit_index();
                }
                Err(error) => {
                    slog::error!(self.logger, "Local log flush failed: {}", error);
                    self.fail_pending_promises(|| ReplicateError::LocalIo("log flush failed".to_string()));
                    self.step_down_same_term();
                }
            }
        }
    }

    pub(crate) fn handle_log_durable(&mut self, result: Result<LogIndex, LogStoreError>) {
        match result {
            Ok(durable) => {
                self.status.set_last_durable_index(durable);
                self.try_advance_commit_index();
            }
            Err(error) => {
                slog::error!(self.logger, "Background log flush failed: {}", error);
                self.fail_pending_promises(|| ReplicateError::LocalIo("log flush failed".to_string()));
                if self.role == Role::Leader {
                    self.step_down_same_term();
                }
            }
        }
    }

    pub(super) fn dispatch_append_to_peers(&mut self) {
        for peer_id in self.peers.ids() {
            self.request_append_entries(peer_id);
        }
    }

    pub(crate) fn handle_heartbeat_tick(&mut self, tick: crate::replica::timers::HeartbeatTick) {
        if self.role != Role::Leader || tick.term != self.state.term {
            return;
        }
        if self.check_leadership_expired() {
            return;
        }
        self.sweep_idle_snapshot_ctx(tick.peer_id);
        self.request_append_entries(tick.peer_id);
    }

    /// A leader that cannot hear a quorum of voters for long enough stops
    /// pretending. Stepping down re-arms the election timer, which is what
    /// eventually drives the 2-node quorum auto-adjustment.
    fn check_leadership_expired(&mut self) -> bool {
        let expiry = self.options.heartbeat_interval * self.options.limits.response_limit as u32;
        let now = Instant::now();
        let mut responsive = 1; // self
        for server in self.config.voting_members() {
            if server.id == self.my_id {
                continue;
            }
            if let Some(peer) = self.peers.get(server.id) {
                if peer.inactive_for(now) <= expiry {
                    responsive += 1;
                }
            }
        }
        if responsive >= self.election_quorum() + 1 {
            self.leader_quorum_timer.reset();
            return false;
        }
        if self.leader_quorum_timer.elapsed() > expiry {
            slog::warn!(
                self.logger,
                "Leadership expired: only {} of {} voters responsive",
                responsive,
                self.num_voting_members()
            );
            self.become_follower(None);
            return true;
        }
        false
    }

    /// Ship the next batch (or an empty heartbeat) to one peer. No-op if a
    /// request is already in flight to it.
    pub(super) fn request_append_entries(&mut self, peer_id: ServerId) {
        if self.role != Role::Leader {
            return;
        }

        let log_start = self.log.start_index();
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if peer.next_index < log_start || peer.snapshot_transfer.is_some() {
            // This peer fell behind the compacted log; replicate by
            // snapshot instead.
            self.request_snapshot_chunk(peer_id);
            return;
        }

        let next_index = peer.next_index;
        let byte_cap = peer.batch_size_hint_in_bytes;
        let last_log_index = self.last_log_index();

        // Build the batch before claiming the peer: all immutable reads.
        let to_exclusive = std::cmp::min(
            last_log_index.next(),
            next_index.plus(self.options.max_append_entries as u64),
        );
        let mut entries = match self.log.entries(next_index, to_exclusive) {
            Ok(entries) => entries,
            Err(error) => {
                slog::error!(self.logger, "Failed to read log for peer {}: {}", peer_id, error);
                return;
            }
        };
        if byte_cap > 0 {
            // Positive hint: cap payload bytes, but never starve the peer
            // of at least one entry.
            let mut total = 0usize;
            let mut keep = 0usize;
            for entry in &entries {
                total += entry.payload.len();
                keep += 1;
                if total as i64 >= byte_cap && keep >= 1 {
                    break;
                }
            }
            entries.truncate(keep.max(1).min(entries.len()));
        }

        let prev_log_index = next_index.prev();
        let prev_log_term = self.term_for_log(prev_log_index);
        let sent_up_to = prev_log_index.plus(entries.len() as u64);
        let request = RaftRequest::AppendEntries(AppendEntriesRequest {
            header: self.request_header(peer_id, "append_entries_request"),
            prev_log_index,
            prev_log_term,
            entries,
        });
        let term = self.state.term;

        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        if !peer.make_busy() {
            // An earlier request is still out; the heartbeat timer retries.
            return;
        }
        peer.last_sent_at = Some(Instant::now());
        tokio::task::spawn(Self::call_peer_append_entries(
            Arc::clone(&peer.client),
            peer_id,
            term,
            sent_up_to,
            request,
            self.actor_client.clone(),
        ));

        // Proactive contact; push the periodic heartbeat out.
        if let Some(timer) = self.heartbeat_timers.get(&peer_id) {
            timer.reset();
        }
    }

    async fn call_peer_append_entries(
        client: Arc<dyn PeerRpc>,
        peer_id: ServerId,
        term: Term,
        sent_up_to: LogIndex,
        request: RaftRequest,
        actor_client: ActorClient,
    ) {
        let reply = client.send(request).await.and_then(|resp| match resp {
            RaftResponse::AppendEntries(r) => Ok(r),
            other => Err(RpcError::Dropped(format!("unexpected response: {:?}", other))),
        });
        actor_client
            .append_entries_reply_from_peer(peer_id, term, sent_up_to, reply)
            .await;
    }

    pub(crate) fn handle_append_entries_reply(
        &mut self,
        peer_id: ServerId,
        term: Term,
        sent_up_to: LogIndex,
        reply: Result<AppendEntriesResponse, RpcError>,
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
                slog::warn!(self.logger, "AppendEntries to peer {} failed: {}", peer_id, error);
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.needs_reconnect = true;
                }
                return;
            }
        };

        if response.term > self.state.term {
            self.adopt_term(response.term, ServerId::NONE);
            return;
        }
        if self.role != Role::Leader || term != self.state.term {
            return;
        }

        let last_log_index = self.last_log_index();
        let mut more_to_send = false;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.batch_size_hint_in_bytes = response.batch_size_hint_in_bytes;

            if response.accepted {
                let matched = response.next_index.prev();
                // Matched index never regresses.
                if matched > peer.matched_index {
                    peer.matched_index = matched;
                }
                peer.next_index = response.next_index;
            } else {
                // Rewind. A non-zero next_index is the follower's hint for
                // skipping a conflicting suffix in one hop.
                let rewound = if response.next_index.is_zero() {
                    LogIndex::new(std::cmp::max(1, peer.next_index.as_u64().saturating_sub(1)))
                } else {
                    response.next_index
                };
                peer.next_index = LogIndex::new(std::cmp::max(1, rewound.as_u64()));
                slog::info!(
                    self.logger,
                    "Peer {} rejected append at {}; next_index rewound to {}",
                    peer_id,
                    sent_up_to,
                    peer.next_index
                );
            }
            more_to_send = peer.next_index <= last_log_index;
        }

        if response.accepted {
            self.maybe_finalize_join(peer_id);
            self.try_advance_commit_index();
        }
        if more_to_send {
            self.request_append_entries(peer_id);
        }
    }

    /// Recompute the commit index from peer matched state. Current-term
    /// rule: counting replicas alone never commits an entry from an older
    /// term; it rides along once a current-term entry commits.
    pub(super) fn try_advance_commit_index(&mut self) {
        if self.role != Role::Leader {
            return;
        }

        // A negative batch hint from any follower's state machine blocks
        // commit advancement outright.
        if self.peers.iter().any(|p| p.batch_size_hint_in_bytes < 0) {
            slog::info!(self.logger, "Commit advancement blocked by negative batch hint");
            return;
        }

        let leader_durable = self.log.last_durable_index();
        let my_descriptor_votes = self
            .config
            .get_server(self.my_id)
            .map(|s| s.is_regular_member())
            .unwrap_or(false);

        let mut matches: Vec<u64> = Vec::new();
        if my_descriptor_votes {
            matches.push(leader_durable.as_u64());
        }
        for server in self.config.voting_members() {
            if server.id == self.my_id {
                continue;
            }
            let matched = self
                .peers
                .get(server.id)
                .map(|p| p.matched_index.as_u64())
                .unwrap_or(0);
            matches.push(matched);
        }

        let quorum = self.commit_quorum();
        if matches.len() < quorum + 1 {
            return;
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_target = LogIndex::new(matches[quorum]);
        if quorum_target <= self.commit_index {
            return;
        }
        match self.term_for_log(quorum_target) {
            t if t == self.state.term => {}
            _ => {
                // Nothing from our own term is quorum-replicated yet, and
                // counting alone never commits an older term's entry.
                return;
            }
        }

        // Full consensus shrinks the target to what every currently-healthy
        // voter holds; peers silent past the threshold are excluded.
        let mut full_target = quorum_target;
        if self.options.use_full_consensus_among_healthy_members {
            let alive_threshold = self.options.heartbeat_interval * self.options.limits.response_limit as u32;
            let now = Instant::now();
            for server in self.config.voting_members() {
                if server.id == self.my_id {
                    continue;
                }
                if let Some(peer) = self.peers.get(server.id) {
                    if peer.inactive_for(now) <= alive_threshold {
                        full_target = std::cmp::min(full_target, peer.matched_index);
                    }
                }
            }
        }

        // Per-entry rule, first unmet entry stops the advance (apply order
        // is strict). An entry with a custom committer set is judged by
        // that set alone; full-consensus mode applies to the rest.
        let mut final_target = self.commit_index;
        let mut index = self.commit_index.next();
        while index <= quorum_target {
            let required = {
                let sm = self.state_machine.lock().expect("state machine lock");
                sm.custom_committers(index)
            };
            let committable = match required {
                Some(required) => required.iter().all(|id| {
                    if *id == self.my_id {
                        leader_durable >= index
                    } else {
                        self.peers.get(*id).map(|p| p.matched_index >= index).unwrap_or(false)
                    }
                }),
                None => index <= full_target,
            };
            if !committable {
                break;
            }
            final_target = index;
            index = index.next();
        }

        if final_target > self.commit_index {
            self.advance_commit_to(final_target);
        }
    }

    /// Shared commit ratchet for leader and follower paths.
    pub(super) fn advance_commit_to(&mut self, new_commit: LogIndex) {
        debug_assert!(new_commit >= self.commit_index);
        self.commit_index = new_commit;
        self.status.set_commit_index(new_commit);
        if new_commit > self.lagging_sm_target_index {
            self.lagging_sm_target_index = new_commit;
        }
        self.enqueue_committed_entries();
    }

    /// Feed newly committed entries to the apply pipeline, in index order,
    /// exactly once.
    fn enqueue_committed_entries(&mut self) {
        while self.last_enqueued_apply < self.commit_index {
            let index = self.last_enqueued_apply.next();
            let entry = match self.log.entry_at(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    // Covered by a snapshot; the state machine already has it.
                    self.last_enqueued_apply = index;
                    continue;
                }
                Err(error) => {
                    slog::error!(self.logger, "Cannot read committed entry {}: {}", index, error);
                    return;
                }
            };
            let promise = self.promises.remove(&index);
            self.apply_pipeline.submit(crate::replica::apply::ApplyItem { index, entry, promise });
            self.last_enqueued_apply = index;
        }
    }

    // ------------- follower side -------------

    /// Handle an inbound append-entries. The response is deferred until the
    /// appended entries are durable locally, so an accept always implies
    /// durability; pure heartbeats answer immediately.
    pub(super) fn handle_append_entries_request(
        &mut self,
        request: AppendEntriesRequest,
        callback: Callback<RaftResponse, RequestError>,
    ) {
        let src = request.header.src;
        if request.header.term < self.state.term {
            callback.send(Ok(RaftResponse::AppendEntries(self.append_reject(src, LogIndex::ZERO))));
            return;
        }
        if self.role == Role::Leader {
            // Same term, two leaders: cannot happen through the vote
            // protocol. Refuse rather than follow a ghost.
            callback.send(Ok(RaftResponse::AppendEntries(self.append_reject(src, LogIndex::ZERO))));
            return;
        }

        // Same term. A competing candidacy is over; someone else won.
        if self.role == Role::Candidate {
            self.become_follower(Some(src));
        }
        self.hb_alive = true;
        self.last_leader_contact = Some(Instant::now());
        if self.leader != src {
            self.set_leader(src);
        }
        self.reset_election_timer();
        if request.header.commit_index > self.lagging_sm_target_index {
            self.lagging_sm_target_index = request.header.commit_index;
        }

        // Log-matching check.
        let prev = request.prev_log_index;
        let log_start = self.log.start_index();
        let match_ok = if prev.is_zero() || prev < log_start {
            // Anything below our start index is inside the snapshot, hence
            // committed and consistent by construction.
            true
        } else {
            match self.log.term_at(prev) {
                Ok(Some(term)) => term == request.prev_log_term,
                _ => false,
            }
        };
        if !match_ok {
            // Hint: if the leader is past our log end, tell it exactly
            // where to resume; on a term conflict make it step back.
            let hint = if prev >= self.log.next_slot() {
                self.log.next_slot()
            } else {
                LogIndex::ZERO
            };
            callback.send(Ok(RaftResponse::AppendEntries(self.append_reject(src, hint))));
            return;
        }

        let mut appended_any = false;
        let mut index = prev;
        for entry in &request.entries {
            index = index.next();
            if index < self.log.start_index() {
                continue;
            }
            match self.log.term_at(index) {
                Ok(Some(term)) if term == entry.term => {
                    // Idempotent resend; already have it.
                    continue;
                }
                Ok(Some(_)) => {
                    // Conflict: drop our uncommitted suffix, then take the
                    // leader's entry.
                    self.rollback_suffix(index);
                    if let Err(error) = self.log.write_at(index, entry.clone()) {
                        slog::error!(self.logger, "write_at({}) failed: {}", index, error);
                        callback.send(Ok(RaftResponse::AppendEntries(self.append_reject(src, LogIndex::ZERO))));
                        return;
                    }
                    self.note_entry_arrival(index, entry);
                    appended_any = true;
                }
                _ => {
                    if let Err(error) = self.log.append(entry.clone()) {
                        slog::error!(self.logger, "append({}) failed: {}", index, error);
                        callback.send(Ok(RaftResponse::AppendEntries(self.append_reject(src, LogIndex::ZERO))));
                        return;
                    }
                    self.note_entry_arrival(index, entry);
                    appended_any = true;
                }
            }
        }
        self.status.set_last_log_index(self.last_log_index());

        // Commit follows the leader, clamped to the last index this leader
        // has actually shown us.
        let last_from_leader = prev.plus(request.entries.len() as u64);
        if request.header.commit_index > self.commit_index {
            let new_commit = std::cmp::min(request.header.commit_index, last_from_leader);
            if new_commit > self.commit_index {
                self.advance_commit_to(new_commit);
            }
        }

        let response = {
            let sm = self.state_machine.lock().expect("state machine lock");
            AppendEntriesResponse {
                term: self.state.term,
                src: self.my_id,
                dst: src,
                accepted: true,
                next_index: last_from_leader.next(),
                batch_size_hint_in_bytes: sm.next_batch_size_hint_in_bytes(),
            }
        };

        if appended_any {
            // Defer the accept until the entries are durable; the leader
            // counts our accept as a durable copy.
            let status = Arc::clone(&self.status);
            let logger = self.logger.clone();
            self.log.request_flush(
                last_from_leader,
                Box::new(move |result| match result {
                    Ok(durable) => {
                        status.set_last_durable_index(durable);
                        callback.send(Ok(RaftResponse::AppendEntries(response)));
                    }
                    Err(error) => {
                        slog::error!(logger, "Follower log flush failed: {}", error);
                        callback.send(Err(RequestError::ShuttingDown));
                    }
                }),
            );
        } else {
            callback.send(Ok(RaftResponse::AppendEntries(response)));
        }
    }

    fn append_reject(&self, dst: ServerId, hint: LogIndex) -> AppendEntriesResponse {
        let sm = self.state_machine.lock().expect("state machine lock");
        AppendEntriesResponse {
            term: self.state.term,
            src: self.my_id,
            dst,
            accepted: false,
            next_index: hint,
            batch_size_hint_in_bytes: sm.next_batch_size_hint_in_bytes(),
        }
    }

    /// Bookkeeping for an entry that just arrived from the leader:
    /// speculative notification for application entries, immediate config
    /// adoption for configuration entries.
    fn note_entry_arrival(&mut self, index: LogIndex, entry: &LogEntry) {
        match entry.kind {
            EntryKind::Application => {
                let mut sm = self.state_machine.lock().expect("state machine lock");
                sm.pre_commit(index, &entry.payload);
            }
            EntryKind::Configuration => match ClusterConfig::from_bytes(entry.payload.clone()) {
                Ok(config) => self.apply_config(config),
                Err(error) => {
                    slog::error!(self.logger, "Undecodable configuration entry at {}: {}", index, error);
                }
            },
            EntryKind::SnapshotMarker | EntryKind::Custom => {}
        }
    }

    /// Uncommitted entries `[from, last]` are about to be overwritten.
    /// Notify the state machine in reverse order and restore the last
    /// configuration that survives the truncation.
    fn rollback_suffix(&mut self, from: LogIndex) {
        let last = self.last_log_index();
        let mut index = last;
        while index >= from && !index.is_zero() {
            if let Ok(Some(entry)) = self.log.entry_at(index) {
                if entry.kind == EntryKind::Application {
                    let mut sm = self.state_machine.lock().expect("state machine lock");
                    sm.rollback(index, &entry.payload);
                }
            }
            index = index.prev();
        }

        // If the authoritative (possibly uncommitted) config sits in the
        // doomed suffix, fall back to the last committed one. One-at-a-time
        // reconfiguration guarantees there is at most one such entry.
        if self.config.log_index >= from {
            let committed = self.committed_config.clone();
            self.apply_config(committed);
        }
    }

    // ------------- auto-forwarding -------------

    /// Relay a client write to the leader over the bounded forwarding pool.
    fn forward_to_leader(&mut self, input: ReplicateInput, callback: Callback<ReplicateOutput, ReplicateError>) {
        let Some(leader_server) = self.config.get_server(self.leader) else {
            callback.send(Err(ReplicateError::NoLeader));
            return;
        };
        let endpoint = leader_server.endpoint.clone();
        let client = self.forwarding.client_for(
            &endpoint,
            self.peers.transport(),
            self.options.auto_forwarding_max_connections,
        );

        let request = RaftRequest::ClientWrite(ClientWriteRequest {
            header: self.request_header(self.leader, "client_write_request"),
            data: input.data,
        });
        let timeout = self.options.auto_forwarding_req_timeout;

        tokio::task::spawn(async move {
            let send = client.send(request);
            let result = if timeout.is_zero() {
                send.await
            } else {
                match tokio::time::timeout(timeout, send).await {
                    Ok(result) => result,
                    Err(_) => {
                        // No retry on forwarding timeout.
                        callback.send(Err(ReplicateError::Timeout));
                        return;
                    }
                }
            };
            callback.send(Self::convert_forwarded_response(result, endpoint));
        });
    }

    fn convert_forwarded_response(
        result: Result<RaftResponse, RpcError>,
        endpoint: String,
    ) -> Result<ReplicateOutput, ReplicateError> {
        match result {
            Ok(RaftResponse::ClientWrite(response)) if response.accepted => {
                // The leader answered after apply; resolve the listener
                // immediately with the carried result.
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Ok(response.result.unwrap_or_default()));
                Ok(ReplicateOutput {
                    term: response.term,
                    index: response.log_index,
                    commit: CommitListener::new(rx),
                })
            }
            Ok(RaftResponse::ClientWrite(response)) => Err(ReplicateError::NotLeader {
                leader_hint: response.leader_hint,
                leader_endpoint: None,
            }),
            Ok(other) => Err(ReplicateError::ForwardingFailed(format!(
                "unexpected response from {}: {:?}",
                endpoint, other
            ))),
            Err(error) => Err(ReplicateError::ForwardingFailed(error.to_string())),
        }
    }

    /// Leader side of a forwarded write: append like a local write, answer
    /// once applied so the origin can resolve its client promise with the
    /// state machine output.
    pub(super) fn handle_client_write_request(
        &mut self,
        request: ClientWriteRequest,
        callback: Callback<RaftResponse, RequestError>,
    ) {
        let src = request.header.src;
        let my_id = self.my_id;
        let term = self.state.term;
        if self.role != Role::Leader {
            callback.send(Ok(RaftResponse::ClientWrite(ClientWriteResponse {
                term,
                src: my_id,
                dst: src,
                accepted: false,
                log_index: LogIndex::ZERO,
                result: None,
                leader_hint: self.leader,
            })));
            return;
        }

        match self.append_application_entry(request.data) {
            Ok(output) => {
                tokio::task::spawn(async move {
                    let result = output.commit.wait().await;
                    callback.send(Ok(RaftResponse::ClientWrite(ClientWriteResponse {
                        term: output.term,
                        src: my_id,
                        dst: src,
                        accepted: result.is_ok(),
                        log_index: output.index,
                        result: result.ok(),
                        leader_hint: my_id,
                    })));
                });
            }
            Err(error) => {
                slog::warn!(self.logger, "Forwarded write failed to append: {}", error);
                callback.send(Ok(RaftResponse::ClientWrite(ClientWriteResponse {
                    term,
                    src: my_id,
                    dst: src,
                    accepted: false,
                    log_index: LogIndex::ZERO,
                    result: None,
                    leader_hint: my_id,
                })));
            }
        }
    }
}

/// Bounded pool of connections a follower keeps toward the leader for
/// auto-forwarded writes, handed out round-robin.
pub(super) struct ForwardingPool {
    endpoint: String,
    clients: Vec<Arc<dyn PeerRpc>>,
    next: usize,
}

impl ForwardingPool {
    pub fn new() -> Self {
        ForwardingPool {
            endpoint: String::new(),
            clients: Vec::new(),
            next: 0,
        }
    }

    pub fn client_for(
        &mut self,
        endpoint: &str,
        transport: &dyn crate::transport::Transport,
        max_connections: usize,
    ) -> Arc<dyn PeerRpc> {
        if self.endpoint != endpoint {
            // Leader moved; the old pool is useless.
            self.endpoint = endpoint.to_string();
            self.clients.clear();
            self.next = 0;
        }
        if self.clients.len() < max_connections.max(1) {
            let client = transport.connect(endpoint);
            self.clients.push(Arc::clone(&client));
            return client;
        }
        let client = Arc::clone(&self.clients[self.next % self.clients.len()]);
        self.next = self.next.wrapping_add(1);
        client
    }

    pub fn clear(&mut self) {
        self.endpoint.clear();
        self.clients.clear();
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Event;
    use crate::replica::test_support::{descriptors, fixture, fixture_with_options};
    use crate::api::RaftOptions;
    use crate::commitlog::Term;

    fn entry(term: u64, data: &'static [u8]) -> LogEntry {
        LogEntry::new(Term::new(term), EntryKind::Application, Bytes::from_static(data))
    }

    fn append_request(
        f: &crate::replica::test_support::ReplicaFixture,
        src: i32,
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> AppendEntriesRequest {
        let mut header = f.header_from(src, term);
        header.commit_index = LogIndex::new(leader_commit);
        AppendEntriesRequest {
            header,
            prev_log_index: LogIndex::new(prev_index),
            prev_log_term: Term::new(prev_term),
            entries,
        }
    }

    #[tokio::test]
    async fn follower_accepts_entries_and_reports_next_index() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        let request = append_request(&f, 2, 1, 0, 0, vec![entry(1, b"a"), entry(1, b"b")], 0);
        let response = f.deliver_append(request).await;

        assert!(response.accepted);
        assert_eq!(response.next_index, LogIndex::new(3));
        assert_eq!(f.replica.last_log_index(), LogIndex::new(2));
        // Accept implies durability.
        assert_eq!(f.log.last_durable_index(), LogIndex::new(2));
        // And the sender is now our leader.
        assert_eq!(f.replica.leader, ServerId::new(2));
    }

    #[tokio::test]
    async fn follower_rejects_on_missing_prev_with_resume_hint() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        // Leader thinks we have 5 entries; we have none.
        let request = append_request(&f, 2, 1, 5, 1, vec![entry(1, b"f")], 0);
        let response = f.deliver_append(request).await;

        assert!(!response.accepted);
        // Hint points exactly at our next slot.
        assert_eq!(response.next_index, LogIndex::new(1));
    }

    #[tokio::test]
    async fn follower_truncates_conflicting_suffix() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        // Local (uncommitted) entries from an old leader at term 1.
        let request = append_request(&f, 2, 1, 0, 0, vec![entry(1, b"a"), entry(1, b"b"), entry(1, b"c")], 0);
        assert!(f.deliver_append(request).await.accepted);

        // New leader at term 2 disagrees from index 2 onward.
        let request = append_request(&f, 3, 2, 1, 1, vec![entry(2, b"x")], 0);
        let response = f.deliver_append(request).await;

        assert!(response.accepted);
        assert_eq!(f.replica.last_log_index(), LogIndex::new(2));
        assert_eq!(f.log.term_at(LogIndex::new(2)).unwrap(), Some(Term::new(2)));
    }

    #[tokio::test]
    async fn follower_append_is_idempotent() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        let request = append_request(&f, 2, 1, 0, 0, vec![entry(1, b"a"), entry(1, b"b")], 0);
        assert!(f.deliver_append(request).await.accepted);

        // Identical resend: same outcome, log unchanged.
        let request = append_request(&f, 2, 1, 0, 0, vec![entry(1, b"a"), entry(1, b"b")], 0);
        let response = f.deliver_append(request).await;
        assert!(response.accepted);
        assert_eq!(response.next_index, LogIndex::new(3));
        assert_eq!(f.replica.last_log_index(), LogIndex::new(2));
    }

    #[tokio::test]
    async fn follower_commit_clamped_to_entries_from_leader() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        // Leader claims commit 10 but only shows us 2 entries.
        let request = append_request(&f, 2, 1, 0, 0, vec![entry(1, b"a"), entry(1, b"b")], 10);
        assert!(f.deliver_append(request).await.accepted);
        assert_eq!(f.replica.commit_index, LogIndex::new(2));

        // Commit index never regresses.
        let request = append_request(&f, 2, 1, 2, 1, vec![], 1);
        assert!(f.deliver_append(request).await.accepted);
        assert_eq!(f.replica.commit_index, LogIndex::new(2));
    }

    #[tokio::test]
    async fn stale_term_leader_is_rejected() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.replica.state.term = Term::new(5);

        let request = append_request(&f, 2, 4, 0, 0, vec![entry(4, b"a")], 0);
        let response = f.deliver_append(request).await;
        assert!(!response.accepted);
        assert_eq!(response.term, Term::new(5));
        assert_eq!(f.replica.last_log_index(), LogIndex::ZERO);
    }

    #[tokio::test]
    async fn leader_commits_on_quorum_of_durable_matches() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.make_leader(1);

        f.replica.append_application_entry(Bytes::from_static(b"a")).unwrap();
        f.replica.append_application_entry(Bytes::from_static(b"b")).unwrap();
        assert_eq!(f.replica.commit_index, LogIndex::ZERO);

        // One follower caught up: 2 of 3 have it.
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().matched_index = LogIndex::new(2);
        f.replica.try_advance_commit_index();
        assert_eq!(f.replica.commit_index, LogIndex::new(2));
    }

    #[tokio::test]
    async fn leader_never_commits_prior_term_entries_by_counting() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        // An entry from term 1 sits in the log; we lead term 2.
        f.log.clone().append(entry(1, b"old")).unwrap();
        f.make_leader(2);
        f.replica.log.flush().unwrap();

        f.replica.peers.get_mut(ServerId::new(2)).unwrap().matched_index = LogIndex::new(1);
        f.replica.peers.get_mut(ServerId::new(3)).unwrap().matched_index = LogIndex::new(1);
        f.replica.try_advance_commit_index();
        // Quorum-replicated, but not ours to count.
        assert_eq!(f.replica.commit_index, LogIndex::ZERO);

        // A current-term entry replicated to quorum commits both.
        f.replica.append_application_entry(Bytes::from_static(b"new")).unwrap();
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().matched_index = LogIndex::new(2);
        f.replica.try_advance_commit_index();
        assert_eq!(f.replica.commit_index, LogIndex::new(2));
    }

    #[tokio::test]
    async fn negative_batch_hint_blocks_commit_until_cleared() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.make_leader(1);
        f.replica.append_application_entry(Bytes::from_static(b"a")).unwrap();

        let peer = f.replica.peers.get_mut(ServerId::new(2)).unwrap();
        peer.matched_index = LogIndex::new(1);
        peer.batch_size_hint_in_bytes = -1;

        f.replica.try_advance_commit_index();
        assert_eq!(f.replica.commit_index, LogIndex::ZERO);

        f.replica.peers.get_mut(ServerId::new(2)).unwrap().batch_size_hint_in_bytes = 0;
        f.replica.try_advance_commit_index();
        assert_eq!(f.replica.commit_index, LogIndex::new(1));
    }

    #[tokio::test]
    async fn custom_committers_gate_the_entry() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.make_leader(1);
        f.state_machine.lock().unwrap().committers = Some(vec![ServerId::new(3)]);

        f.replica.append_application_entry(Bytes::from_static(b"a")).unwrap();
        // Quorum is satisfied via peer 2, but the named committer (3) is not.
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().matched_index = LogIndex::new(1);
        f.replica.try_advance_commit_index();
        assert_eq!(f.replica.commit_index, LogIndex::ZERO);

        f.replica.peers.get_mut(ServerId::new(3)).unwrap().matched_index = LogIndex::new(1);
        f.replica.try_advance_commit_index();
        assert_eq!(f.replica.commit_index, LogIndex::new(1));
    }

    #[tokio::test]
    async fn full_consensus_waits_for_healthy_voters() {
        let options = RaftOptions {
            use_full_consensus_among_healthy_members: true,
            ..Default::default()
        };
        let mut f = fixture_with_options(descriptors(&[1, 2, 3]), 1, options);
        f.make_leader(1);
        f.replica.append_application_entry(Bytes::from_static(b"a")).unwrap();

        // Both peers are healthy (recent responses); only one has matched.
        let now = Instant::now();
        for id in [2, 3] {
            f.replica.peers.get_mut(ServerId::new(id)).unwrap().last_response_at = Some(now);
        }
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().matched_index = LogIndex::new(1);
        f.replica.try_advance_commit_index();
        // A plain majority is not enough in full-consensus mode.
        assert_eq!(f.replica.commit_index, LogIndex::ZERO);

        f.replica.peers.get_mut(ServerId::new(3)).unwrap().matched_index = LogIndex::new(1);
        f.replica.try_advance_commit_index();
        assert_eq!(f.replica.commit_index, LogIndex::new(1));
    }

    #[tokio::test]
    async fn committed_entries_flow_to_apply_pipeline_in_order() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.make_leader(1);
        for data in [b"a" as &[u8], b"b", b"c"] {
            f.replica
                .append_application_entry(Bytes::copy_from_slice(data))
                .unwrap();
        }
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().matched_index = LogIndex::new(3);
        f.replica.try_advance_commit_index();

        // The apply pipeline reports back per entry, in index order.
        let mut applied = Vec::new();
        while applied.len() < 3 {
            match f.actor_rx.recv().await {
                Some(Event::EntryApplied(index)) => applied.push(index.as_u64()),
                Some(_) => {}
                None => panic!("actor queue closed early"),
            }
        }
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(f.state_machine.lock().unwrap().applied.len(), 3);
    }

    #[tokio::test]
    async fn batch_capped_by_positive_byte_hint() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        // Peer 2's endpoint records what the leader ships to it.
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        struct Recorder(tokio::sync::mpsc::UnboundedSender<usize>);
        #[async_trait::async_trait]
        impl crate::transport::RpcHandler for Recorder {
            async fn handle(&self, request: RaftRequest) -> Result<RaftResponse, RpcError> {
                let RaftRequest::AppendEntries(req) = request else {
                    return Err(RpcError::Dropped("not append".to_string()));
                };
                let _ = self.0.send(req.entries.len());
                Ok(RaftResponse::AppendEntries(AppendEntriesResponse {
                    term: req.header.term,
                    src: req.header.dst,
                    dst: req.header.src,
                    accepted: true,
                    next_index: req.prev_log_index.plus(req.entries.len() as u64).next(),
                    batch_size_hint_in_bytes: 0,
                }))
            }
        }
        f.network.register("s2", Arc::new(Recorder(seen_tx)));

        f.make_leader(1);
        // Hold the peer's in-flight slot so the appends don't each trigger
        // their own little batch.
        assert!(f.replica.peers.get_mut(ServerId::new(2)).unwrap().make_busy());
        for _ in 0..5 {
            f.replica.append_application_entry(Bytes::from_static(b"0123456789")).unwrap();
        }

        // 15-byte cap: the batch stops at the entry that crosses the cap.
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().set_free();
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().batch_size_hint_in_bytes = 15;
        f.replica.request_append_entries(ServerId::new(2));

        let sent = seen_rx.recv().await;
        assert_eq!(sent, Some(2));
    }
}
