//! Snapshot install flow. When a peer's `next_index` falls below the log's
//! start index, the leader streams the state machine's snapshot in chunks
//! instead of log entries. Chunk reads go through an opaque per-transfer
//! context owned by the state machine and run on a worker task so heartbeat
//! cadence is unaffected.

use crate::actor::ActorClient;
use crate::commitlog::{LogIndex, LogStore, Term};
use crate::replica::cluster_config::ServerId;
use crate::replica::local_state::StateManager;
use crate::replica::messages::{
    InstallSnapshotRequest, InstallSnapshotResponse, MessageHeader, RaftRequest, RaftResponse,
};
use crate::replica::replica::Replica;
use crate::replica::replica_api::Role;
use crate::replica::state_machine::{SnapshotMeta, SnapshotUserCtx, StateMachine};
use crate::transport::{PeerRpc, RpcError};
use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

const SNAPSHOT_CHUNK_BYTES: usize = 32 * 1024;

/// Leader-side state of one snapshot transfer to one peer. The user context
/// is shared with the in-flight read worker; the coordination task closes it
/// through `free_snapshot_ctx` when the transfer ends for any reason.
pub struct SnapshotTransfer {
    pub meta: SnapshotMeta,
    pub offset: u64,
    pub user_ctx: Arc<Mutex<Option<SnapshotUserCtx>>>,
    pub read_failures: u32,
    pub last_activity: Instant,
}

impl SnapshotTransfer {
    fn new(meta: SnapshotMeta) -> Self {
        SnapshotTransfer {
            meta,
            offset: 0,
            user_ctx: Arc::new(Mutex::new(None)),
            read_failures: 0,
            last_activity: Instant::now(),
        }
    }
}

impl<L, S> Replica<L, S>
where
    L: LogStore,
    S: StateManager,
{
    /// Ship the next snapshot chunk to a peer that fell behind the log.
    pub(super) fn request_snapshot_chunk(&mut self, peer_id: ServerId) {
        if self.role != Role::Leader {
            return;
        }

        let snapshot = {
            let sm = self.state_machine.lock().expect("state machine lock");
            sm.last_snapshot()
        };
        let Some(snapshot) = snapshot else {
            slog::warn!(
                self.logger,
                "Peer {} needs a snapshot but the state machine has none",
                peer_id
            );
            return;
        };
        self.cached_snapshot = Some(snapshot.clone());

        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };

        // Start fresh if there is no transfer or the snapshot moved on.
        let stale = match &peer.snapshot_transfer {
            Some(transfer) => transfer.meta.last_index != snapshot.last_index,
            None => true,
        };
        if stale {
            if let Some(old) = peer.snapshot_transfer.take() {
                Self::free_transfer_ctx(&self.state_machine, old);
            }
            slog::info!(
                self.logger,
                "Starting snapshot transfer to peer {}: last_index {}, size {} bytes",
                peer_id,
                snapshot.last_index,
                snapshot.size_bytes
            );
            peer.snapshot_transfer = Some(SnapshotTransfer::new(snapshot.clone()));
        }

        if !peer.make_busy() {
            return;
        }
        peer.last_sent_at = Some(Instant::now());

        let transfer = peer.snapshot_transfer.as_ref().expect("transfer exists");
        let offset = transfer.offset;
        let user_ctx = Arc::clone(&transfer.user_ctx);
        let meta = transfer.meta.clone();
        let client = Arc::clone(&peer.client);
        let header = self.request_header(peer_id, "install_snapshot_request");
        let term = self.state.term;

        tokio::task::spawn(Self::read_and_send_chunk(
            Arc::clone(&self.state_machine),
            user_ctx,
            meta,
            offset,
            header,
            client,
            peer_id,
            term,
            self.actor_client.clone(),
        ));

        if let Some(timer) = self.heartbeat_timers.get(&peer_id) {
            timer.reset();
        }
        self.refresh_open_ctx_count();
    }

    /// Worker: read one chunk through the user context, then carry it to
    /// the peer. Read failures and RPC results both come back as events.
    #[allow(clippy::too_many_arguments)]
    async fn read_and_send_chunk(
        state_machine: Arc<Mutex<dyn StateMachine>>,
        user_ctx: Arc<Mutex<Option<SnapshotUserCtx>>>,
        meta: SnapshotMeta,
        offset: u64,
        header: MessageHeader,
        client: Arc<dyn PeerRpc>,
        peer_id: ServerId,
        term: Term,
        actor_client: ActorClient,
    ) {
        let mut buf = BytesMut::with_capacity(SNAPSHOT_CHUNK_BYTES);
        let read = {
            let mut sm = state_machine.lock().expect("state machine lock");
            let mut ctx = user_ctx.lock().expect("snapshot ctx lock");
            sm.read_snapshot_chunk(&meta, &mut ctx, offset, &mut buf)
        };

        let bytes_read = match read {
            Ok(n) => n as u64,
            Err(error) => {
                actor_client
                    .snapshot_read_failed(peer_id, term, offset, error.to_string())
                    .await;
                return;
            }
        };

        let done = offset + bytes_read >= meta.size_bytes;
        let request = RaftRequest::InstallSnapshot(InstallSnapshotRequest {
            header,
            snapshot_last_index: meta.last_index,
            snapshot_last_term: meta.last_term,
            snapshot_config: meta.last_config.to_bytes(),
            snapshot_size_bytes: meta.size_bytes,
            offset,
            data: buf.freeze(),
            done,
        });

        let reply = client.send(request).await.and_then(|resp| match resp {
            RaftResponse::InstallSnapshot(r) => Ok(r),
            other => Err(RpcError::Dropped(format!("unexpected response: {:?}", other))),
        });
        actor_client.snapshot_reply_from_peer(peer_id, term, offset, reply).await;
    }

    pub(crate) fn handle_snapshot_read_failed(&mut self, peer_id: ServerId, term: Term, offset: u64, reason: String) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.set_free();
        }
        if self.role != Role::Leader || term != self.state.term {
            return;
        }

        let retry_limit = self.options.limits.snapshot_read_retry_limit;
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let Some(transfer) = peer.snapshot_transfer.as_mut() else {
            return;
        };
        transfer.read_failures += 1;
        let failures = transfer.read_failures;
        slog::warn!(
            self.logger,
            "Snapshot read for peer {} failed at offset {} ({} of {}): {}",
            peer_id,
            offset,
            failures,
            retry_limit,
            reason
        );

        if failures >= retry_limit {
            // Give up on this peer for this cycle; the next heartbeat
            // starts a fresh transfer.
            slog::warn!(self.logger, "Abandoning snapshot transfer to peer {} this cycle", peer_id);
            self.close_snapshot_transfer(peer_id);
        } else {
            self.request_snapshot_chunk(peer_id);
        }
    }

    pub(crate) fn handle_snapshot_reply(
        &mut self,
        peer_id: ServerId,
        term: Term,
        _offset: u64,
        reply: Result<InstallSnapshotResponse, RpcError>,
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
                slog::warn!(self.logger, "Snapshot chunk to peer {} failed: {}", peer_id, error);
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

        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let Some(transfer) = peer.snapshot_transfer.as_mut() else {
            return;
        };

        if !response.accepted {
            slog::warn!(self.logger, "Peer {} refused snapshot chunk; restarting next cycle", peer_id);
            self.close_snapshot_transfer(peer_id);
            return;
        }

        transfer.last_activity = Instant::now();
        transfer.read_failures = 0;
        transfer.offset = response.next_offset;
        let meta_last_index = transfer.meta.last_index;
        let complete = response.next_offset >= transfer.meta.size_bytes;

        if complete {
            slog::info!(
                self.logger,
                "Snapshot transfer to peer {} complete at index {}",
                peer_id,
                meta_last_index
            );
            if meta_last_index > peer.matched_index {
                peer.matched_index = meta_last_index;
            }
            peer.next_index = meta_last_index.next();
            self.close_snapshot_transfer(peer_id);
            self.try_advance_commit_index();
            // Resume the normal append pipeline right behind the snapshot.
            self.request_append_entries(peer_id);
        } else {
            self.request_snapshot_chunk(peer_id);
        }
    }

    /// Close a transfer and hand its user context back to the state
    /// machine. Also the idle-timeout and peer-removal path, which is what
    /// keeps `open_snapshot_contexts` headed back to zero.
    pub(super) fn close_snapshot_transfer(&mut self, peer_id: ServerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if let Some(transfer) = peer.snapshot_transfer.take() {
                Self::free_transfer_ctx(&self.state_machine, transfer);
            }
        }
        self.refresh_open_ctx_count();
    }

    pub(super) fn free_transfer_ctx(state_machine: &Arc<Mutex<dyn StateMachine>>, transfer: SnapshotTransfer) {
        let ctx = transfer.user_ctx.lock().expect("snapshot ctx lock").take();
        if let Some(ctx) = ctx {
            let mut sm = state_machine.lock().expect("state machine lock");
            sm.free_snapshot_ctx(ctx);
        }
    }

    pub(super) fn sweep_idle_snapshot_ctx(&mut self, peer_id: ServerId) {
        let idle_timeout = self.options.snapshot_ctx_idle_timeout;
        let idle = self
            .peers
            .get(peer_id)
            .and_then(|p| p.snapshot_transfer.as_ref())
            .map(|t| t.last_activity.elapsed() > idle_timeout)
            .unwrap_or(false);
        if idle {
            slog::warn!(self.logger, "Snapshot context for peer {} idle too long; closing", peer_id);
            self.close_snapshot_transfer(peer_id);
        }
    }

    pub(super) fn refresh_open_ctx_count(&self) {
        let open = self.peers.iter().filter(|p| p.snapshot_transfer.is_some()).count();
        self.status.set_open_snapshot_contexts(open as u64);
    }

    // ------------- receiver side -------------

    pub(super) fn handle_install_snapshot_request(&mut self, request: &InstallSnapshotRequest) -> InstallSnapshotResponse {
        let src = request.header.src;
        let reject = InstallSnapshotResponse {
            term: self.state.term,
            src: self.my_id,
            dst: src,
            accepted: false,
            next_offset: request.offset,
        };

        if request.header.term < self.state.term || self.role == Role::Leader {
            return reject;
        }
        if self.role == Role::Candidate {
            self.become_follower(Some(src));
        }
        self.hb_alive = true;
        self.last_leader_contact = Some(tokio::time::Instant::now());
        if self.leader != src {
            self.set_leader(src);
        }
        self.reset_election_timer();

        let meta = match request.snapshot_meta() {
            Ok(meta) => meta,
            Err(error) => {
                slog::error!(self.logger, "Undecodable snapshot config from leader {}: {}", src, error);
                return reject;
            }
        };

        let save_result = {
            let mut sm = self.state_machine.lock().expect("state machine lock");
            sm.save_snapshot_chunk(&meta, request.offset, &request.data, request.done)
        };
        if let Err(error) = save_result {
            slog::error!(self.logger, "Saving snapshot chunk failed: {}", error);
            return reject;
        }

        if request.done {
            let applied = {
                let mut sm = self.state_machine.lock().expect("state machine lock");
                sm.apply_snapshot(&meta)
            };
            if !applied {
                slog::error!(self.logger, "State machine refused snapshot at index {}", meta.last_index);
                return reject;
            }

            slog::info!(
                self.logger,
                "Snapshot applied: last_index {}, last_term {}",
                meta.last_index,
                meta.last_term
            );
            // The snapshot is authoritative for everything it covers:
            // configuration, commit progress, and the log prefix.
            self.committed_config = meta.last_config.clone();
            self.apply_config(meta.last_config.clone());
            if let Err(error) = self.log.compact(meta.last_index) {
                slog::error!(self.logger, "Log reset after snapshot failed: {}", error);
            }
            self.status.set_last_log_index(self.last_log_index());
            if meta.last_index > self.commit_index {
                self.commit_index = meta.last_index;
                self.status.set_commit_index(meta.last_index);
            }
            if meta.last_index > self.last_enqueued_apply {
                self.last_enqueued_apply = meta.last_index;
            }
            self.status.set_last_applied_index(meta.last_index);
            if meta.last_index > self.lagging_sm_target_index {
                self.lagging_sm_target_index = meta.last_index;
            }
            self.cached_snapshot = Some(meta);
        }

        InstallSnapshotResponse {
            term: self.state.term,
            src: self.my_id,
            dst: src,
            accepted: true,
            next_offset: request.offset + request.data.len() as u64,
        }
    }

    // ------------- snapshot creation -------------

    /// Called as applied entries accumulate; every `snapshot_distance`
    /// entries the engine asks the state machine for a fresh snapshot and
    /// compacts the log behind it, keeping `reserved_log_items`.
    pub(crate) fn handle_entry_applied(&mut self, index: LogIndex) {
        if self.options.snapshot_distance == 0 {
            return;
        }
        let last_snapshot_index = self.cached_snapshot.as_ref().map(|s| s.last_index).unwrap_or(LogIndex::ZERO);
        if index.as_u64() < last_snapshot_index.as_u64() + self.options.snapshot_distance {
            return;
        }

        let last_term = self.term_for_log(index);
        let meta = SnapshotMeta {
            last_index: index,
            last_term,
            last_config: self.committed_config.clone(),
            size_bytes: 0,
        };
        self.hooks.on_event(crate::api::HookEvent::SaveSnapshot { last_index: index });
        {
            let mut sm = self.state_machine.lock().expect("state machine lock");
            sm.create_snapshot(&meta);
        }
        // Cache whatever the state machine reports (it fills in the size).
        let created = {
            let sm = self.state_machine.lock().expect("state machine lock");
            sm.last_snapshot()
        };
        if let Some(created) = created {
            slog::info!(
                self.logger,
                "Snapshot created at index {}; compacting log (keeping {} items)",
                created.last_index,
                self.options.reserved_log_items
            );
            let keep_from = created.last_index.as_u64().saturating_sub(self.options.reserved_log_items);
            if keep_from > 0 {
                if let Err(error) = self.log.compact(LogIndex::new(keep_from)) {
                    slog::warn!(self.logger, "Log compaction failed: {}", error);
                }
            }
            self.cached_snapshot = Some(created);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::cluster_config::ClusterConfig;
    use crate::replica::messages::AppendEntriesRequest;
    use crate::replica::test_support::{descriptors, fixture};
    use bytes::Bytes;

    fn snapshot_request(
        f: &crate::replica::test_support::ReplicaFixture,
        src: i32,
        term: u64,
        last_index: u64,
        offset: u64,
        data: &'static [u8],
        total_size: u64,
        done: bool,
    ) -> InstallSnapshotRequest {
        let config = ClusterConfig::new(descriptors(&[1, 2, 3]));
        InstallSnapshotRequest {
            header: f.header_from(src, term),
            snapshot_last_index: LogIndex::new(last_index),
            snapshot_last_term: Term::new(term),
            snapshot_config: config.to_bytes(),
            snapshot_size_bytes: total_size,
            offset,
            data: Bytes::from_static(data),
            done,
        }
    }

    #[tokio::test]
    async fn receiver_accepts_chunks_and_applies_on_done() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        let first = snapshot_request(&f, 2, 1, 50, 0, b"hello", 10, false);
        let response = f.replica.handle_install_snapshot_request(&first);
        assert!(response.accepted);
        assert_eq!(response.next_offset, 5);

        let last = snapshot_request(&f, 2, 1, 50, 5, b"world", 10, true);
        let response = f.replica.handle_install_snapshot_request(&last);
        assert!(response.accepted);

        // Snapshot is authoritative: log restarts after it, commit and
        // apply progress jump to its last index.
        assert_eq!(f.log.start_index(), LogIndex::new(51));
        assert_eq!(f.replica.commit_index, LogIndex::new(50));
        let sm = f.state_machine.lock().unwrap();
        assert_eq!(sm.last_applied, LogIndex::new(50));
        assert_eq!(sm.saved_chunks.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_apply_is_idempotent_for_following_appends() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);

        let only = snapshot_request(&f, 2, 1, 50, 0, b"0123456789", 10, true);
        assert!(f.replica.handle_install_snapshot_request(&only).accepted);

        // Appends resume at snapshot_last_idx + 1.
        let request = AppendEntriesRequest {
            header: f.header_from(2, 1),
            prev_log_index: LogIndex::new(50),
            prev_log_term: Term::new(1),
            entries: vec![crate::commitlog::LogEntry::new(
                Term::new(1),
                crate::commitlog::EntryKind::Application,
                Bytes::from_static(b"next"),
            )],
        };
        let response = f.deliver_append(request).await;
        assert!(response.accepted);
        assert_eq!(response.next_index, LogIndex::new(52));
        assert_eq!(f.replica.last_log_index(), LogIndex::new(51));
    }

    #[tokio::test]
    async fn stale_term_snapshot_is_refused() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.replica.state.term = Term::new(5);

        let request = snapshot_request(&f, 2, 4, 50, 0, b"x", 1, true);
        let response = f.replica.handle_install_snapshot_request(&request);
        assert!(!response.accepted);
        assert_eq!(f.log.start_index(), LogIndex::new(1));
    }

    #[tokio::test]
    async fn read_failures_close_the_context_past_retry_limit() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.replica.options.limits.snapshot_read_retry_limit = 2;
        f.make_leader(1);

        // Fake an in-progress transfer to peer 2.
        let meta = SnapshotMeta {
            last_index: LogIndex::new(10),
            last_term: Term::new(1),
            last_config: ClusterConfig::new(descriptors(&[1, 2, 3])),
            size_bytes: 100,
        };
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().snapshot_transfer =
            Some(SnapshotTransfer::new(meta));
        f.replica.refresh_open_ctx_count();
        assert_eq!(f.replica.status.snapshot().open_snapshot_contexts, 1);

        f.replica
            .handle_snapshot_read_failed(ServerId::new(2), Term::new(1), 0, "boom".to_string());
        // One failure: transfer survives for a retry.
        assert!(f.replica.peers.get(ServerId::new(2)).unwrap().snapshot_transfer.is_some());

        f.replica
            .handle_snapshot_read_failed(ServerId::new(2), Term::new(1), 0, "boom".to_string());
        // Retry limit exhausted: context closed, count back to zero.
        assert!(f.replica.peers.get(ServerId::new(2)).unwrap().snapshot_transfer.is_none());
        assert_eq!(f.replica.status.snapshot().open_snapshot_contexts, 0);
    }

    #[tokio::test]
    async fn contexts_close_when_peer_is_removed() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.make_leader(1);

        let meta = SnapshotMeta {
            last_index: LogIndex::new(10),
            last_term: Term::new(1),
            last_config: ClusterConfig::new(descriptors(&[1, 2, 3])),
            size_bytes: 100,
        };
        f.replica.peers.get_mut(ServerId::new(3)).unwrap().snapshot_transfer =
            Some(SnapshotTransfer::new(meta));
        f.replica.refresh_open_ctx_count();
        assert_eq!(f.replica.status.snapshot().open_snapshot_contexts, 1);

        f.replica.handle_remove_server(ServerId::new(3)).unwrap();
        let entry_index = f.replica.last_log_index();
        f.replica.handle_config_committed(entry_index);

        assert_eq!(f.replica.status.snapshot().open_snapshot_contexts, 0);
    }

    #[tokio::test]
    async fn transfer_completion_resumes_append_pipeline() {
        let mut f = fixture(descriptors(&[1, 2, 3]), 1);
        f.make_leader(1);

        let meta = SnapshotMeta {
            last_index: LogIndex::new(10),
            last_term: Term::new(1),
            last_config: ClusterConfig::new(descriptors(&[1, 2, 3])),
            size_bytes: 100,
        };
        f.replica.peers.get_mut(ServerId::new(2)).unwrap().snapshot_transfer =
            Some(SnapshotTransfer::new(meta));

        let reply = InstallSnapshotResponse {
            term: Term::new(1),
            src: ServerId::new(2),
            dst: ServerId::new(1),
            accepted: true,
            next_offset: 100,
        };
        f.replica
            .handle_snapshot_reply(ServerId::new(2), Term::new(1), 0, Ok(reply));

        let peer = f.replica.peers.get(ServerId::new(2)).unwrap();
        assert!(peer.snapshot_transfer.is_none());
        assert_eq!(peer.matched_index, LogIndex::new(10));
        assert_eq!(peer.next_index, LogIndex::new(11));
    }
}
