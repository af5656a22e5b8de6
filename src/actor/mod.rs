use crate::commitlog::{LogIndex, LogStore, LogStoreError, Term};
use crate::replica;
use crate::replica::timers::HeartbeatTick;
use crate::replica::{
    AppendEntriesResponse, InstallSnapshotResponse, PreVoteResponse, RaftRequest, RaftResponse, ServerDescriptor,
    ServerId, StateManager, VoteResponse,
};
use crate::transport::RpcError;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::ops::ControlFlow;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

/// Everything the coordination task reacts to: client submissions, inbound
/// RPCs, worker completions, and timer fires. Workers never touch replica
/// state; they post one of these.
#[derive(Debug)]
pub enum Event {
    // -- client-facing --
    Replicate(
        replica::ReplicateInput,
        Callback<replica::ReplicateOutput, replica::ReplicateError>,
    ),
    AddServer(ServerDescriptor, Callback<(), replica::MembershipError>),
    RemoveServer(ServerId, Callback<(), replica::MembershipError>),
    YieldLeadership {
        immediate: bool,
        successor: Option<ServerId>,
        callback: Callback<(), replica::LeadershipTransferError>,
    },
    SetPriority {
        server_id: ServerId,
        new_priority: i32,
        callback: Callback<replica::PriorityChangeResult, replica::PriorityChangeError>,
    },
    PauseApply {
        auto_resume: Option<Duration>,
    },
    ResumeApply,
    GetPeerInfo(Callback<Vec<replica::PeerInfo>, replica::ActorDead>),
    Shutdown,

    // -- inbound RPC (single router entry point) --
    IncomingRequest(RaftRequest, Callback<RaftResponse, replica::RequestError>),

    // -- worker completions --
    PreVoteReplyFromPeer {
        peer_id: ServerId,
        round_term: Term,
        reply: Result<PreVoteResponse, RpcError>,
    },
    VoteReplyFromPeer {
        peer_id: ServerId,
        term: Term,
        reply: Result<VoteResponse, RpcError>,
    },
    AppendEntriesReplyFromPeer {
        peer_id: ServerId,
        term: Term,
        /// Last log index included in the request, zero for pure heartbeat.
        sent_up_to: LogIndex,
        reply: Result<AppendEntriesResponse, RpcError>,
    },
    SnapshotReplyFromPeer {
        peer_id: ServerId,
        term: Term,
        offset: u64,
        reply: Result<InstallSnapshotResponse, RpcError>,
    },
    SnapshotReadFailed {
        peer_id: ServerId,
        term: Term,
        offset: u64,
        reason: String,
    },
    NotificationReplyFromPeer {
        peer_id: ServerId,
    },
    LogDurable(Result<LogIndex, LogStoreError>),
    EntryApplied(LogIndex),
    ConfigCommitted(LogIndex),

    // -- timers --
    ElectionTimeout,
    HeartbeatTick(HeartbeatTick),
}

pub struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Debug for Callback<O, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish()
    }
}

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn new(sender: oneshot::Sender<Result<O, E>>) -> Self {
        Callback(sender)
    }

    pub fn send(self, message: Result<O, E>) {
        // Caller may have stopped waiting; that's their business.
        let _ = self.0.send(message);
    }
}

/// Handle for posting events into the coordination task.
#[derive(Clone)]
pub struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        ActorClient { sender }
    }

    pub fn channel(buffer: usize) -> (ActorClient, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer);
        (ActorClient::new(tx), rx)
    }

    pub async fn replicate(
        &self,
        input: replica::ReplicateInput,
    ) -> Result<replica::ReplicateOutput, replica::ReplicateError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::Replicate(input, Callback(tx)))
            .await
            .map_err(|_| replica::ReplicateError::ShuttingDown)?;
        rx.await.map_err(|_| replica::ReplicateError::ShuttingDown)?
    }

    pub async fn add_server(&self, descriptor: ServerDescriptor) -> Result<(), replica::MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::AddServer(descriptor, Callback(tx)))
            .await
            .map_err(|_| replica::MembershipError::ShuttingDown)?;
        rx.await.map_err(|_| replica::MembershipError::ShuttingDown)?
    }

    pub async fn remove_server(&self, server_id: ServerId) -> Result<(), replica::MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::RemoveServer(server_id, Callback(tx)))
            .await
            .map_err(|_| replica::MembershipError::ShuttingDown)?;
        rx.await.map_err(|_| replica::MembershipError::ShuttingDown)?
    }

    pub async fn yield_leadership(
        &self,
        immediate: bool,
        successor: Option<ServerId>,
    ) -> Result<(), replica::LeadershipTransferError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::YieldLeadership {
            immediate,
            successor,
            callback: Callback(tx),
        })
        .await
        .map_err(|_| replica::LeadershipTransferError::ShuttingDown)?;
        rx.await.map_err(|_| replica::LeadershipTransferError::ShuttingDown)?
    }

    pub async fn set_priority(
        &self,
        server_id: ServerId,
        new_priority: i32,
    ) -> Result<replica::PriorityChangeResult, replica::PriorityChangeError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::SetPriority {
            server_id,
            new_priority,
            callback: Callback(tx),
        })
        .await
        .map_err(|_| replica::PriorityChangeError::ShuttingDown)?;
        rx.await.map_err(|_| replica::PriorityChangeError::ShuttingDown)?
    }

    pub async fn pause_apply(&self, auto_resume: Option<Duration>) {
        let _ = self.send_to_actor(Event::PauseApply { auto_resume }).await;
    }

    pub async fn resume_apply(&self) {
        let _ = self.send_to_actor(Event::ResumeApply).await;
    }

    pub async fn get_peer_info(&self) -> Result<Vec<replica::PeerInfo>, replica::ActorDead> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::GetPeerInfo(Callback(tx)))
            .await
            .map_err(|_| replica::ActorDead)?;
        rx.await.map_err(|_| replica::ActorDead)?
    }

    pub async fn shutdown(&self) {
        let _ = self.send_to_actor(Event::Shutdown).await;
    }

    pub async fn incoming_request(&self, request: RaftRequest) -> Result<RaftResponse, replica::RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::IncomingRequest(request, Callback(tx)))
            .await
            .map_err(|_| replica::RequestError::ShuttingDown)?;
        rx.await.map_err(|_| replica::RequestError::ShuttingDown)?
    }

    pub async fn pre_vote_reply_from_peer(
        &self,
        peer_id: ServerId,
        round_term: Term,
        reply: Result<PreVoteResponse, RpcError>,
    ) {
        let _ = self
            .send_to_actor(Event::PreVoteReplyFromPeer {
                peer_id,
                round_term,
                reply,
            })
            .await;
    }

    pub async fn vote_reply_from_peer(&self, peer_id: ServerId, term: Term, reply: Result<VoteResponse, RpcError>) {
        let _ = self
            .send_to_actor(Event::VoteReplyFromPeer { peer_id, term, reply })
            .await;
    }

    pub async fn append_entries_reply_from_peer(
        &self,
        peer_id: ServerId,
        term: Term,
        sent_up_to: LogIndex,
        reply: Result<AppendEntriesResponse, RpcError>,
    ) {
        let _ = self
            .send_to_actor(Event::AppendEntriesReplyFromPeer {
                peer_id,
                term,
                sent_up_to,
                reply,
            })
            .await;
    }

    pub async fn snapshot_reply_from_peer(
        &self,
        peer_id: ServerId,
        term: Term,
        offset: u64,
        reply: Result<InstallSnapshotResponse, RpcError>,
    ) {
        let _ = self
            .send_to_actor(Event::SnapshotReplyFromPeer {
                peer_id,
                term,
                offset,
                reply,
            })
            .await;
    }

    pub async fn snapshot_read_failed(&self, peer_id: ServerId, term: Term, offset: u64, reason: String) {
        let _ = self
            .send_to_actor(Event::SnapshotReadFailed {
                peer_id,
                term,
                offset,
                reason,
            })
            .await;
    }

    pub async fn notification_reply_from_peer(&self, peer_id: ServerId) {
        let _ = self.send_to_actor(Event::NotificationReplyFromPeer { peer_id }).await;
    }

    pub async fn log_durable(&self, result: Result<LogIndex, LogStoreError>) {
        let _ = self.send_to_actor(Event::LogDurable(result)).await;
    }

    pub async fn entry_applied(&self, index: LogIndex) {
        let _ = self.send_to_actor(Event::EntryApplied(index)).await;
    }

    pub async fn config_committed(&self, index: LogIndex) {
        let _ = self.send_to_actor(Event::ConfigCommitted(index)).await;
    }

    pub async fn election_timeout(&self) {
        let _ = self.send_to_actor(Event::ElectionTimeout).await;
    }

    pub async fn heartbeat_tick(&self, tick: HeartbeatTick) {
        let _ = self.send_to_actor(Event::HeartbeatTick(tick)).await;
    }

    async fn send_to_actor(&self, event: Event) -> Result<(), ()> {
        self.sender.send(event).await.map_err(|_| ())
    }
}

/// ReplicaActor drives the replica in actor style: one task, one queue, all
/// mutable state owned by the task.
pub struct ReplicaActor<L, S>
where
    L: LogStore,
    S: StateManager,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: LogStore,
    S: StateManager,
{
    pub fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica<L, S>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "Received: {:?}", event);
            if let ControlFlow::Break(()) = self.handle_event(event) {
                break;
            }
        }
        self.replica.on_actor_exit();
        slog::info!(self.logger, "Replica event loop has exited");
    }

    // Must NOT be async. Long running work is spawned on workers that post
    // their results back as events.
    fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Replicate(input, callback) => {
                // The replica answers directly; on the forwarding path the
                // callback travels into the forwarding worker.
                self.replica.handle_replicate(input, callback);
            }
            Event::AddServer(descriptor, callback) => {
                callback.send(self.replica.handle_add_server(descriptor));
            }
            Event::RemoveServer(server_id, callback) => {
                callback.send(self.replica.handle_remove_server(server_id));
            }
            Event::YieldLeadership {
                immediate,
                successor,
                callback,
            } => {
                callback.send(self.replica.handle_yield_leadership(immediate, successor));
            }
            Event::SetPriority {
                server_id,
                new_priority,
                callback,
            } => {
                callback.send(self.replica.handle_set_priority(server_id, new_priority));
            }
            Event::PauseApply { auto_resume } => {
                self.replica.handle_pause_apply(auto_resume);
            }
            Event::ResumeApply => {
                self.replica.handle_resume_apply();
            }
            Event::GetPeerInfo(callback) => {
                callback.send(Ok(self.replica.peer_info()));
            }
            Event::Shutdown => {
                self.replica.handle_shutdown();
                return ControlFlow::Break(());
            }
            Event::IncomingRequest(request, callback) => {
                self.replica.handle_incoming_request(request, callback);
            }
            Event::PreVoteReplyFromPeer {
                peer_id,
                round_term,
                reply,
            } => {
                self.replica.handle_pre_vote_reply(peer_id, round_term, reply);
            }
            Event::VoteReplyFromPeer { peer_id, term, reply } => {
                self.replica.handle_vote_reply(peer_id, term, reply);
            }
            Event::AppendEntriesReplyFromPeer {
                peer_id,
                term,
                sent_up_to,
                reply,
            } => {
                self.replica.handle_append_entries_reply(peer_id, term, sent_up_to, reply);
            }
            Event::SnapshotReplyFromPeer {
                peer_id,
                term,
                offset,
                reply,
            } => {
                self.replica.handle_snapshot_reply(peer_id, term, offset, reply);
            }
            Event::SnapshotReadFailed {
                peer_id,
                term,
                offset,
                reason,
            } => {
                self.replica.handle_snapshot_read_failed(peer_id, term, offset, reason);
            }
            Event::NotificationReplyFromPeer { peer_id } => {
                self.replica.handle_notification_reply(peer_id);
            }
            Event::LogDurable(result) => {
                self.replica.handle_log_durable(result);
            }
            Event::EntryApplied(index) => {
                self.replica.handle_entry_applied(index);
            }
            Event::ConfigCommitted(index) => {
                self.replica.handle_config_committed(index);
            }
            Event::ElectionTimeout => {
                if self.replica.handle_election_timeout() {
                    return ControlFlow::Break(());
                }
            }
            Event::HeartbeatTick(tick) => {
                self.replica.handle_heartbeat_tick(tick);
            }
        }
        ControlFlow::Continue(())
    }
}
