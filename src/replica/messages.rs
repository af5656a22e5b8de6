use crate::commitlog::{EntryKind, LogEntry, LogIndex, Term};
use crate::replica::cluster_config::ServerId;
use crate::replica::state_machine::SnapshotMeta;
use bytes::Bytes;

/// Fields every request carries: who is talking to whom, in which term, and
/// the sender's view of its own log and commit progress. `meta` is an opaque
/// application string attached by the write-side callback hook and validated
/// by the read side; a read-side refusal drops the message.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub commit_index: LogIndex,
    pub meta: Option<String>,
}

/// Non-term-incrementing probe to estimate election viability before
/// disturbing the group with a real vote.
#[derive(Debug, Clone)]
pub struct PreVoteRequest {
    pub header: MessageHeader,
}

/// Marker payload attached to a vote request to make receivers bypass
/// priority gating. Carried as a custom log entry, not a message field.
const FORCE_VOTE_MARKER: &[u8] = b"force-vote";

pub fn force_vote_marker_entry() -> LogEntry {
    LogEntry::new(Term::ZERO, EntryKind::Custom, Bytes::from_static(FORCE_VOTE_MARKER))
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub header: MessageHeader,
    /// Piggybacked marker entries; today only the force-vote marker rides
    /// here.
    pub entries: Vec<LogEntry>,
}

impl VoteRequest {
    pub fn is_force_vote(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == EntryKind::Custom && e.payload.as_ref() == FORCE_VOTE_MARKER)
    }
}

/// Log replication and heartbeat. The leader's commit index travels in
/// `header.commit_index`.
#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub header: MessageHeader,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotRequest {
    pub header: MessageHeader,
    pub snapshot_last_index: LogIndex,
    pub snapshot_last_term: Term,
    /// Serialized `ClusterConfig` as of the snapshot position.
    pub snapshot_config: Bytes,
    pub snapshot_size_bytes: u64,
    pub offset: u64,
    pub data: Bytes,
    pub done: bool,
}

impl InstallSnapshotRequest {
    pub fn snapshot_meta(&self) -> Result<SnapshotMeta, crate::replica::cluster_config::ConfigDecodeError> {
        Ok(SnapshotMeta {
            last_index: self.snapshot_last_index,
            last_term: self.snapshot_last_term,
            last_config: crate::replica::cluster_config::ClusterConfig::from_bytes(self.snapshot_config.clone())?,
            size_bytes: self.snapshot_size_bytes,
        })
    }
}

/// Engine-to-engine notifications that are not log replication.
#[derive(Debug, Clone)]
pub enum CustomNotificationKind {
    /// "Become leader now": successor side of a leadership transfer. The
    /// receiver starts an election with the force-vote marker set.
    LeadershipTakeover,
    /// "You have been removed and the membership change is committed."
    LeaveGroup,
    /// The leader's log no longer holds what this follower needs; a snapshot
    /// will follow. Carries the leader's log start index.
    OutOfLogRange(LogIndex),
}

#[derive(Debug, Clone)]
pub struct CustomNotificationRequest {
    pub header: MessageHeader,
    pub kind: CustomNotificationKind,
}

/// Follower-to-leader plea to rebuild the leader's connection to the sender.
/// Sent after too many quorum-rejected pre-votes, which usually means the
/// leader's heartbeats are not arriving here.
#[derive(Debug, Clone)]
pub struct ReconnectRequest {
    pub header: MessageHeader,
}

#[derive(Debug, Clone)]
pub struct PriorityChangeRequest {
    pub header: MessageHeader,
    pub server_id: ServerId,
    pub new_priority: i32,
}

/// A client write relayed from a follower to the leader (auto-forwarding).
#[derive(Debug, Clone)]
pub struct ClientWriteRequest {
    pub header: MessageHeader,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum RaftRequest {
    PreVote(PreVoteRequest),
    Vote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    CustomNotification(CustomNotificationRequest),
    Reconnect(ReconnectRequest),
    PriorityChange(PriorityChangeRequest),
    ClientWrite(ClientWriteRequest),
}

impl RaftRequest {
    pub fn header(&self) -> &MessageHeader {
        match self {
            RaftRequest::PreVote(r) => &r.header,
            RaftRequest::Vote(r) => &r.header,
            RaftRequest::AppendEntries(r) => &r.header,
            RaftRequest::InstallSnapshot(r) => &r.header,
            RaftRequest::CustomNotification(r) => &r.header,
            RaftRequest::Reconnect(r) => &r.header,
            RaftRequest::PriorityChange(r) => &r.header,
            RaftRequest::ClientWrite(r) => &r.header,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            RaftRequest::PreVote(_) => "pre_vote_request",
            RaftRequest::Vote(_) => "request_vote_request",
            RaftRequest::AppendEntries(_) => "append_entries_request",
            RaftRequest::InstallSnapshot(_) => "install_snapshot_request",
            RaftRequest::CustomNotification(_) => "custom_notification_request",
            RaftRequest::Reconnect(_) => "reconnect_request",
            RaftRequest::PriorityChange(_) => "priority_change",
            RaftRequest::ClientWrite(_) => "client_write_request",
        }
    }
}

/// Pre-vote deny carries the responder's next slot; `LogIndex::MAX` is the
/// "abandoned" marker meaning "I do not know you, you were removed".
#[derive(Debug, Clone)]
pub struct PreVoteResponse {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub accepted: bool,
    pub next_index: LogIndex,
}

impl PreVoteResponse {
    pub fn is_abandoned_marker(&self) -> bool {
        !self.accepted && self.next_index == LogIndex::MAX
    }
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub accepted: bool,
    pub next_index: LogIndex,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub accepted: bool,
    /// On accept: the slot right after the last entry the follower holds
    /// from this request. On reject: where the leader should rewind to.
    pub next_index: LogIndex,
    /// Back-pressure from the follower's state machine; see
    /// `StateMachine::next_batch_size_hint_in_bytes`.
    pub batch_size_hint_in_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub accepted: bool,
    /// Offset the leader should send next.
    pub next_offset: u64,
}

#[derive(Debug, Clone)]
pub struct CustomNotificationResponse {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct ReconnectResponse {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct PriorityChangeResponse {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub accepted: bool,
}

/// Result of a relayed client write: on success, where the entry landed; on
/// refusal, who to talk to instead.
#[derive(Debug, Clone)]
pub struct ClientWriteResponse {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub accepted: bool,
    pub log_index: LogIndex,
    pub result: Option<Bytes>,
    pub leader_hint: ServerId,
}

#[derive(Debug, Clone)]
pub enum RaftResponse {
    PreVote(PreVoteResponse),
    Vote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    CustomNotification(CustomNotificationResponse),
    Reconnect(ReconnectResponse),
    PriorityChange(PriorityChangeResponse),
    ClientWrite(ClientWriteResponse),
}

impl RaftResponse {
    pub fn term(&self) -> Term {
        match self {
            RaftResponse::PreVote(r) => r.term,
            RaftResponse::Vote(r) => r.term,
            RaftResponse::AppendEntries(r) => r.term,
            RaftResponse::InstallSnapshot(r) => r.term,
            RaftResponse::CustomNotification(r) => r.term,
            RaftResponse::Reconnect(r) => r.term,
            RaftResponse::PriorityChange(r) => r.term,
            RaftResponse::ClientWrite(r) => r.term,
        }
    }

    pub fn src(&self) -> ServerId {
        match self {
            RaftResponse::PreVote(r) => r.src,
            RaftResponse::Vote(r) => r.src,
            RaftResponse::AppendEntries(r) => r.src,
            RaftResponse::InstallSnapshot(r) => r.src,
            RaftResponse::CustomNotification(r) => r.src,
            RaftResponse::Reconnect(r) => r.src,
            RaftResponse::PriorityChange(r) => r.src,
            RaftResponse::ClientWrite(r) => r.src,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MessageHeader {
        MessageHeader {
            term: Term::new(3),
            src: ServerId::new(1),
            dst: ServerId::new(2),
            last_log_index: LogIndex::new(10),
            last_log_term: Term::new(3),
            commit_index: LogIndex::new(8),
            meta: None,
        }
    }

    #[test]
    fn force_vote_marker_detection() {
        let plain = VoteRequest {
            header: header(),
            entries: vec![],
        };
        assert!(!plain.is_force_vote());

        let forced = VoteRequest {
            header: header(),
            entries: vec![force_vote_marker_entry()],
        };
        assert!(forced.is_force_vote());
    }

    #[test]
    fn abandoned_marker_is_max_next_index() {
        let resp = PreVoteResponse {
            term: Term::new(3),
            src: ServerId::new(2),
            dst: ServerId::new(1),
            accepted: false,
            next_index: LogIndex::MAX,
        };
        assert!(resp.is_abandoned_marker());

        let live_deny = PreVoteResponse {
            next_index: LogIndex::new(11),
            ..resp
        };
        assert!(!live_deny.is_abandoned_marker());
    }
}
