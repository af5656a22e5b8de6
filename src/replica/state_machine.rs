use crate::commitlog::{LogIndex, Term};
use crate::replica::cluster_config::{ClusterConfig, ServerId};
use bytes::{Bytes, BytesMut};
use std::any::Any;

/// Identity and shape of a snapshot: the last log position it covers, the
/// configuration as of that position, and the total serialized size.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub last_config: ClusterConfig,
    pub size_bytes: u64,
}

/// Opaque per-transfer read context owned by the state machine. The engine
/// threads it through consecutive `read_snapshot_chunk` calls and hands it
/// back through `free_snapshot_ctx` when the transfer ends for any reason.
pub type SnapshotUserCtx = Box<dyn Any + Send>;

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("snapshot chunk read failed at offset {offset}: {reason}")]
    SnapshotRead { offset: u64, reason: String },
    #[error("snapshot chunk save failed at offset {offset}: {reason}")]
    SnapshotSave { offset: u64, reason: String },
}

/// StateMachine is the deterministic application the log drives. Entries are
/// fed to `commit` in strict ascending index order with no gaps.
pub trait StateMachine: Send + 'static {
    /// Apply a committed entry. The returned bytes are handed to the client
    /// completion promise for this entry, if one is registered.
    fn commit(&mut self, index: LogIndex, data: &Bytes) -> Bytes;

    /// Speculative notification that `data` was appended at `index` but is
    /// not yet committed. May never be followed by `commit` for this index.
    fn pre_commit(&mut self, _index: LogIndex, _data: &Bytes) {}

    /// An uncommitted entry previously seen by `pre_commit` was overwritten.
    fn rollback(&mut self, _index: LogIndex, _data: &Bytes) {}

    /// The engine decided it is time to take a snapshot (every
    /// `snapshot_distance` applied entries). Implementations capture their
    /// state such that later `read_snapshot_chunk` calls can serve it.
    fn create_snapshot(&mut self, _meta: &SnapshotMeta) {}

    fn save_snapshot_chunk(
        &mut self,
        meta: &SnapshotMeta,
        offset: u64,
        data: &Bytes,
        done: bool,
    ) -> Result<(), StateMachineError>;

    /// Read bytes of the snapshot starting at `offset` into `buf`, returning
    /// the number of bytes produced. `ctx` starts as `None` for a fresh
    /// transfer; the implementation may stash its own cursor state there.
    fn read_snapshot_chunk(
        &mut self,
        meta: &SnapshotMeta,
        ctx: &mut Option<SnapshotUserCtx>,
        offset: u64,
        buf: &mut BytesMut,
    ) -> Result<usize, StateMachineError>;

    /// Release a read context the engine is abandoning (peer removed, idle
    /// timeout, transfer complete).
    fn free_snapshot_ctx(&mut self, _ctx: SnapshotUserCtx) {}

    /// Make the fully received snapshot the state machine's state. Returns
    /// false if the snapshot could not be applied.
    fn apply_snapshot(&mut self, meta: &SnapshotMeta) -> bool;

    fn last_commit_index(&self) -> LogIndex;

    fn last_snapshot(&self) -> Option<SnapshotMeta>;

    /// Back-pressure hint for the leader's batch builder. Positive caps the
    /// next batch's payload bytes, zero disables hinting, negative tells the
    /// leader to stop advancing the commit index entirely until the hint
    /// turns non-negative again.
    fn next_batch_size_hint_in_bytes(&self) -> i64 {
        0
    }

    /// Per-entry override of the commit quorum: when `Some`, the entry at
    /// `index` commits only once every named server has matched it.
    fn custom_committers(&self, _index: LogIndex) -> Option<Vec<ServerId>> {
        None
    }
}

/// A state machine that discards everything. Handy as a placeholder while
/// wiring a group together before the real application exists.
pub struct NoOpStateMachine {
    last_applied: LogIndex,
}

impl NoOpStateMachine {
    pub fn new() -> Self {
        NoOpStateMachine {
            last_applied: LogIndex::ZERO,
        }
    }
}

impl Default for NoOpStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for NoOpStateMachine {
    fn commit(&mut self, index: LogIndex, _data: &Bytes) -> Bytes {
        self.last_applied = index;
        Bytes::new()
    }

    fn save_snapshot_chunk(
        &mut self,
        _meta: &SnapshotMeta,
        _offset: u64,
        _data: &Bytes,
        _done: bool,
    ) -> Result<(), StateMachineError> {
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
        true
    }

    fn last_commit_index(&self) -> LogIndex {
        self.last_applied
    }

    fn last_snapshot(&self) -> Option<SnapshotMeta> {
        None
    }
}
