use bytes::Bytes;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Term is the election epoch. It only ever moves forward; observing a higher
/// term from any peer forces adoption of that term.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// LogIndex is a 1-based, dense index of an entry in the replicated log.
/// Index 0 is the "before any entry" sentinel, never an addressable slot.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);
    pub const MAX: LogIndex = LogIndex(u64::MAX);

    pub fn new(index: u64) -> Self {
        LogIndex(index)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }

    pub fn plus(self, n: u64) -> LogIndex {
        LogIndex(self.0 + n)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a log entry's payload means to the engine. Payloads are opaque bytes
/// at this layer; configuration and custom entries carry their own encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryKind {
    Application,
    Configuration,
    SnapshotMarker,
    Custom,
}

/// A single replicated log entry. `(index, term)` uniquely identifies an
/// entry within a group's history; the index is implied by the entry's slot.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Bytes,
    pub timestamp_us: u64,
}

impl LogEntry {
    pub fn new(term: Term, kind: EntryKind, payload: Bytes) -> Self {
        LogEntry {
            term,
            kind,
            payload,
            timestamp_us: now_us(),
        }
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
pub enum LogStoreError {
    #[error("log index {0} is out of range [{1}, {2})")]
    OutOfRange(LogIndex, LogIndex, LogIndex),
    #[error("log store I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Invoked when a requested flush completes, possibly from another thread.
pub type FlushDone = Box<dyn FnOnce(Result<LogIndex, LogStoreError>) + Send + 'static>;

/// LogStore is the persistent log contract. All indices are 1-based and
/// dense. Entries become *visible* on append and *durable* on flush; the two
/// are allowed to diverge so the engine can replicate ahead of local disk.
pub trait LogStore: Send + 'static {
    /// First index still held by the store. Greater than 1 once compacted.
    fn start_index(&self) -> LogIndex;

    /// The index that the next appended entry will occupy.
    fn next_slot(&self) -> LogIndex;

    /// Append at `next_slot()`, returning the index used.
    fn append(&mut self, entry: LogEntry) -> Result<LogIndex, LogStoreError>;

    /// Overwrite the entry at `index` and discard everything after it.
    fn write_at(&mut self, index: LogIndex, entry: LogEntry) -> Result<(), LogStoreError>;

    fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>, LogStoreError>;

    /// Entries in `[from, to_exclusive)`, clamped to what the store holds.
    fn entries(&self, from: LogIndex, to_exclusive: LogIndex) -> Result<Vec<LogEntry>, LogStoreError>;

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>, LogStoreError>;

    /// Highest index known to have reached durable storage.
    fn last_durable_index(&self) -> LogIndex;

    /// Synchronous durability barrier covering everything appended so far.
    fn flush(&mut self) -> Result<LogIndex, LogStoreError>;

    /// Asynchronous durability: `done` fires once everything up to `up_to`
    /// is durable. Must not block the caller.
    fn request_flush(&mut self, up_to: LogIndex, done: FlushDone);

    /// Drop entries at and below `up_to`. The store's `start_index` becomes
    /// `up_to + 1`.
    fn compact(&mut self, up_to: LogIndex) -> Result<(), LogStoreError>;
}
