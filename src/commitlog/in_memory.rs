use crate::commitlog::{FlushDone, LogEntry, LogIndex, LogStore, LogStoreError, Term};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// In-memory log store. Durability is modeled rather than real: appended
/// entries become durable only when flushed, and a configurable flush delay
/// stands in for a slow disk so the replicate-before-durable path can be
/// exercised.
///
/// The store is a cheap handle over shared state; clones see the same log.
/// A "restarted" server is handed a clone of the store it ran on before,
/// the same way a real server reopens its log directory.
#[derive(Clone)]
pub struct InMemoryLogStore {
    inner: Arc<Mutex<LogStoreInner>>,
}

struct LogStoreInner {
    start_index: LogIndex,
    entries: VecDeque<LogEntry>,
    durable_index: LogIndex,
    flush_delay: Duration,
}

impl LogStoreInner {
    fn next_slot(&self) -> LogIndex {
        self.start_index.plus(self.entries.len() as u64)
    }

    fn last_index(&self) -> LogIndex {
        self.next_slot().prev()
    }

    fn slot_of(&self, index: LogIndex) -> Option<usize> {
        if index < self.start_index || index >= self.next_slot() {
            return None;
        }
        Some((index.as_u64() - self.start_index.as_u64()) as usize)
    }

    fn mark_durable(&mut self, up_to: LogIndex) {
        // Ratchet only; a flush completion never regresses durability.
        if up_to > self.durable_index {
            self.durable_index = up_to;
        }
    }
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::with_flush_delay(Duration::ZERO)
    }

    pub fn with_flush_delay(flush_delay: Duration) -> Self {
        InMemoryLogStore {
            inner: Arc::new(Mutex::new(LogStoreInner {
                start_index: LogIndex::new(1),
                entries: VecDeque::new(),
                durable_index: LogIndex::ZERO,
                flush_delay,
            })),
        }
    }

    pub fn set_flush_delay(&self, flush_delay: Duration) {
        self.inner.lock().expect("log store lock").flush_delay = flush_delay;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogStoreInner> {
        self.inner.lock().expect("log store lock")
    }
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for InMemoryLogStore {
    fn start_index(&self) -> LogIndex {
        self.lock().start_index
    }

    fn next_slot(&self) -> LogIndex {
        self.lock().next_slot()
    }

    fn append(&mut self, entry: LogEntry) -> Result<LogIndex, LogStoreError> {
        let mut inner = self.lock();
        let index = inner.next_slot();
        inner.entries.push_back(entry);
        Ok(index)
    }

    fn write_at(&mut self, index: LogIndex, entry: LogEntry) -> Result<(), LogStoreError> {
        let mut inner = self.lock();
        // Overwriting is only legal within [start, next_slot].
        if index < inner.start_index || index > inner.next_slot() {
            return Err(LogStoreError::OutOfRange(index, inner.start_index, inner.next_slot()));
        }
        let slot = (index.as_u64() - inner.start_index.as_u64()) as usize;
        inner.entries.truncate(slot);
        inner.entries.push_back(entry);
        // Anything at or past the overwritten slot is no longer durable.
        if inner.durable_index >= index {
            inner.durable_index = index.prev();
        }
        Ok(())
    }

    fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>, LogStoreError> {
        let inner = self.lock();
        Ok(inner.slot_of(index).map(|slot| inner.entries[slot].clone()))
    }

    fn entries(&self, from: LogIndex, to_exclusive: LogIndex) -> Result<Vec<LogEntry>, LogStoreError> {
        let inner = self.lock();
        let from = from.max(inner.start_index);
        let to_exclusive = to_exclusive.min(inner.next_slot());
        let mut out = Vec::new();
        let mut index = from;
        while index < to_exclusive {
            // Range is clamped, slot_of cannot miss.
            let slot = inner.slot_of(index).expect("clamped range");
            out.push(inner.entries[slot].clone());
            index = index.next();
        }
        Ok(out)
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>, LogStoreError> {
        let inner = self.lock();
        Ok(inner.slot_of(index).map(|slot| inner.entries[slot].term))
    }

    fn last_durable_index(&self) -> LogIndex {
        self.lock().durable_index
    }

    fn flush(&mut self) -> Result<LogIndex, LogStoreError> {
        let mut inner = self.lock();
        let last = inner.last_index();
        inner.mark_durable(last);
        Ok(last)
    }

    fn request_flush(&mut self, up_to: LogIndex, done: FlushDone) {
        let (up_to, delay) = {
            let inner = self.lock();
            (up_to.min(inner.last_index()), inner.flush_delay)
        };
        if delay.is_zero() {
            self.lock().mark_durable(up_to);
            done(Ok(up_to));
            return;
        }

        let store = self.clone();
        tokio::task::spawn(async move {
            tokio::time::sleep(delay).await;
            store.lock().mark_durable(up_to);
            done(Ok(up_to));
        });
    }

    fn compact(&mut self, up_to: LogIndex) -> Result<(), LogStoreError> {
        let mut inner = self.lock();
        while inner.start_index <= up_to && !inner.entries.is_empty() {
            inner.entries.pop_front();
            inner.start_index = inner.start_index.next();
        }
        if inner.start_index <= up_to {
            // Compaction point is past everything we hold (snapshot
            // install); the log restarts right after it.
            inner.start_index = up_to.next();
        }
        // Everything at or below the compaction point is snapshot-covered,
        // hence durable by definition.
        inner.mark_durable(up_to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::EntryKind;
    use bytes::Bytes;

    fn entry(term: u64) -> LogEntry {
        LogEntry::new(Term::new(term), EntryKind::Application, Bytes::from_static(b"x"))
    }

    #[test]
    fn append_and_read_back() {
        let mut store = InMemoryLogStore::new();
        assert_eq!(store.start_index(), LogIndex::new(1));
        assert_eq!(store.next_slot(), LogIndex::new(1));

        let i1 = store.append(entry(1)).unwrap();
        let i2 = store.append(entry(1)).unwrap();
        assert_eq!(i1, LogIndex::new(1));
        assert_eq!(i2, LogIndex::new(2));
        assert_eq!(store.next_slot(), LogIndex::new(3));

        assert_eq!(store.term_at(LogIndex::new(2)).unwrap(), Some(Term::new(1)));
        assert_eq!(store.term_at(LogIndex::new(3)).unwrap(), None);
        assert!(store.entry_at(LogIndex::new(1)).unwrap().is_some());
    }

    #[test]
    fn clones_share_the_log() {
        let mut store = InMemoryLogStore::new();
        let reopened = store.clone();
        store.append(entry(1)).unwrap();
        assert_eq!(reopened.next_slot(), LogIndex::new(2));
    }

    #[test]
    fn write_at_truncates_suffix_and_durability() {
        let mut store = InMemoryLogStore::new();
        for _ in 0..5 {
            store.append(entry(1)).unwrap();
        }
        store.flush().unwrap();
        assert_eq!(store.last_durable_index(), LogIndex::new(5));

        store.write_at(LogIndex::new(3), entry(2)).unwrap();
        assert_eq!(store.next_slot(), LogIndex::new(4));
        assert_eq!(store.term_at(LogIndex::new(3)).unwrap(), Some(Term::new(2)));
        assert_eq!(store.last_durable_index(), LogIndex::new(2));
    }

    #[test]
    fn compact_advances_start_index() {
        let mut store = InMemoryLogStore::new();
        for _ in 0..10 {
            store.append(entry(1)).unwrap();
        }
        store.compact(LogIndex::new(7)).unwrap();
        assert_eq!(store.start_index(), LogIndex::new(8));
        assert_eq!(store.next_slot(), LogIndex::new(11));
        assert!(store.entry_at(LogIndex::new(7)).unwrap().is_none());
        assert!(store.entry_at(LogIndex::new(8)).unwrap().is_some());
    }

    #[test]
    fn compact_past_the_end_resets_the_log() {
        let mut store = InMemoryLogStore::new();
        store.append(entry(1)).unwrap();
        store.compact(LogIndex::new(100)).unwrap();
        assert_eq!(store.start_index(), LogIndex::new(101));
        assert_eq!(store.next_slot(), LogIndex::new(101));
        assert_eq!(store.last_durable_index(), LogIndex::new(100));
    }

    #[tokio::test]
    async fn delayed_flush_reports_later() {
        let mut store = InMemoryLogStore::with_flush_delay(Duration::from_millis(20));
        store.append(entry(1)).unwrap();
        store.append(entry(1)).unwrap();
        assert_eq!(store.last_durable_index(), LogIndex::ZERO);

        let (tx, rx) = tokio::sync::oneshot::channel();
        store.request_flush(
            LogIndex::new(2),
            Box::new(move |result| {
                let _ = tx.send(result.unwrap());
            }),
        );
        assert_eq!(store.last_durable_index(), LogIndex::ZERO);

        let durable = rx.await.unwrap();
        assert_eq!(durable, LogIndex::new(2));
        assert_eq!(store.last_durable_index(), LogIndex::new(2));
    }
}
