mod api;
mod in_memory;

pub use api::EntryKind;
pub use api::FlushDone;
pub use api::LogEntry;
pub use api::LogIndex;
pub use api::LogStore;
pub use api::LogStoreError;
pub use api::Term;
pub use in_memory::InMemoryLogStore;
