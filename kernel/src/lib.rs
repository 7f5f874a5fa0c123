// Seqfold Kernel
//
// Keyed structures folded from a shared append-only log, with a
// compaction protocol that bounds how far back replay must scan.

pub mod config;
pub mod invariants;
pub mod log;
pub mod replay;
pub mod squeeze;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::LogConfig;
pub use log::{FileLogStore, LogStore, MemoryLogStore, Sequence};
pub use store::{Record, RecordStore, SetStore, StoreError};
