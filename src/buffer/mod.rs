//! Crash-resistant session buffer.
//!
//! Each open session has one append-only log of self-contained JSON lines
//! (`session_start`, `measurement`, `session_end`). The log is written before
//! the relational insert and is the durability guarantee; the store is only
//! the queryable copy. On startup [`recovery::recover`] replays whatever an
//! earlier run left behind.

pub mod record;
pub mod recovery;
pub mod writer;

pub use record::{BufferRecord, MeasurementRecord, SessionEndRecord, SessionStartRecord};
pub use recovery::{recover, RecoveredFile, RecoveryOutcome, RecoveryReport};
pub use writer::{buffer_path, BufferPolicy, SessionBuffer};
