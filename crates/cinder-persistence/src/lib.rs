//! cinder-persistence: durable state for a single shard.
//!
//! Two file formats, both line-oriented text:
//!
//! - [`aof`] — an append-only command log, flushed after every write,
//!   replayed in order on startup.
//! - [`snapshot`] — a point-in-time dump of the live keyspace, written
//!   atomically via a temp file + rename.
//!
//! Crash recovery loads the snapshot first, then replays the log on
//! top of it; commands already reflected in the snapshot are harmlessly
//! re-applied.

pub mod aof;
mod escape;
pub mod snapshot;

use std::io;

use thiserror::Error;

pub use aof::{AofCommand, AofLog};
pub use snapshot::{RdbSnapshot, SnapshotEntry};

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The snapshot file exists but does not start with the expected
    /// header line.
    #[error("snapshot header mismatch (expected {expected:?}, found {found:?})")]
    BadHeader { expected: &'static str, found: String },
}
