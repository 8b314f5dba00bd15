//! Module containing errors for the log core.

use thiserror::Error;

/// Errors surfaced by the log core and its [`Storage`](crate::Storage)
/// collaborator.
///
/// Only [`Error::Compacted`] and [`Error::Unavailable`] are recoverable at
/// this layer. The snapshot variants belong to the `Storage` contract; the
/// core treats them, like any storage failure outside the recoverable pair,
/// as fatal when they show up where the contract does not allow them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested index predates the compacted log prefix.
    #[error("requested index is unavailable due to compaction")]
    Compacted,
    /// The requested index is past the last index of the log, or not yet in
    /// storage.
    #[error("requested entry at index is unavailable")]
    Unavailable,
    /// The storage snapshot is older than the one the caller already holds.
    #[error("requested snapshot is out of date")]
    SnapshotOutOfDate,
    /// Storage cannot produce a snapshot right now; the caller may retry.
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,
}
