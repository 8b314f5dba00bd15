//! Module containing the contract assumed of durable log storage.

use crate::entry::{Entry, Index, Snapshot, Term};
use crate::error::Error;

/// Read-only view of the durably persisted log prefix and the latest applied
/// snapshot.
///
/// Implementations own their retry, timeout, and backoff policy. The core
/// treats any error outside the kinds a method documents as a fatal bug, not
/// an I/O failure to be retried.
pub trait Storage {
    /// 1 + the last index covered by the most recent applied snapshot.
    /// Entries below this are compacted away.
    fn first_index(&self) -> Result<Index, Error>;

    /// The largest index durably stored.
    fn last_index(&self) -> Result<Index, Error>;

    /// Term of the entry at `index`.
    ///
    /// Valid for `first_index() - 1 <= index <= last_index()`. The entry at
    /// `first_index() - 1` is compacted away, but its term is retained for
    /// log matching. Fails with [`Error::Compacted`] below that bound and
    /// [`Error::Unavailable`] above `last_index()`.
    fn term(&self, index: Index) -> Result<Term, Error>;

    /// Entries in `[lo, hi)`, clipped to `max_size` bytes of payload. At
    /// least one entry is returned when the range is non-empty, even if the
    /// first entry alone exceeds the budget.
    fn entries(&self, lo: Index, hi: Index, max_size: u64) -> Result<Vec<Entry>, Error>;

    /// The latest snapshot. May fail with
    /// [`Error::SnapshotTemporarilyUnavailable`] while one is being
    /// generated.
    fn snapshot(&self) -> Result<Snapshot, Error>;
}
