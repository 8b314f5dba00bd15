//! Module containing the in-memory tail of the log.


use tracing::info;

use crate::entry::{Entry, Index, Snapshot, Term};

/// Entries and at most one snapshot staged in memory, not yet known durable.
///
/// `entries[i]` holds log position `offset + i`. `offset` may be at or below
/// the stable log's last index; the next persistence pass then has to
/// truncate the stable log before writing. Entries in
/// `[offset, offset_in_progress)`, and the snapshot once
/// `snapshot_in_progress` is set, have already been handed off for
/// persistence and must not be handed off again.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub(crate) struct Unstable {
    /// The incoming snapshot, if any, waiting to be persisted.
    pub(crate) snapshot: Option<Snapshot>,
    /// All entries that have not yet been acknowledged as durable.
    pub(crate) entries: Vec<Entry>,
    /// Log position of `entries[0]`; where the next append lands when
    /// `entries` is empty.
    pub(crate) offset: Index,
    /// Boundary between entries handed off for persistence and entries
    /// appended since the last handoff. Invariant:
    /// `offset <= offset_in_progress <= offset + entries.len()`.
    pub(crate) offset_in_progress: Index,
    /// Set once `snapshot` has been handed off for persistence.
    pub(crate) snapshot_in_progress: bool,
}

impl Unstable {
    pub(crate) fn new(offset: Index) -> Self {
        Self {
            snapshot: None,
            entries: Vec::new(),
            offset,
            offset_in_progress: offset,
            snapshot_in_progress: false,
        }
    }

    /// The index the log starts at, if a pending snapshot determines it.
    pub(crate) fn maybe_first_index(&self) -> Option<Index> {
        self.snapshot.as_ref().map(|snapshot| snapshot.index + 1)
    }

    /// The last index across entries and snapshot, if either is present.
    pub(crate) fn maybe_last_index(&self) -> Option<Index> {
        match self.entries.len() {
            0 => self.snapshot.as_ref().map(|snapshot| snapshot.index),
            len => Some(self.offset + len as u64 - 1),
        }
    }

    /// The term of the entry at `index`, if the buffer covers it.
    pub(crate) fn maybe_term(&self, index: Index) -> Option<Term> {
        if index < self.offset {
            let snapshot = self.snapshot.as_ref()?;
            return (snapshot.index == index).then_some(snapshot.term);
        }
        let last = self.maybe_last_index()?;
        (index <= last).then(|| self.entries[(index - self.offset) as usize].term)
    }

    /// Entries not yet handed off for persistence. May be empty.
    pub(crate) fn next_entries(&self) -> &[Entry] {
        let in_progress = (self.offset_in_progress - self.offset) as usize;
        &self.entries[in_progress..]
    }

    /// The pending snapshot, unless it has already been handed off.
    pub(crate) fn next_snapshot(&self) -> Option<&Snapshot> {
        if self.snapshot_in_progress {
            return None;
        }
        self.snapshot.as_ref()
    }

    /// Marks everything currently staged as handed off for persistence.
    pub(crate) fn accept_in_progress(&mut self) {
        self.offset_in_progress = self.offset + self.entries.len() as u64;
        self.snapshot_in_progress = self.snapshot.is_some();
    }

    /// Releases entries up through `index`, provided the buffered entry
    /// there still carries `term`. A mismatch means a truncation replaced
    /// the acknowledged entries during a leader change, so the
    /// acknowledgement no longer refers to what is buffered.
    pub(crate) fn stable_to(&mut self, index: Index, term: Term) {
        if index < self.offset || index >= self.offset + self.entries.len() as u64 {
            info!(index, "entry missing from unstable log; ignoring acknowledgement");
            return;
        }
        let buffered = self.entries[(index - self.offset) as usize].term;
        if buffered != term {
            info!(
                index,
                term, buffered, "term mismatch in unstable log; ignoring acknowledgement",
            );
            return;
        }
        if let Some(snapshot) = &self.snapshot
            && index >= snapshot.index
        {
            self.snapshot = None;
            self.snapshot_in_progress = false;
        }
        self.entries.drain(..=(index - self.offset) as usize);
        self.offset = index + 1;
        self.offset_in_progress = self.offset_in_progress.max(self.offset);
        self.maybe_shrink();
    }

    /// Drops the pending snapshot once it is acknowledged as persisted.
    pub(crate) fn stable_snap_to(&mut self, index: Index) {
        if let Some(snapshot) = &self.snapshot
            && snapshot.index == index
        {
            self.snapshot = None;
            self.snapshot_in_progress = false;
        }
    }

    /// Replaces the whole buffer with a single pending snapshot.
    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.entries = Vec::new();
        self.offset = snapshot.index + 1;
        self.offset_in_progress = self.offset;
        self.snapshot = Some(snapshot);
        self.snapshot_in_progress = false;
    }

    /// Appends `ents`, truncating any buffered suffix they overlap with.
    /// Entry indices must be consecutive, and `ents` non-empty.
    pub(crate) fn truncate_and_append(&mut self, mut ents: Vec<Entry>) {
        let after = ents[0].index;
        if after == self.offset + self.entries.len() as u64 {
            // Directly after the buffered entries; extend.
            self.entries.append(&mut ents);
        } else if after <= self.offset {
            // The log is truncated to before the buffered portion; replace
            // it wholesale.
            self.offset = after;
            self.offset_in_progress = self.offset_in_progress.min(after);
            self.entries = ents;
        } else {
            // Keep [offset, after), replace everything from there on.
            self.must_check_out_of_bounds(self.offset, after);
            self.entries.truncate((after - self.offset) as usize);
            self.entries.append(&mut ents);
            self.offset_in_progress = self.offset_in_progress.min(after);
        }
    }

    /// Entries in `[lo, hi)`. The range must lie entirely inside the buffer.
    pub(crate) fn slice(&self, lo: Index, hi: Index) -> &[Entry] {
        self.must_check_out_of_bounds(lo, hi);
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }

    fn must_check_out_of_bounds(&self, lo: Index, hi: Index) {
        assert!(lo <= hi, "invalid unstable slice {lo} > {hi}");
        let upper = self.offset + self.entries.len() as u64;
        assert!(
            lo >= self.offset && hi <= upper,
            "unstable slice [{lo}, {hi}) out of bound [{}, {upper})",
            self.offset,
        );
    }

    /// Releases excess buffer capacity once less than half of it is live.
    fn maybe_shrink(&mut self) {
        if self.entries.is_empty() {
            self.entries = Vec::new();
        } else if self.entries.len() * 2 < self.entries.capacity() {
            self.entries.shrink_to_fit();
        }
    }
}
