//! Module containing the log core of a Raft consensus group.


use std::fmt;

use derivative::Derivative;
use tracing::info;

use crate::entry::{Entry, Index, NO_LIMIT, Snapshot, Term, ents_size, limit_size};
use crate::error::Error;
use crate::storage::Storage;
use crate::unstable::Unstable;

/// The logical log of a single Raft group: the stable prefix held in
/// [`Storage`] joined with the in-memory [`Unstable`] tail, plus the commit
/// and apply cursors and the apply-window gating between them.
///
/// All mutations happen from the group's single-threaded driver loop; the
/// structure takes no locks of its own.
#[derive(Derivative, Clone)]
#[derivative(Debug, PartialEq, Eq)]
pub struct RaftLog<S: Storage> {
    /// All stable entries since the last snapshot.
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    storage: S,

    /// Entries and snapshot staged in memory, waiting to be persisted.
    unstable: Unstable,

    /// Term of the leader with whom this log is consistent. Per Log Matching
    /// (§5.3), once an append sent by leader `t` succeeds, this log is a
    /// prefix of leader `t`'s log.
    ///
    /// This is not the node's current term. During a leader change it lags
    /// behind, and catches up when the first append from the new leader
    /// succeeds. Until then there is no proof of consistency with the new
    /// term's leader, who may overwrite any suffix above the committed
    /// index.
    leader_term: Term,

    /// Highest position known to be durable on a quorum of nodes.
    committed: Index,
    /// Highest position handed to the application for apply. Entries in
    /// `(applied, applying]` may still be in flight.
    /// Invariant: `applied <= applying <= committed`.
    applying: Index,
    /// Highest position the application has reported applied.
    applied: Index,

    /// Byte budget for entries delivered by `next_committed_ents` and not
    /// yet acknowledged through `applied_to`.
    max_applying_ents_size: u64,
    /// Outstanding delivered-but-unacknowledged byte size.
    applying_ents_size: u64,
    /// True while delivery is paused waiting for apply progress.
    applying_ents_paused: bool,
}

impl<S: Storage> RaftLog<S> {
    /// Creates a log positioned at the state `storage` holds, with no limit
    /// on the apply window.
    pub fn new(storage: S) -> Self {
        Self::with_max_applying_size(storage, NO_LIMIT)
    }

    /// Creates a log with a byte budget for committed entries outstanding
    /// with the application.
    ///
    /// Panics if `storage` fails to report its first/last index or last
    /// term.
    pub fn with_max_applying_size(storage: S, max_applying_ents_size: u64) -> Self {
        let first_index = storage.first_index().expect("storage first index");
        let last_index = storage.last_index().expect("storage last index");
        let last_term = storage.term(last_index).expect("storage last term");
        Self {
            storage,
            unstable: Unstable::new(last_index + 1),
            leader_term: last_term,
            // Both cursors start at the point of the last compaction.
            committed: first_index - 1,
            applying: first_index - 1,
            applied: first_index - 1,
            max_applying_ents_size,
            applying_ents_size: 0,
            applying_ents_paused: false,
        }
    }

    /// Appends entries received from the leader at `leader_term`, after
    /// verifying the log holds an entry matching `(prev_index, prev_term)`.
    ///
    /// Returns the index of the last new entry if the append is accepted,
    /// and `None` if the leader is stale or the log does not match. On
    /// acceptance any conflicting suffix has been replaced, and `committed`
    /// advanced to `min(committed, prev_index + ents.len())`.
    ///
    /// Panics if the entries conflict below the committed index: a
    /// committed entry must never be overwritten (§5.4).
    pub fn maybe_append(
        &mut self,
        leader_term: Term,
        prev_index: Index,
        prev_term: Term,
        committed: Index,
        mut ents: Vec<Entry>,
    ) -> Option<Index> {
        // Cannot accept append requests from an outdated leader.
        if leader_term < self.leader_term {
            return None;
        }
        // Nor appends that are not consistent with our log. When
        // `leader_term == self.leader_term` the leader always sends
        // self-consistent appends, so the match only gates safety for
        // `leader_term > self.leader_term`.
        if !self.match_term(prev_index, prev_term) {
            return None;
        }

        let last_new = prev_index + ents.len() as u64;
        let conflict = self.find_conflict(&ents);
        if conflict != 0 {
            assert!(
                conflict > self.committed,
                "entry {conflict} conflicts with committed entry [committed({})]",
                self.committed,
            );
            let keep = (conflict - (prev_index + 1)) as usize;
            assert!(
                keep <= ents.len(),
                "index {keep} is out of range [{}]",
                ents.len(),
            );
            ents.drain(..keep);
            self.append(leader_term, ents);
        }
        self.commit_to(leader_term, committed.min(last_new));
        Some(last_new)
    }

    /// Appends entries produced by the leader at `leader_term`, returning
    /// the new last index. Stale-leader appends leave the log untouched.
    ///
    /// Panics if the entries would overwrite the committed prefix, or carry
    /// a term above `leader_term`.
    pub fn append(&mut self, leader_term: Term, ents: Vec<Entry>) -> Index {
        // Cannot accept append requests from an outdated leader.
        if leader_term < self.leader_term {
            return self.last_index();
        }
        if ents.is_empty() {
            return self.last_index();
        }
        let after = ents[0].index - 1;
        assert!(
            after >= self.committed,
            "after({after}) is out of range [committed({})]",
            self.committed,
        );
        // INVARIANT: term(i) <= leader_term for every entry in the log.
        let last_term = ents[ents.len() - 1].term;
        assert!(
            last_term <= leader_term,
            "leader at term {leader_term} tries to append a higher term {last_term}",
        );
        self.leader_term = leader_term; // never regresses, per the first guard

        self.unstable.truncate_and_append(ents);
        self.last_index()
    }

    /// The index of the first given entry that conflicts with (same index,
    /// different term) or extends the existing log, or 0 when the log
    /// already contains every given entry. The given indices must be
    /// consecutive.
    fn find_conflict(&self, ents: &[Entry]) -> Index {
        for ent in ents {
            if !self.match_term(ent.index, ent.term) {
                if ent.index <= self.last_index() {
                    info!(
                        index = ent.index,
                        existing_term = self.zero_term_on_out_of_bounds(self.term(ent.index)),
                        conflicting_term = ent.term,
                        "found conflict",
                    );
                }
                return ent.index;
            }
        }
        0
    }

    /// A decrement hint for resolving a failed append, given the
    /// `(index, term)` of a single entry of the other log: the largest
    /// `guess <= index` such that `term(guess) <= term` or `term(guess)` is
    /// unknown (compacted or not yet stored), together with that term (0
    /// when unknown).
    ///
    /// Lets leader and follower close in on the last common entry without
    /// probing one index at a time.
    pub fn find_conflict_by_term(&self, index: Index, term: Term) -> (Index, Term) {
        let mut guess = index;
        while guess > 0 {
            match self.term(guess) {
                // Unknown whether this is a match; assume it may be.
                Err(_) => return (guess, 0),
                Ok(our_term) if our_term <= term => return (guess, our_term),
                Ok(_) => guess -= 1,
            }
        }
        (0, 0)
    }

    /// Entries ready to be written to the stable log and not already handed
    /// off.
    pub fn next_unstable_ents(&self) -> &[Entry] {
        self.unstable.next_entries()
    }

    pub fn has_next_unstable_ents(&self) -> bool {
        !self.next_unstable_ents().is_empty()
    }

    /// Whether any unstable entries exist, handed off for persistence or
    /// not.
    pub fn has_next_or_in_progress_unstable_ents(&self) -> bool {
        !self.unstable.entries.is_empty()
    }

    /// Committed entries ready for the application, clipped to the
    /// remaining apply-window budget.
    ///
    /// Returns nothing while delivery is paused on the budget, or while a
    /// snapshot is staged: the application must apply the snapshot on its
    /// own before receiving any entries.
    ///
    /// Committed entries need not be durable locally yet; `allow_unstable`
    /// controls whether entries still in the unstable log may be returned.
    pub fn next_committed_ents(&self, allow_unstable: bool) -> Vec<Entry> {
        if self.applying_ents_paused || self.has_next_or_in_progress_snapshot() {
            return Vec::new();
        }
        let (lo, hi) = (self.applying + 1, self.max_appliable_index(allow_unstable) + 1);
        if lo >= hi {
            // Nothing to apply.
            return Vec::new();
        }
        assert!(
            self.applying_ents_size < self.max_applying_ents_size,
            "applying entry size ({} - {}) not positive",
            self.max_applying_ents_size,
            self.applying_ents_size,
        );
        let max_size = self.max_applying_ents_size - self.applying_ents_size;
        match self.slice(lo, hi, max_size) {
            Ok(ents) => ents,
            Err(err) => panic!("unexpected error when getting unapplied entries: {err}"),
        }
    }

    /// Fast check for [`Self::next_committed_ents`] that skips the slicing.
    pub fn has_next_committed_ents(&self, allow_unstable: bool) -> bool {
        if self.applying_ents_paused || self.has_next_or_in_progress_snapshot() {
            return false;
        }
        self.applying < self.max_appliable_index(allow_unstable)
    }

    /// The maximum committed index the application may currently be handed.
    fn max_appliable_index(&self, allow_unstable: bool) -> Index {
        let mut hi = self.committed;
        if !allow_unstable {
            hi = hi.min(self.unstable.offset - 1);
        }
        hi
    }

    /// The staged snapshot ready to be written to local storage, if one
    /// exists and has not been handed off yet.
    pub fn next_unstable_snapshot(&self) -> Option<&Snapshot> {
        self.unstable.next_snapshot()
    }

    pub fn has_next_unstable_snapshot(&self) -> bool {
        self.unstable.next_snapshot().is_some()
    }

    /// Whether a snapshot is staged, handed off or not. While this holds,
    /// no committed entries are delivered.
    fn has_next_or_in_progress_snapshot(&self) -> bool {
        self.unstable.snapshot.is_some()
    }

    /// The latest snapshot: the staged one if present, otherwise whatever
    /// storage holds.
    pub fn snapshot(&self) -> Result<Snapshot, Error> {
        if let Some(snapshot) = &self.unstable.snapshot {
            return Ok(snapshot.clone());
        }
        self.storage.snapshot()
    }

    pub fn first_index(&self) -> Index {
        if let Some(index) = self.unstable.maybe_first_index() {
            return index;
        }
        self.storage.first_index().expect("storage first index")
    }

    pub fn last_index(&self) -> Index {
        if let Some(index) = self.unstable.maybe_last_index() {
            return index;
        }
        self.storage.last_index().expect("storage last index")
    }

    /// Advances the committed cursor to `to_commit`, clipped to the last
    /// index.
    ///
    /// Ignored unless `leader_term` is the term this log is known
    /// consistent with: only then is the log a prefix of that leader's log,
    /// making every position up to `min(to_commit, last_index)` safe to
    /// commit without re-checking terms.
    pub fn commit_to(&mut self, leader_term: Term, to_commit: Index) {
        if leader_term != self.leader_term {
            return;
        }
        let to_commit = to_commit.min(self.last_index());
        if to_commit > self.committed {
            self.committed = to_commit;
        }
    }

    /// Advances the committed cursor when a quorum is known to match
    /// `max_index` at entry term `term`. Returns whether it advanced.
    ///
    /// `term` is never 0 on a real commit, because leaders campaign at term
    /// 1 or above; a zero term must not count as a match when the entry
    /// term reads as 0 for being out of bounds.
    pub fn maybe_commit(&mut self, leader_term: Term, max_index: Index, term: Term) -> bool {
        if max_index > self.committed
            && term != 0
            && self.zero_term_on_out_of_bounds(self.term(max_index)) == term
        {
            self.commit_to(leader_term, max_index);
            return true;
        }
        false
    }

    /// Records that the application has applied up to `index`, releasing
    /// `size` bytes of the apply window.
    ///
    /// Panics if `index` is outside `[applied, committed]`.
    pub fn applied_to(&mut self, index: Index, size: u64) {
        assert!(
            self.applied <= index && index <= self.committed,
            "applied({index}) is out of range [prev_applied({}), committed({})]",
            self.applied,
            self.committed,
        );
        self.applied = index;
        self.applying = self.applying.max(index);
        self.applying_ents_size = self.applying_ents_size.saturating_sub(size);
        self.applying_ents_paused = self.applying_ents_size >= self.max_applying_ents_size;
    }

    /// Records that entries up to `index`, totalling `size` bytes, have
    /// been handed to the application.
    ///
    /// Delivery pauses when the outstanding size reaches the budget, or
    /// when `index` stops short of the appliable range: the last delivery
    /// was then truncated, meaning the next entry alone would have pushed
    /// past the budget.
    ///
    /// Panics if `index` is above the committed cursor.
    pub fn accept_applying(&mut self, index: Index, size: u64, allow_unstable: bool) {
        assert!(
            index <= self.committed,
            "applying({index}) is out of range [prev_applying({}), committed({})]",
            self.applying,
            self.committed,
        );
        self.applying = index;
        self.applying_ents_size += size;
        self.applying_ents_paused = self.applying_ents_size >= self.max_applying_ents_size
            || index < self.max_appliable_index(allow_unstable);
    }

    /// Acknowledges that entries up through `index` at `term` are durable,
    /// releasing them from the unstable buffer.
    pub fn stable_to(&mut self, index: Index, term: Term) {
        self.unstable.stable_to(index, term);
    }

    /// Acknowledges that the staged snapshot at `index` is durable.
    pub fn stable_snap_to(&mut self, index: Index) {
        self.unstable.stable_snap_to(index);
    }

    /// Marks the current unstable entries and snapshot as handed off for
    /// persistence, so later calls do not return them again.
    pub fn accept_unstable(&mut self) {
        self.unstable.accept_in_progress();
    }

    pub fn last_term(&self) -> Term {
        match self.term(self.last_index()) {
            Ok(term) => term,
            Err(err) => panic!("unexpected error when getting the last term: {err}"),
        }
    }

    /// Term of the entry at `index`.
    ///
    /// The valid range is `[first_index - 1, last_index]`: the entry at
    /// `first_index - 1` is compacted away, but its term remains available
    /// for log matching. Fails with [`Error::Compacted`] below the range
    /// and [`Error::Unavailable`] above it.
    pub fn term(&self, index: Index) -> Result<Term, Error> {
        // Check the unstable log first, even before computing the valid
        // range, which may need to access stable storage. A hit there
        // proves the index is in the valid range.
        if let Some(term) = self.unstable.maybe_term(index) {
            return Ok(term);
        }
        if index + 1 < self.first_index() {
            return Err(Error::Compacted);
        }
        if index > self.last_index() {
            return Err(Error::Unavailable);
        }
        match self.storage.term(index) {
            Ok(term) => Ok(term),
            Err(err @ (Error::Compacted | Error::Unavailable)) => Err(err),
            Err(err) => panic!("unexpected storage error: {err}"),
        }
    }

    /// Entries from `index` through the end of the log, clipped to
    /// `max_size` bytes.
    pub fn entries(&self, index: Index, max_size: u64) -> Result<Vec<Entry>, Error> {
        if index > self.last_index() {
            return Ok(Vec::new());
        }
        self.slice(index, self.last_index() + 1, max_size)
    }

    /// Every entry in the log. Retries on [`Error::Compacted`] to absorb a
    /// racing compaction of the stable log.
    pub fn all_entries(&self) -> Vec<Entry> {
        loop {
            match self.entries(self.first_index(), NO_LIMIT) {
                Ok(ents) => return ents,
                Err(Error::Compacted) => continue,
                Err(err) => panic!("unexpected error when getting all entries: {err}"),
            }
        }
    }

    /// Whether a log ending at `(last_index, term)` is at least as
    /// up-to-date as this one: a later last term wins, and equal last terms
    /// fall back to comparing last indices (§5.4.1). Used by vote logic.
    pub fn is_up_to_date(&self, last_index: Index, term: Term) -> bool {
        term > self.last_term() || (term == self.last_term() && last_index >= self.last_index())
    }

    /// Whether the entry at `index` carries `term`.
    pub fn match_term(&self, index: Index, term: Term) -> bool {
        self.term(index).map(|t| t == term).unwrap_or(false)
    }

    /// Replaces the log with the given snapshot: `committed` moves to the
    /// snapshot index and all entries are logically discarded.
    ///
    /// The apply cursors are untouched; the driver signals snapshot
    /// application separately through [`Self::accept_applying`] once the
    /// snapshot has been handed to the application.
    pub fn restore(&mut self, snapshot: Snapshot) {
        info!(
            log = %self,
            index = snapshot.index,
            term = snapshot.term,
            "starting to restore snapshot",
        );
        self.committed = snapshot.index;
        self.unstable.restore(snapshot);
    }

    /// Visits the entries in `[lo, hi)` in pages of at most `page_size`
    /// bytes, more only when a single entry exceeds it. The visitor may
    /// return an error to terminate the scan early; it is propagated as-is.
    ///
    /// The entries in `[lo, hi)` must exist. Panics if a page inside the
    /// requested range comes back empty.
    pub fn scan(
        &self,
        mut lo: Index,
        hi: Index,
        page_size: u64,
        mut visitor: impl FnMut(Vec<Entry>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        while lo < hi {
            let ents = self.slice(lo, hi, page_size)?;
            assert!(!ents.is_empty(), "got 0 entries in [{lo}, {hi})");
            lo += ents.len() as u64;
            visitor(ents)?;
        }
        Ok(())
    }

    /// Entries in `[lo, hi)`, clipped to `max_size` bytes. At least one
    /// entry is returned when the range is non-empty.
    ///
    /// Fails with [`Error::Compacted`] when `lo` predates the log. Panics
    /// when the range is malformed or reaches past the end of the log.
    pub fn slice(&self, lo: Index, hi: Index, max_size: u64) -> Result<Vec<Entry>, Error> {
        self.must_check_out_of_bounds(lo, hi)?;
        if lo == hi {
            return Ok(Vec::new());
        }
        if lo >= self.unstable.offset {
            // Entirely unstable. The clipped view is copied out, so no
            // later append can reach entries already handed to the caller.
            let ents = limit_size(self.unstable.slice(lo, hi), max_size);
            return Ok(ents.to_vec());
        }

        let cut = hi.min(self.unstable.offset);
        let ents = match self.storage.entries(lo, cut, max_size) {
            Ok(ents) => ents,
            Err(Error::Compacted) => return Err(Error::Compacted),
            Err(Error::Unavailable) => panic!("entries[{lo}, {cut}) is unavailable from storage"),
            Err(err) => panic!("unexpected storage error: {err}"),
        };
        if hi <= self.unstable.offset {
            return Ok(ents);
        }

        // Fast path to check if the stable run already hit the size limit.
        // A shorter-than-requested run means the next entry would have
        // pushed past the budget.
        if (ents.len() as u64) < cut - lo {
            return Ok(ents);
        }
        // Slow path computes the actual total size, so that the unstable
        // run is cut optimally before being copied in.
        let size = ents_size(&ents);
        if size >= max_size {
            return Ok(ents);
        }

        let unstable = limit_size(self.unstable.slice(self.unstable.offset, hi), max_size - size);
        // The unstable run can exceed the remaining budget only when it is
        // a single entry. Drop it then: the budget already holds `size`.
        if unstable.len() == 1 && size + ents_size(unstable) > max_size {
            return Ok(ents);
        }
        let mut ents = ents;
        ents.extend_from_slice(unstable);
        Ok(ents)
    }

    // first_index <= lo <= hi <= last_index + 1
    fn must_check_out_of_bounds(&self, lo: Index, hi: Index) -> Result<(), Error> {
        assert!(lo <= hi, "invalid slice {lo} > {hi}");
        let first = self.first_index();
        if lo < first {
            return Err(Error::Compacted);
        }
        let last = self.last_index();
        assert!(hi <= last + 1, "slice [{lo}, {hi}) out of bound [{first}, {last}]");
        Ok(())
    }

    /// Maps an out-of-bounds term lookup to term 0.
    fn zero_term_on_out_of_bounds(&self, term: Result<Term, Error>) -> Term {
        match term {
            Ok(term) => term,
            Err(Error::Compacted | Error::Unavailable) => 0,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    /// Highest index known committed on a quorum.
    pub fn committed(&self) -> Index {
        self.committed
    }

    /// Highest index handed to the application for apply.
    pub fn applying(&self) -> Index {
        self.applying
    }

    /// Highest index the application has reported applied.
    pub fn applied(&self) -> Index {
        self.applied
    }

    /// Term of the leader whose appends this log last absorbed.
    pub fn leader_term(&self) -> Term {
        self.leader_term
    }
}

impl<S: Storage> fmt::Display for RaftLog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "committed={}, applied={}, applying={}, unstable.offset={}, \
             unstable.offset_in_progress={}, len(unstable.entries)={}",
            self.committed,
            self.applied,
            self.applying,
            self.unstable.offset,
            self.unstable.offset_in_progress,
            self.unstable.entries.len(),
        )
    }
}
