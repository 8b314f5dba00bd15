use bytes::Bytes;

/// 1-based position of an entry in the Raft log. Index 0 means "outside the
/// log": a previous-log index of 0 says there is no previous entry, and a
/// compacted log starts right above `first_index - 1`.
///
/// Rust containers are 0-based; the convention in this code base is to use
/// "index" for the 1-based log positions and "idx" for 0-based container
/// positions.
pub type Index = u64;
/// Raft election term. Terms are non-decreasing along the log.
pub type Term = u64;

/// Byte budget meaning "no limit".
pub const NO_LIMIT: u64 = u64::MAX;

/// A single log record: a state-machine payload stamped with the position
/// and election term the leader assigned to it.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Entry {
    pub index: Index,
    pub term: Term,
    pub payload: Bytes,
}

impl Entry {
    pub fn new(index: Index, term: Term, payload: Bytes) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }

    /// Payload byte size, the unit of all byte budgets in the log.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// A compacted log prefix. `index` and `term` identify the last entry the
/// snapshot covers; `data` is the state-machine image.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Snapshot {
    pub index: Index,
    pub term: Term,
    pub data: Bytes,
}

impl Snapshot {
    pub fn new(index: Index, term: Term, data: Bytes) -> Self {
        Self { index, term, data }
    }
}

/// Total byte size of a run of entries.
pub(crate) fn ents_size(ents: &[Entry]) -> u64 {
    ents.iter().map(Entry::size).sum()
}

/// The longest prefix of `ents` whose total byte size stays within
/// `max_size`. Always non-empty when the input is non-empty: if the first
/// entry alone exceeds the budget, the prefix holds just that entry.
pub(crate) fn limit_size(ents: &[Entry], max_size: u64) -> &[Entry] {
    if ents.is_empty() {
        return ents;
    }
    let mut size = ents[0].size();
    let mut limit = 1;
    while limit < ents.len() {
        size += ents[limit].size();
        if size > max_size {
            break;
        }
        limit += 1;
    }
    &ents[..limit]
}
