mod entry;
mod error;
mod log;
mod storage;
mod unstable;

pub use entry::{Entry, Index, NO_LIMIT, Snapshot, Term};
pub use error::Error;
pub use log::RaftLog;
pub use storage::Storage;
