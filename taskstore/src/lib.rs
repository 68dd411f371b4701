//! Generic persistent record store.
//!
//! Every collection is a JSONL append log (the durable, git-friendly source of
//! truth) mirrored into a SQLite index so filtered/ordered queries don't require
//! a full-collection scan. The log is authoritative; the index is rebuilt from
//! it on open and can be rebuilt on demand if it drifts.

mod error;
mod filter;
mod record;
mod store;

pub use error::StoreError;
pub use filter::{Filter, FilterOp};
pub use record::{IndexValue, Record};
pub use store::Store;

/// Current time as Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
