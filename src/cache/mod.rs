//! Content-addressed response cache.
//!
//! Cache entries are plain files named by a digest of the target URL.  An
//! entry is written once, renamed into place, and never modified or evicted
//! afterwards.  [`Coalescer`] keeps concurrent misses for the same key from
//! each doing the expensive work.

pub mod coalesce;
pub mod key;
pub mod store;

pub use coalesce::{Coalescer, Role, TaskFailed};
pub use key::CacheKey;
pub use store::{CacheStore, EntryKind};
