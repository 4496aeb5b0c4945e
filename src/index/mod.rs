//! Run-scoped read indices over the history tables.

mod latest;
mod presence;

pub use latest::{resolve_version, LatestSnapshotIndex};
pub use presence::{AddressPresenceIndex, PresenceIndexSet};
