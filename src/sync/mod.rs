//! Incremental synchronization of snapshots into the history tables.

mod context;
mod engine;
mod reconcile;
mod report;

pub use context::SyncContext;
pub use engine::SyncEngine;
pub use reconcile::{NodeOutcome, NodeReport, Reconciler};
pub use report::SyncReport;
