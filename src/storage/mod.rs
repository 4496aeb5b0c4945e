//! Storage layer for relay-history.
//!
//! [`HistoryStore`] is the contract the engine needs from its relational
//! collaborator. [`InMemoryHistoryStore`] is the reference backend; with the
//! `persistent` feature a WAL-backed store wraps it for durability.

mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;
mod traits;
mod transaction;

pub use memory::{InMemoryHistoryStore, Mutation, MutationSink, StoreStats, TableCounts};
pub use traits::{HistoryStore, StorageError};
pub use transaction::Transaction;
