//! # relay-history
//!
//! Keeps a versioned history of a relay network's roster. Each imported
//! snapshot is reconciled against what is already recorded: a node whose
//! attributes are unchanged has its current version's validity extended, a
//! node whose attributes changed gets a new version, and every reported
//! address is tracked per role and address family in the same way.
//!
//! ## Core Concepts
//!
//! - **NodeVersion**: one historical attribute row of a node, valid from its
//!   insertion to its last confirmation
//! - **AddressPresence**: one sighting interval of an address in one of six
//!   (role, family) slots
//! - **Dimension**: a deduplicated free-text attribute referenced by id
//! - **ReferenceInstant**: the fixed instant a run is recorded at
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use relay_history::{HistoryQuery, InMemoryHistoryStore, ReferenceSource, Snapshot, SyncEngine};
//!
//! let store = Arc::new(InMemoryHistoryStore::new());
//! let engine = SyncEngine::with_defaults(store.clone());
//!
//! let snapshot = Snapshot::from_json(&details_document)?;
//! let source = ReferenceSource::FromFilename {
//!     filename: "details-2024-03-01-12-00-00.json".to_string(),
//!     pattern: None,
//! };
//! let report = engine.run_snapshot(snapshot, &source)?;
//!
//! let query = HistoryQuery::new(store);
//! let german = query.by_country("de")?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod address;
pub mod config;
pub mod dimension;
pub mod error;
pub mod node;
pub mod relay;
pub mod time;

// Storage and indices
pub mod index;
pub mod storage;

// Synchronization and queries
pub mod detector;
pub mod query;
pub mod sync;

pub use address::{AddressFamily, AddressPresence, AddressRole, AddressSlot, ParsedAddress};
pub use config::{StoreLimits, SyncConfig};
pub use detector::{AttributeField, ChangeDetector, Verdict};
pub use dimension::{CountryCode, DimensionCache, DimensionId, DimensionKind};
pub use error::{ExecutionError, HistoryError, HistoryResult, ValidationError};
pub use node::{AttributeSet, NodeIdentity, NodeVersion, NodeVersionId};
pub use query::{HistoryQuery, RelayView};
pub use relay::{ImportRecord, RelayRecord, Snapshot, SnapshotHeader};
pub use storage::{HistoryStore, InMemoryHistoryStore, StorageError, Transaction};
pub use sync::{NodeOutcome, SyncEngine, SyncReport};
pub use time::{ReferenceInstant, ReferenceSource};
