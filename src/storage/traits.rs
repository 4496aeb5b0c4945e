//! Abstract storage contract for relay-history.
//!
//! The engine talks to its relational collaborator only through
//! [`HistoryStore`]. The contract needs five things from a backend:
//! - insert-if-absent returning the assigned id or a duplicate signal
//! - point lookup by unique key
//! - bulk "latest row per node at or before a timestamp"
//! - single-timestamp update by row id
//! - scoped transactions

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::address::{AddressPresence, AddressSlot, NewPresence, PresenceId};
use crate::dimension::{CountryCode, DimensionId, DimensionKind};
use crate::node::{NewNodeVersion, NodeIdentity, NodeVersion, NodeVersionId};
use crate::relay::ImportRecord;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A uniqueness constraint rejected the write.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The value does not fit its column.
    #[error("Value too long for {table}: {actual} bytes exceeds {max_length}")]
    ValueTooLong {
        table: String,
        max_length: usize,
        actual: usize,
    },

    /// Row addressed by id does not exist.
    #[error("Row not found: {0}")]
    NotFound(String),

    /// Transaction used out of order (nested begin, commit without begin, ...).
    #[error("Invalid transaction state: {0}")]
    TransactionState(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    /// Returns true for uniqueness rejections, the only recoverable class.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }

    /// Returns true if the backend lost its connection.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

/// Storage contract for the history tables.
///
/// Writes outside a transaction are autocommitted. Between `begin` and
/// `commit`/`rollback` all writes become visible atomically or not at all.
///
/// # Safety Considerations
/// - Implementations must be `Send + Sync`; a run uses one logical thread but
///   readers may share the store.
/// - Identifiers are append-only and never reused, even after a rollback.
pub trait HistoryStore: Send + Sync {
    /// Opens a transaction. Nested transactions are not supported.
    fn begin(&self) -> Result<(), StorageError>;

    /// Makes the open transaction's writes durable.
    fn commit(&self) -> Result<(), StorageError>;

    /// Discards the open transaction's writes.
    fn rollback(&self) -> Result<(), StorageError>;

    /// Inserts a dimension value. Fails with `DuplicateKey` if the text exists.
    fn insert_dimension(&self, kind: DimensionKind, text: &str)
        -> Result<DimensionId, StorageError>;

    /// Point lookup of a dimension value by text.
    ///
    /// More than one id is an anomaly the caller reports.
    fn find_dimension(&self, kind: DimensionKind, text: &str)
        -> Result<Vec<DimensionId>, StorageError>;

    /// Reverse lookup of a dimension value.
    fn dimension_text(&self, kind: DimensionKind, id: DimensionId)
        -> Result<Option<String>, StorageError>;

    /// Every row of a dimension table.
    fn load_dimensions(&self, kind: DimensionKind)
        -> Result<Vec<(DimensionId, String)>, StorageError>;

    /// Inserts a country. Fails with `DuplicateKey` if the code exists.
    fn insert_country(&self, code: &CountryCode, name: &str) -> Result<(), StorageError>;

    /// Display name of a registered country.
    fn find_country(&self, code: &CountryCode) -> Result<Option<String>, StorageError>;

    /// Every registered country.
    fn load_countries(&self) -> Result<Vec<(CountryCode, String)>, StorageError>;

    /// Inserts a version row. Unique on (node, inserted-at).
    fn insert_node_version(&self, version: NewNodeVersion) -> Result<NodeVersionId, StorageError>;

    /// Point lookup of a version by its unique key.
    fn find_node_version(
        &self,
        node: &NodeIdentity,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<NodeVersionId>, StorageError>;

    /// Advances a version's last-confirmed-at to `at`. Never moves it back.
    fn confirm_node_version(&self, id: NodeVersionId, at: DateTime<Utc>)
        -> Result<(), StorageError>;

    /// For every node, the version with the greatest last-confirmed-at not
    /// exceeding `at`.
    fn latest_node_versions(&self, at: DateTime<Utc>) -> Result<Vec<NodeVersion>, StorageError>;

    /// All versions of a node, oldest first.
    fn node_versions(&self, node: &NodeIdentity) -> Result<Vec<NodeVersion>, StorageError>;

    /// Inserts a presence row. Unique on (node, address, port, inserted-at)
    /// within its slot.
    fn insert_presence(&self, presence: NewPresence) -> Result<PresenceId, StorageError>;

    /// Point lookup of a presence row by its unique key.
    fn find_presence(&self, presence: &NewPresence) -> Result<Vec<PresenceId>, StorageError>;

    /// Advances a presence row's last-confirmed-at to `at`. Never moves it back.
    fn confirm_presence(
        &self,
        slot: AddressSlot,
        id: PresenceId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// For every node, the rows of `slot` carrying that node's greatest
    /// last-confirmed-at not exceeding `at`.
    fn latest_presence(
        &self,
        slot: AddressSlot,
        at: DateTime<Utc>,
    ) -> Result<Vec<AddressPresence>, StorageError>;

    /// Every row of `slot` for `address`, any node, any time.
    fn presence_by_address(
        &self,
        slot: AddressSlot,
        address: IpAddr,
    ) -> Result<Vec<AddressPresence>, StorageError>;

    /// Every row of `slot` for `node`, oldest first.
    fn node_presence(
        &self,
        slot: AddressSlot,
        node: &NodeIdentity,
    ) -> Result<Vec<AddressPresence>, StorageError>;

    /// Appends an import-log row.
    fn record_import(&self, record: ImportRecord) -> Result<(), StorageError>;

    /// The import log, oldest first.
    fn imports(&self) -> Result<Vec<ImportRecord>, StorageError>;
}
