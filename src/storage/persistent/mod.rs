//! Durable storage backend.
//!
//! A [`PersistentHistoryStore`] owns a directory containing a write-ahead log
//! and a lock file. On open it replays the log into an in-memory store; from
//! then on every committed batch is appended to the log before the commit
//! returns.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            PersistentHistoryStore             │
//! │  ┌──────────────────────┐  commit batches     │
//! │  │ InMemoryHistoryStore │ ───────────────┐    │
//! │  └──────────────────────┘                ↓    │
//! │                              ┌──────────────┐ │
//! │                              │ WriteAheadLog│ │
//! │                              └──────────────┘ │
//! │        FileLock (<dir>/history.lock)          │
//! └──────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod wal;

pub use file_lock::FileLock;
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::net::IpAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::{AddressPresence, AddressSlot, NewPresence, PresenceId};
use crate::config::StoreLimits;
use crate::dimension::{CountryCode, DimensionId, DimensionKind};
use crate::error::{ExecutionError, HistoryResult};
use crate::node::{NewNodeVersion, NodeIdentity, NodeVersion, NodeVersionId};
use crate::relay::ImportRecord;
use crate::storage::{HistoryStore, InMemoryHistoryStore, StorageError};

const WAL_FILE: &str = "history.wal";

/// Configuration for the durable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// fsync after every appended batch.
    pub sync_on_write: bool,
    pub limits: StoreLimits,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            limits: StoreLimits::default(),
        }
    }
}

impl PersistentConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for unusable column limits.
    pub fn validate(self) -> HistoryResult<Self> {
        self.limits.validate()?;
        Ok(self)
    }
}

fn io_err(operation: &str, path: &Path, e: &std::io::Error) -> ExecutionError {
    ExecutionError::storage(
        format!("{operation} {}", path.display()),
        StorageError::BackendError(e.to_string()),
    )
}

/// History store whose committed writes survive restarts.
///
/// Dereferences to the in-memory store for statistics and failpoints.
pub struct PersistentHistoryStore {
    memory: InMemoryHistoryStore,
    wal: Arc<WriteAheadLog>,
    dir: PathBuf,
    _lock: FileLock,
}

impl std::fmt::Debug for PersistentHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentHistoryStore")
            .field("dir", &self.dir)
            .field("wal", &self.wal)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl PersistentHistoryStore {
    /// Opens (or creates) the history directory at `dir`.
    ///
    /// # Errors
    ///
    /// - the directory cannot be created
    /// - another owner holds the directory lock
    /// - the log cannot be read or replayed
    pub fn open(dir: &Path, config: PersistentConfig) -> HistoryResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| io_err("create", dir, &e))?;
        let lock = FileLock::acquire(dir).map_err(|e| io_err("lock", dir, &e))?;

        let wal_path = dir.join(WAL_FILE);
        let wal = Arc::new(
            WriteAheadLog::open(&wal_path, config.sync_on_write)
                .map_err(|e| io_err("open", &wal_path, &e))?,
        );

        let memory = InMemoryHistoryStore::with_limits(config.limits);
        let mut batches = 0usize;
        for entry in wal.iter().map_err(|e| io_err("read", &wal_path, &e))? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = %wal_path.display(), error = %e, "stopping replay at unreadable record");
                    break;
                }
            };
            match entry.kind {
                WalEntryKind::Commit(mutations) => {
                    memory
                        .replay(&mutations)
                        .map_err(|e| ExecutionError::storage("replay write-ahead log", e))?;
                }
            }
            batches += 1;
        }
        debug!(batches, "write-ahead log replayed");

        let sink_wal = Arc::clone(&wal);
        memory.set_sink(Box::new(move |batch| {
            sink_wal
                .append(WalEntryKind::Commit(batch.to_vec()))
                .map(|_| ())
                .map_err(|e| StorageError::BackendError(format!("append to write-ahead log: {e}")))
        }))?;

        let counts = memory.counts();
        info!(
            dir = %dir.display(),
            node_versions = counts.node_versions,
            presence = counts.presence,
            imports = counts.imports,
            "opened history store"
        );

        Ok(Self {
            memory,
            wal,
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sequence number of the last durable batch.
    #[must_use]
    pub fn wal_sequence(&self) -> u64 {
        self.wal.current_sequence()
    }
}

impl Deref for PersistentHistoryStore {
    type Target = InMemoryHistoryStore;

    fn deref(&self) -> &Self::Target {
        &self.memory
    }
}

impl HistoryStore for PersistentHistoryStore {
    fn begin(&self) -> Result<(), StorageError> {
        self.memory.begin()
    }

    fn commit(&self) -> Result<(), StorageError> {
        self.memory.commit()
    }

    fn rollback(&self) -> Result<(), StorageError> {
        self.memory.rollback()
    }

    fn insert_dimension(
        &self,
        kind: DimensionKind,
        text: &str,
    ) -> Result<DimensionId, StorageError> {
        self.memory.insert_dimension(kind, text)
    }

    fn find_dimension(
        &self,
        kind: DimensionKind,
        text: &str,
    ) -> Result<Vec<DimensionId>, StorageError> {
        self.memory.find_dimension(kind, text)
    }

    fn dimension_text(
        &self,
        kind: DimensionKind,
        id: DimensionId,
    ) -> Result<Option<String>, StorageError> {
        self.memory.dimension_text(kind, id)
    }

    fn load_dimensions(
        &self,
        kind: DimensionKind,
    ) -> Result<Vec<(DimensionId, String)>, StorageError> {
        self.memory.load_dimensions(kind)
    }

    fn insert_country(&self, code: &CountryCode, name: &str) -> Result<(), StorageError> {
        self.memory.insert_country(code, name)
    }

    fn find_country(&self, code: &CountryCode) -> Result<Option<String>, StorageError> {
        self.memory.find_country(code)
    }

    fn load_countries(&self) -> Result<Vec<(CountryCode, String)>, StorageError> {
        self.memory.load_countries()
    }

    fn insert_node_version(&self, version: NewNodeVersion) -> Result<NodeVersionId, StorageError> {
        self.memory.insert_node_version(version)
    }

    fn find_node_version(
        &self,
        node: &NodeIdentity,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<NodeVersionId>, StorageError> {
        self.memory.find_node_version(node, inserted_at)
    }

    fn confirm_node_version(
        &self,
        id: NodeVersionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.memory.confirm_node_version(id, at)
    }

    fn latest_node_versions(&self, at: DateTime<Utc>) -> Result<Vec<NodeVersion>, StorageError> {
        self.memory.latest_node_versions(at)
    }

    fn node_versions(&self, node: &NodeIdentity) -> Result<Vec<NodeVersion>, StorageError> {
        self.memory.node_versions(node)
    }

    fn insert_presence(&self, presence: NewPresence) -> Result<PresenceId, StorageError> {
        self.memory.insert_presence(presence)
    }

    fn find_presence(&self, presence: &NewPresence) -> Result<Vec<PresenceId>, StorageError> {
        self.memory.find_presence(presence)
    }

    fn confirm_presence(
        &self,
        slot: AddressSlot,
        id: PresenceId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.memory.confirm_presence(slot, id, at)
    }

    fn latest_presence(
        &self,
        slot: AddressSlot,
        at: DateTime<Utc>,
    ) -> Result<Vec<AddressPresence>, StorageError> {
        self.memory.latest_presence(slot, at)
    }

    fn presence_by_address(
        &self,
        slot: AddressSlot,
        address: IpAddr,
    ) -> Result<Vec<AddressPresence>, StorageError> {
        self.memory.presence_by_address(slot, address)
    }

    fn node_presence(
        &self,
        slot: AddressSlot,
        node: &NodeIdentity,
    ) -> Result<Vec<AddressPresence>, StorageError> {
        self.memory.node_presence(slot, node)
    }

    fn record_import(&self, record: ImportRecord) -> Result<(), StorageError> {
        self.memory.record_import(record)
    }

    fn imports(&self) -> Result<Vec<ImportRecord>, StorageError> {
        self.memory.imports()
    }
}

/// Opens a durable history store, validating the configuration first.
///
/// # Errors
///
/// See [`PersistentHistoryStore::open`].
pub fn open_store(
    dir: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> HistoryResult<PersistentHistoryStore> {
    let config = config.unwrap_or_default().validate()?;
    PersistentHistoryStore::open(dir.as_ref(), config)
}
