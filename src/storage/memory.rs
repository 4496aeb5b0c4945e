//! In-memory storage backend.
//!
//! Thread-safe reference implementation of [`HistoryStore`]. It enforces the
//! same uniqueness constraints and column capacities a relational backend
//! would, and implements transactions with an undo journal.
//!
//! Every change is expressed as a [`Mutation`]. Committed mutations can be
//! forwarded to a sink, which is how the persistent backend makes them durable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{AddressPresence, AddressSlot, NewPresence, PresenceId};
use crate::config::StoreLimits;
use crate::dimension::{CountryCode, DimensionId, DimensionKind};
use crate::node::{NewNodeVersion, NodeIdentity, NodeVersion, NodeVersionId};
use crate::relay::ImportRecord;
use crate::storage::traits::{HistoryStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn dimension_key(kind: DimensionKind, text: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.table_name().as_bytes());
    hasher.update(&[0]);
    hasher.update(text.as_bytes());
    *hasher.finalize().as_bytes()
}

fn check_len(table: &str, value: &str, max_length: usize) -> Result<(), StorageError> {
    if value.len() > max_length {
        return Err(StorageError::ValueTooLong {
            table: table.to_string(),
            max_length,
            actual: value.len(),
        });
    }
    Ok(())
}

/// A single applied change to the history tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    DimensionInserted {
        kind: DimensionKind,
        id: DimensionId,
        text: String,
    },
    CountryRegistered {
        code: CountryCode,
        name: String,
    },
    NodeVersionInserted(NodeVersion),
    NodeVersionConfirmed {
        id: NodeVersionId,
        previous: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    PresenceInserted(AddressPresence),
    PresenceConfirmed {
        slot: AddressSlot,
        id: PresenceId,
        previous: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    ImportRecorded(ImportRecord),
}

/// Receives every batch of committed mutations.
pub type MutationSink = Box<dyn Fn(&[Mutation]) -> Result<(), StorageError> + Send + Sync>;

/// Read and write call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
}

/// Row counts per table family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub dimensions: usize,
    pub countries: usize,
    pub node_versions: usize,
    pub presence: usize,
    pub imports: usize,
}

#[derive(Debug, Default)]
struct Tables {
    dimensions: HashMap<DimensionKind, BTreeMap<DimensionId, String>>,
    dimension_index: HashMap<[u8; 32], Vec<DimensionId>>,
    countries: BTreeMap<CountryCode, String>,
    versions: BTreeMap<NodeVersionId, NodeVersion>,
    versions_by_node: HashMap<NodeIdentity, Vec<NodeVersionId>>,
    presence: [BTreeMap<PresenceId, AddressPresence>; 6],
    presence_by_node: [HashMap<NodeIdentity, Vec<PresenceId>>; 6],
    imports: Vec<ImportRecord>,
}

impl Tables {
    fn apply(&mut self, mutation: &Mutation) -> Result<(), StorageError> {
        match mutation {
            Mutation::DimensionInserted { kind, id, text } => {
                self.dimensions
                    .entry(*kind)
                    .or_default()
                    .insert(*id, text.clone());
                self.dimension_index
                    .entry(dimension_key(*kind, text))
                    .or_default()
                    .push(*id);
            }
            Mutation::CountryRegistered { code, name } => {
                self.countries.insert(code.clone(), name.clone());
            }
            Mutation::NodeVersionInserted(version) => {
                self.versions_by_node
                    .entry(version.node.clone())
                    .or_default()
                    .push(version.id);
                self.versions.insert(version.id, version.clone());
            }
            Mutation::NodeVersionConfirmed { id, at, .. } => {
                let row = self
                    .versions
                    .get_mut(id)
                    .ok_or_else(|| StorageError::NotFound(format!("node version {id}")))?;
                row.last_confirmed_at = *at;
            }
            Mutation::PresenceInserted(presence) => {
                let idx = presence.slot.index();
                self.presence_by_node[idx]
                    .entry(presence.node.clone())
                    .or_default()
                    .push(presence.id);
                self.presence[idx].insert(presence.id, presence.clone());
            }
            Mutation::PresenceConfirmed { slot, id, at, .. } => {
                let row = self.presence[slot.index()]
                    .get_mut(id)
                    .ok_or_else(|| StorageError::NotFound(format!("{slot} row {}", id.0)))?;
                row.last_confirmed_at = *at;
            }
            Mutation::ImportRecorded(record) => {
                self.imports.push(record.clone());
            }
        }
        Ok(())
    }

    fn undo(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::DimensionInserted { kind, id, text } => {
                if let Some(rows) = self.dimensions.get_mut(kind) {
                    rows.remove(id);
                }
                let key = dimension_key(*kind, text);
                if let Some(ids) = self.dimension_index.get_mut(&key) {
                    ids.retain(|existing| existing != id);
                    if ids.is_empty() {
                        self.dimension_index.remove(&key);
                    }
                }
            }
            Mutation::CountryRegistered { code, .. } => {
                self.countries.remove(code);
            }
            Mutation::NodeVersionInserted(version) => {
                self.versions.remove(&version.id);
                if let Some(ids) = self.versions_by_node.get_mut(&version.node) {
                    ids.retain(|existing| *existing != version.id);
                    if ids.is_empty() {
                        self.versions_by_node.remove(&version.node);
                    }
                }
            }
            Mutation::NodeVersionConfirmed { id, previous, .. } => {
                if let Some(row) = self.versions.get_mut(id) {
                    row.last_confirmed_at = *previous;
                }
            }
            Mutation::PresenceInserted(presence) => {
                let idx = presence.slot.index();
                self.presence[idx].remove(&presence.id);
                if let Some(ids) = self.presence_by_node[idx].get_mut(&presence.node) {
                    ids.retain(|existing| *existing != presence.id);
                    if ids.is_empty() {
                        self.presence_by_node[idx].remove(&presence.node);
                    }
                }
            }
            Mutation::PresenceConfirmed { slot, id, previous, .. } => {
                if let Some(row) = self.presence[slot.index()].get_mut(id) {
                    row.last_confirmed_at = *previous;
                }
            }
            Mutation::ImportRecorded(_) => {
                self.imports.pop();
            }
        }
    }

    fn node_rows(&self, node: &NodeIdentity) -> impl Iterator<Item = &NodeVersion> {
        self.versions_by_node
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.versions.get(id))
    }

    fn slot_rows<'a>(
        &'a self,
        slot: AddressSlot,
        node: &NodeIdentity,
    ) -> impl Iterator<Item = &'a AddressPresence> {
        let idx = slot.index();
        self.presence_by_node[idx]
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.presence[idx].get(id))
    }
}

#[derive(Debug)]
struct State {
    tables: Tables,
    journal: Option<Vec<Mutation>>,
    next_dimension: u64,
    next_version: u64,
    next_presence: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            tables: Tables::default(),
            journal: None,
            next_dimension: 1,
            next_version: 1,
            next_presence: 1,
        }
    }
}

impl State {
    // Identifiers are never handed out twice, even after a rollback.
    fn note_ids(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::DimensionInserted { id, .. } => {
                self.next_dimension = self.next_dimension.max(id.0 + 1);
            }
            Mutation::NodeVersionInserted(version) => {
                self.next_version = self.next_version.max(version.id.0 + 1);
            }
            Mutation::PresenceInserted(presence) => {
                self.next_presence = self.next_presence.max(presence.id.0 + 1);
            }
            _ => {}
        }
    }
}

/// In-memory [`HistoryStore`].
pub struct InMemoryHistoryStore {
    state: RwLock<State>,
    limits: StoreLimits,
    failpoints: RwLock<HashSet<String>>,
    sink: RwLock<Option<MutationSink>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl fmt::Debug for InMemoryHistoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryHistoryStore")
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHistoryStore {
    /// Creates an empty store with default column capacities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(StoreLimits::default())
    }

    /// Creates an empty store with the given column capacities.
    #[must_use]
    pub fn with_limits(limits: StoreLimits) -> Self {
        Self {
            state: RwLock::new(State::default()),
            limits,
            failpoints: RwLock::new(HashSet::new()),
            sink: RwLock::new(None),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Read and write call counters since creation.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Current row counts.
    #[must_use]
    pub fn counts(&self) -> TableCounts {
        let Ok(state) = self.state.read() else {
            return TableCounts::default();
        };
        let t = &state.tables;
        TableCounts {
            dimensions: t.dimensions.values().map(BTreeMap::len).sum(),
            countries: t.countries.len(),
            node_versions: t.versions.len(),
            presence: t.presence.iter().map(BTreeMap::len).sum(),
            imports: t.imports.len(),
        }
    }

    /// Row count of one presence table.
    #[must_use]
    pub fn presence_count(&self, slot: AddressSlot) -> usize {
        self.state
            .read()
            .map(|state| state.tables.presence[slot.index()].len())
            .unwrap_or(0)
    }

    /// Makes the named operation fail with a connection error until disarmed.
    ///
    /// Names: `insert_dimension`, `insert_country`, `insert_node_version`,
    /// `confirm_node_version`, `insert_presence`, `confirm_presence`,
    /// `record_import`, `commit`.
    pub fn arm_failpoint(&self, name: &str) {
        if let Ok(mut guard) = self.failpoints.write() {
            guard.insert(name.to_string());
        }
    }

    pub fn disarm_failpoint(&self, name: &str) {
        if let Ok(mut guard) = self.failpoints.write() {
            guard.remove(name);
        }
    }

    /// Forwards committed mutations to `sink` from now on.
    pub(crate) fn set_sink(&self, sink: MutationSink) -> Result<(), StorageError> {
        *self.sink.write().map_err(|_| lock_err("sink"))? = Some(sink);
        Ok(())
    }

    /// Re-applies previously committed mutations without forwarding them.
    pub(crate) fn replay(&self, mutations: &[Mutation]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("replay"))?;
        for mutation in mutations {
            state.tables.apply(mutation)?;
            state.note_ids(mutation);
        }
        Ok(())
    }

    /// Inserts a dimension row without the uniqueness check.
    #[cfg(test)]
    pub(crate) fn force_dimension_row(&self, kind: DimensionKind, text: &str) -> DimensionId {
        let mut state = self.state.write().unwrap();
        let id = DimensionId(state.next_dimension);
        let mutation = Mutation::DimensionInserted {
            kind,
            id,
            text: text.to_string(),
        };
        state.tables.apply(&mutation).unwrap();
        state.note_ids(&mutation);
        id
    }

    fn failpoint(&self, name: &str) -> Result<(), StorageError> {
        let armed = self
            .failpoints
            .read()
            .map_err(|_| lock_err("failpoints"))?
            .contains(name);
        if armed {
            return Err(StorageError::ConnectionError(format!("failpoint {name}")));
        }
        Ok(())
    }

    fn publish(&self, batch: &[Mutation]) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let guard = self.sink.read().map_err(|_| lock_err("sink"))?;
        match guard.as_ref() {
            Some(sink) => sink(batch),
            None => Ok(()),
        }
    }

    fn read<R>(
        &self,
        context: &'static str,
        f: impl FnOnce(&Tables) -> R,
    ) -> Result<R, StorageError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().map_err(|_| lock_err(context))?;
        Ok(f(&state.tables))
    }

    /// Runs a validated write. `prepare` checks constraints and builds the
    /// mutation (or `None` when there is nothing to change); the mutation is
    /// then applied and either journaled or published immediately.
    fn write<R>(
        &self,
        op: &'static str,
        prepare: impl FnOnce(&mut State) -> Result<(Option<Mutation>, R), StorageError>,
    ) -> Result<R, StorageError> {
        self.failpoint(op)?;
        let mut state = self.state.write().map_err(|_| lock_err(op))?;
        let (mutation, out) = prepare(&mut *state)?;
        let Some(mutation) = mutation else {
            return Ok(out);
        };

        state.tables.apply(&mutation)?;
        state.note_ids(&mutation);
        if let Some(journal) = state.journal.as_mut() {
            journal.push(mutation);
        } else if let Err(e) = self.publish(std::slice::from_ref(&mutation)) {
            state.tables.undo(&mutation);
            return Err(e);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn begin(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("begin"))?;
        if state.journal.is_some() {
            return Err(StorageError::TransactionState(
                "transaction already open".to_string(),
            ));
        }
        state.journal = Some(Vec::new());
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("commit"))?;
        let Some(journal) = state.journal.take() else {
            return Err(StorageError::TransactionState(
                "commit without open transaction".to_string(),
            ));
        };

        let published = self.failpoint("commit").and_then(|()| self.publish(&journal));
        if let Err(e) = published {
            for mutation in journal.iter().rev() {
                state.tables.undo(mutation);
            }
            return Err(e);
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("rollback"))?;
        let Some(journal) = state.journal.take() else {
            return Err(StorageError::TransactionState(
                "rollback without open transaction".to_string(),
            ));
        };
        for mutation in journal.iter().rev() {
            state.tables.undo(mutation);
        }
        Ok(())
    }

    fn insert_dimension(
        &self,
        kind: DimensionKind,
        text: &str,
    ) -> Result<DimensionId, StorageError> {
        check_len(kind.table_name(), text, self.limits.dimension(kind))?;
        self.write("insert_dimension", |state| {
            let key = dimension_key(kind, text);
            let exists = state.tables.dimension_index.get(&key).is_some_and(|ids| {
                ids.iter().any(|id| {
                    state
                        .tables
                        .dimensions
                        .get(&kind)
                        .and_then(|rows| rows.get(id))
                        .is_some_and(|t| t == text)
                })
            });
            if exists {
                return Err(StorageError::DuplicateKey(format!(
                    "{}: {text}",
                    kind.table_name()
                )));
            }
            let id = DimensionId(state.next_dimension);
            let mutation = Mutation::DimensionInserted {
                kind,
                id,
                text: text.to_string(),
            };
            Ok((Some(mutation), id))
        })
    }

    fn find_dimension(
        &self,
        kind: DimensionKind,
        text: &str,
    ) -> Result<Vec<DimensionId>, StorageError> {
        self.read("find_dimension", |t| {
            let Some(rows) = t.dimensions.get(&kind) else {
                return Vec::new();
            };
            t.dimension_index
                .get(&dimension_key(kind, text))
                .map(|ids| {
                    ids.iter()
                        .copied()
                        .filter(|id| rows.get(id).is_some_and(|stored| stored == text))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn dimension_text(
        &self,
        kind: DimensionKind,
        id: DimensionId,
    ) -> Result<Option<String>, StorageError> {
        self.read("dimension_text", |t| {
            t.dimensions.get(&kind).and_then(|rows| rows.get(&id)).cloned()
        })
    }

    fn load_dimensions(
        &self,
        kind: DimensionKind,
    ) -> Result<Vec<(DimensionId, String)>, StorageError> {
        self.read("load_dimensions", |t| {
            t.dimensions
                .get(&kind)
                .map(|rows| rows.iter().map(|(id, text)| (*id, text.clone())).collect())
                .unwrap_or_default()
        })
    }

    fn insert_country(&self, code: &CountryCode, name: &str) -> Result<(), StorageError> {
        check_len("countries", name, self.limits.country_name)?;
        self.write("insert_country", |state| {
            if state.tables.countries.contains_key(code) {
                return Err(StorageError::DuplicateKey(format!("countries: {code}")));
            }
            let mutation = Mutation::CountryRegistered {
                code: code.clone(),
                name: name.to_string(),
            };
            Ok((Some(mutation), ()))
        })
    }

    fn find_country(&self, code: &CountryCode) -> Result<Option<String>, StorageError> {
        self.read("find_country", |t| t.countries.get(code).cloned())
    }

    fn load_countries(&self) -> Result<Vec<(CountryCode, String)>, StorageError> {
        self.read("load_countries", |t| {
            t.countries
                .iter()
                .map(|(code, name)| (code.clone(), name.clone()))
                .collect()
        })
    }

    fn insert_node_version(&self, version: NewNodeVersion) -> Result<NodeVersionId, StorageError> {
        check_len("node_versions", version.node.as_str(), self.limits.fingerprint)?;
        if let Some(nickname) = &version.nickname {
            check_len("node_versions", nickname, self.limits.nickname)?;
        }
        self.write("insert_node_version", move |state| {
            if state
                .tables
                .node_rows(&version.node)
                .any(|row| row.inserted_at == version.at)
            {
                return Err(StorageError::DuplicateKey(format!(
                    "node_versions: {} @ {}",
                    version.node, version.at
                )));
            }
            let id = NodeVersionId(state.next_version);
            Ok((Some(Mutation::NodeVersionInserted(version.into_version(id))), id))
        })
    }

    fn find_node_version(
        &self,
        node: &NodeIdentity,
        inserted_at: DateTime<Utc>,
    ) -> Result<Vec<NodeVersionId>, StorageError> {
        self.read("find_node_version", |t| {
            t.node_rows(node)
                .filter(|row| row.inserted_at == inserted_at)
                .map(|row| row.id)
                .collect()
        })
    }

    fn confirm_node_version(
        &self,
        id: NodeVersionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.write("confirm_node_version", |state| {
            let row = state
                .tables
                .versions
                .get(&id)
                .ok_or_else(|| StorageError::NotFound(format!("node version {id}")))?;
            let previous = row.last_confirmed_at;
            if at <= previous {
                return Ok((None, ()));
            }
            Ok((Some(Mutation::NodeVersionConfirmed { id, previous, at }), ()))
        })
    }

    fn latest_node_versions(&self, at: DateTime<Utc>) -> Result<Vec<NodeVersion>, StorageError> {
        self.read("latest_node_versions", |t| {
            t.versions_by_node
                .keys()
                .filter_map(|node| {
                    t.node_rows(node)
                        .filter(|row| row.last_confirmed_at <= at)
                        .max_by_key(|row| (row.last_confirmed_at, row.id))
                        .cloned()
                })
                .collect()
        })
    }

    fn node_versions(&self, node: &NodeIdentity) -> Result<Vec<NodeVersion>, StorageError> {
        self.read("node_versions", |t| {
            let mut rows: Vec<NodeVersion> = t.node_rows(node).cloned().collect();
            rows.sort_by_key(|row| (row.inserted_at, row.id));
            rows
        })
    }

    fn insert_presence(&self, presence: NewPresence) -> Result<PresenceId, StorageError> {
        check_len(presence.slot.table_name(), presence.node.as_str(), self.limits.fingerprint)?;
        self.write("insert_presence", move |state| {
            let duplicate = state
                .tables
                .slot_rows(presence.slot, &presence.node)
                .any(|row| {
                    row.address == presence.address
                        && row.port == presence.port
                        && row.inserted_at == presence.at
                });
            if duplicate {
                return Err(StorageError::DuplicateKey(format!(
                    "{}: {} {} @ {}",
                    presence.slot, presence.node, presence.address, presence.at
                )));
            }
            let id = PresenceId(state.next_presence);
            Ok((Some(Mutation::PresenceInserted(presence.into_presence(id))), id))
        })
    }

    fn find_presence(&self, presence: &NewPresence) -> Result<Vec<PresenceId>, StorageError> {
        self.read("find_presence", |t| {
            t.slot_rows(presence.slot, &presence.node)
                .filter(|row| {
                    row.address == presence.address
                        && row.port == presence.port
                        && row.inserted_at == presence.at
                })
                .map(|row| row.id)
                .collect()
        })
    }

    fn confirm_presence(
        &self,
        slot: AddressSlot,
        id: PresenceId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.write("confirm_presence", |state| {
            let row = state.tables.presence[slot.index()]
                .get(&id)
                .ok_or_else(|| StorageError::NotFound(format!("{slot} row {}", id.0)))?;
            let previous = row.last_confirmed_at;
            if at <= previous {
                return Ok((None, ()));
            }
            Ok((
                Some(Mutation::PresenceConfirmed {
                    slot,
                    id,
                    previous,
                    at,
                }),
                (),
            ))
        })
    }

    fn latest_presence(
        &self,
        slot: AddressSlot,
        at: DateTime<Utc>,
    ) -> Result<Vec<AddressPresence>, StorageError> {
        self.read("latest_presence", |t| {
            let mut out = Vec::new();
            for node in t.presence_by_node[slot.index()].keys() {
                let newest = t
                    .slot_rows(slot, node)
                    .map(|row| row.last_confirmed_at)
                    .filter(|confirmed| *confirmed <= at)
                    .max();
                if let Some(newest) = newest {
                    out.extend(
                        t.slot_rows(slot, node)
                            .filter(|row| row.last_confirmed_at == newest)
                            .cloned(),
                    );
                }
            }
            out
        })
    }

    fn presence_by_address(
        &self,
        slot: AddressSlot,
        address: IpAddr,
    ) -> Result<Vec<AddressPresence>, StorageError> {
        self.read("presence_by_address", |t| {
            t.presence[slot.index()]
                .values()
                .filter(|row| row.address == address)
                .cloned()
                .collect()
        })
    }

    fn node_presence(
        &self,
        slot: AddressSlot,
        node: &NodeIdentity,
    ) -> Result<Vec<AddressPresence>, StorageError> {
        self.read("node_presence", |t| {
            let mut rows: Vec<AddressPresence> = t.slot_rows(slot, node).cloned().collect();
            rows.sort_by_key(|row| (row.inserted_at, row.id));
            rows
        })
    }

    fn record_import(&self, record: ImportRecord) -> Result<(), StorageError> {
        self.write("record_import", move |_| {
            Ok((Some(Mutation::ImportRecorded(record)), ()))
        })
    }

    fn imports(&self) -> Result<Vec<ImportRecord>, StorageError> {
        self.read("imports", |t| t.imports.clone())
    }
}
