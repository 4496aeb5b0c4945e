//! Per-node reconciliation: confirm, extend or supersede.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::address::{AddressSlot, NewPresence, ParsedAddress};
use crate::detector::{ChangeDetector, Verdict};
use crate::dimension::{CountryCode, DimensionKind};
use crate::error::{ExecutionError, HistoryResult};
use crate::node::{AttributeSet, DimensionRefs, NewNodeVersion, NodeIdentity, ResolvedVersion};
use crate::relay::RelayRecord;
use crate::storage::{HistoryStore, Transaction};
use crate::sync::context::SyncContext;

/// What happened to one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Already recorded at this reference instant; nothing written.
    Confirmed,
    /// Same attributes as the prior version, whose validity was extended.
    Extended,
    /// New node or changed attributes; a new version was written.
    Superseded,
    /// A second record for a node already reconciled in this run.
    Skipped,
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Confirmed => "confirmed",
            Self::Extended => "extended",
            Self::Superseded => "superseded",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Whether an insert created its row or found it already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowWrite {
    Created,
    Recovered,
}

/// Result of reconciling one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub node: NodeIdentity,
    pub outcome: NodeOutcome,
    pub presence_inserted: usize,
    pub presence_extended: usize,
}

impl NodeReport {
    const fn new(node: NodeIdentity, outcome: NodeOutcome) -> Self {
        Self {
            node,
            outcome,
            presence_inserted: 0,
            presence_extended: 0,
        }
    }
}

/// Applies one record to the store using a run's [`SyncContext`].
pub struct Reconciler<'a> {
    store: &'a dyn HistoryStore,
    ctx: &'a SyncContext,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub const fn new(store: &'a dyn HistoryStore, ctx: &'a SyncContext) -> Self {
        Self { store, ctx }
    }

    fn at(&self) -> DateTime<Utc> {
        self.ctx.reference().as_datetime()
    }

    /// Reconciles one record.
    ///
    /// The record is fully validated before anything is written. Version and
    /// presence rows of the node are written in one transaction.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed input and an execution error
    /// for any store failure other than a recoverable uniqueness conflict.
    pub fn reconcile(&self, record: &RelayRecord) -> HistoryResult<NodeReport> {
        let node = record.identity()?;
        if !self.ctx.mark_reconciled(&node)? {
            warn!(%node, "duplicate record for node in snapshot; skipping");
            return Ok(NodeReport::new(node, NodeOutcome::Skipped));
        }

        let attributes = record.attributes()?;
        let addresses = record.addresses()?;
        let prior = self.ctx.latest().lookup(&node);

        let report = match (ChangeDetector::compare(&attributes, prior.map(|p| &p.attributes)), prior) {
            (Verdict::Same, Some(prior)) if prior.version.last_confirmed_at == self.at() => {
                NodeReport::new(node, NodeOutcome::Confirmed)
            }
            (Verdict::Same, Some(prior)) => self.extend(node, prior, &addresses)?,
            (_, prior) => {
                if let Some(prior) = prior {
                    debug!(
                        %node,
                        changed = ?ChangeDetector::differences(&attributes, Some(&prior.attributes))
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>(),
                        "attributes changed"
                    );
                }
                self.supersede(node, record, &attributes, &addresses)?
            }
        };
        debug!(
            node = %report.node,
            outcome = %report.outcome,
            presence_inserted = report.presence_inserted,
            presence_extended = report.presence_extended,
            "node reconciled"
        );
        Ok(report)
    }

    fn extend(
        &self,
        node: NodeIdentity,
        prior: &ResolvedVersion,
        addresses: &[(AddressSlot, ParsedAddress)],
    ) -> HistoryResult<NodeReport> {
        let at = self.at();
        let mut report = NodeReport::new(node, NodeOutcome::Extended);

        let tx = Transaction::begin(self.store)
            .map_err(|e| ExecutionError::storage(format!("begin transaction for {}", report.node), e))?;
        self.store
            .confirm_node_version(prior.version.id, at)
            .map_err(|e| ExecutionError::storage(format!("extend node version {}", report.node), e))?;

        for (slot, address) in addresses {
            let recorded = self.ctx.presence().lookup(*slot, &report.node, &address.ip);
            match recorded.iter().find(|row| row.port == address.port) {
                Some(row) if row.last_confirmed_at == at => {}
                Some(row) => {
                    self.store.confirm_presence(*slot, row.id, at).map_err(|e| {
                        ExecutionError::storage(format!("extend {slot} {address} for {}", report.node), e)
                    })?;
                    report.presence_extended += 1;
                }
                None => {
                    if self.insert_presence(&report.node, *slot, address)? == RowWrite::Created {
                        report.presence_inserted += 1;
                    }
                }
            }
        }

        tx.commit()
            .map_err(|e| ExecutionError::storage(format!("commit {}", report.node), e))?;
        Ok(report)
    }

    fn supersede(
        &self,
        node: NodeIdentity,
        record: &RelayRecord,
        attributes: &AttributeSet,
        addresses: &[(AddressSlot, ParsedAddress)],
    ) -> HistoryResult<NodeReport> {
        // Dimension rows are autocommitted before the node transaction opens.
        let dimensions = self.resolve_dimensions(record, attributes)?;
        let mut report = NodeReport::new(node, NodeOutcome::Superseded);

        let tx = Transaction::begin(self.store)
            .map_err(|e| ExecutionError::storage(format!("begin transaction for {}", report.node), e))?;
        let version = self.insert_version(NewNodeVersion {
            node: report.node.clone(),
            dimensions,
            nickname: attributes.nickname.clone(),
            last_changed_address_or_port: attributes.last_changed_address_or_port,
            first_seen: attributes.first_seen,
            flags: record.flags.clone(),
            payload: record.payload(),
            at: self.at(),
        })?;
        if version == RowWrite::Recovered {
            // Already recorded at this instant: the existing row stands.
            report.outcome = NodeOutcome::Confirmed;
        }
        for (slot, address) in addresses {
            if self.insert_presence(&report.node, *slot, address)? == RowWrite::Created {
                report.presence_inserted += 1;
            }
        }
        tx.commit()
            .map_err(|e| ExecutionError::storage(format!("commit {}", report.node), e))?;
        Ok(report)
    }

    fn resolve_dimensions(
        &self,
        record: &RelayRecord,
        attributes: &AttributeSet,
    ) -> HistoryResult<DimensionRefs> {
        let cache = self.ctx.cache();
        let mut refs = DimensionRefs {
            country: match &attributes.country {
                Some(code) => Some(self.resolve_country(record, code)?),
                None => None,
            },
            ..DimensionRefs::default()
        };
        for kind in DimensionKind::ALL {
            let id = cache.resolve_optional(self.store, kind, attributes.dimension_text(kind))?;
            refs.set(kind, id);
        }
        Ok(refs)
    }

    fn resolve_country(&self, record: &RelayRecord, code: &CountryCode) -> HistoryResult<CountryCode> {
        let cache = self.ctx.cache();
        if let Some(known) = cache.resolve_country(self.store, code)? {
            return Ok(known);
        }
        let name = record
            .country_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map_or_else(|| code.as_str().to_ascii_uppercase(), str::to_string);
        debug!(%code, %name, "registering country");
        cache.register_country(self.store, code, &name)
    }

    fn insert_version(&self, version: NewNodeVersion) -> HistoryResult<RowWrite> {
        let node = version.node.clone();
        let at = version.at;
        match self.store.insert_node_version(version) {
            Ok(_) => Ok(RowWrite::Created),
            Err(e) if e.is_duplicate() => {
                let ids = self
                    .store
                    .find_node_version(&node, at)
                    .map_err(|e| ExecutionError::storage(format!("look up node version {node}"), e))?;
                let id = first_match(&ids, "node_versions", &node)?;
                debug!(%node, %id, "node version already recorded at this instant");
                Ok(RowWrite::Recovered)
            }
            Err(e) => Err(ExecutionError::storage(format!("insert node version {node}"), e).into()),
        }
    }

    fn insert_presence(
        &self,
        node: &NodeIdentity,
        slot: AddressSlot,
        address: &ParsedAddress,
    ) -> HistoryResult<RowWrite> {
        let row = NewPresence {
            node: node.clone(),
            slot,
            address: address.ip,
            port: address.port,
            at: self.at(),
        };
        match self.store.insert_presence(row.clone()) {
            Ok(_) => Ok(RowWrite::Created),
            Err(e) if e.is_duplicate() => {
                let ids = self.store.find_presence(&row).map_err(|e| {
                    ExecutionError::storage(format!("look up {slot} {address} for {node}"), e)
                })?;
                first_match(&ids, slot.table_name(), node)?;
                Ok(RowWrite::Recovered)
            }
            Err(e) => Err(
                ExecutionError::storage(format!("insert {slot} {address} for {node}"), e).into(),
            ),
        }
    }
}

fn first_match<T: Copy + fmt::Debug>(
    ids: &[T],
    table: &str,
    node: &NodeIdentity,
) -> HistoryResult<T> {
    let Some(first) = ids.first().copied() else {
        return Err(ExecutionError::DuplicateWithoutRow {
            table: table.to_string(),
            value: node.to_string(),
        }
        .into());
    };
    if ids.len() > 1 {
        warn!(table, %node, matches = ids.len(), first = ?first, "multiple rows for unique key; using the first");
    }
    Ok(first)
}
