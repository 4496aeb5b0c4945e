//! The synchronization engine: one call per snapshot.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::{ExecutionError, HistoryResult};
use crate::relay::{ImportRecord, RelayRecord, Snapshot, SnapshotHeader};
use crate::storage::HistoryStore;
use crate::sync::context::SyncContext;
use crate::sync::reconcile::Reconciler;
use crate::sync::report::SyncReport;
use crate::time::{ReferenceInstant, ReferenceSource};

/// Applies snapshots to a [`HistoryStore`].
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use relay_history::{InMemoryHistoryStore, ReferenceSource, Snapshot, SyncEngine};
///
/// let engine = SyncEngine::with_defaults(Arc::new(InMemoryHistoryStore::new()));
/// let snapshot = Snapshot::from_json(&document)?;
/// let report = engine.run_snapshot(snapshot, &ReferenceSource::Now)?;
/// ```
pub struct SyncEngine {
    store: Arc<dyn HistoryStore>,
    config: SyncConfig,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Creates an engine after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unusable configuration.
    pub fn new(store: Arc<dyn HistoryStore>, config: SyncConfig) -> HistoryResult<Self> {
        let config = config.validate()?;
        Ok(Self { store, config })
    }

    #[must_use]
    pub fn with_defaults(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            config: SyncConfig::default(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Reconciles every record against the history as of `reference`.
    ///
    /// Nodes are committed one by one; on error the run stops and every node
    /// committed before the failure stays valid. Re-running the same input is
    /// idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error: malformed input or a store failure.
    pub fn run<I>(
        &self,
        header: &SnapshotHeader,
        records: I,
        reference: ReferenceInstant,
    ) -> HistoryResult<SyncReport>
    where
        I: IntoIterator<Item = RelayRecord>,
        I::IntoIter: ExactSizeIterator,
    {
        let records = records.into_iter();
        let total = records.len();
        let import = ImportRecord::new(header, reference.as_datetime(), total);
        let mut report = SyncReport::new(import.run_id, reference);
        info!(
            run_id = %import.run_id,
            %reference,
            relays = total,
            "synchronization started"
        );

        if self.config.record_imports {
            self.store
                .record_import(import)
                .map_err(|e| ExecutionError::storage("record import", e))?;
        }

        let store = self.store.as_ref();
        let ctx = SyncContext::load(store, reference, &self.config)?;
        debug!(
            known_nodes = ctx.latest().len(),
            "run context loaded"
        );
        let reconciler = Reconciler::new(store, &ctx);

        for (done, record) in records.enumerate() {
            let node = reconciler.reconcile(&record)?;
            report.absorb(&node);
            if (done + 1) % self.config.progress_interval == 0 {
                info!(processed = done + 1, total, "synchronization progress");
            }
        }
        report.dimension_rows_created = ctx.cache().rows_created();
        debug!(nodes = ctx.reconciled_count(), "distinct nodes reconciled");

        info!(
            run_id = %report.run_id,
            processed = report.processed(),
            confirmed = report.confirmed,
            extended = report.extended,
            superseded = report.superseded,
            skipped = report.skipped,
            presence_inserted = report.presence_inserted,
            presence_extended = report.presence_extended,
            dimension_rows_created = report.dimension_rows_created,
            "synchronization finished"
        );
        Ok(report)
    }

    /// Resolves the reference instant from `source` and runs a whole document.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the reference instant cannot be
    /// determined, otherwise see [`SyncEngine::run`].
    pub fn run_snapshot(
        &self,
        snapshot: Snapshot,
        source: &ReferenceSource,
    ) -> HistoryResult<SyncReport> {
        let reference = source.resolve()?;
        let (header, relays) = snapshot.into_parts();
        self.run(&header, relays, reference)
    }
}
