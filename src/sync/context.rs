//! Run-scoped state shared by every node reconciliation.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

use crate::config::SyncConfig;
use crate::dimension::DimensionCache;
use crate::error::{HistoryError, HistoryResult};
use crate::index::{LatestSnapshotIndex, PresenceIndexSet};
use crate::node::NodeIdentity;
use crate::storage::HistoryStore;
use crate::time::ReferenceInstant;

/// Everything a run reads while reconciling: the fixed reference instant, the
/// dimension cache and the indices loaded as of that instant.
#[derive(Debug)]
pub struct SyncContext {
    reference: ReferenceInstant,
    cache: DimensionCache,
    latest: LatestSnapshotIndex,
    presence: PresenceIndexSet,
    reconciled: Mutex<HashSet<NodeIdentity>>,
}

impl SyncContext {
    /// Builds the context for a run at `reference`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load(
        store: &dyn HistoryStore,
        reference: ReferenceInstant,
        config: &SyncConfig,
    ) -> HistoryResult<Self> {
        let cache = DimensionCache::new();
        if config.warm_dimension_caches {
            let loaded = cache.warm(store)?;
            debug!(loaded, "dimension cache warmed");
        }
        let at = reference.as_datetime();
        let latest = LatestSnapshotIndex::load(store, &cache, at)?;
        let presence = PresenceIndexSet::load(store, at)?;
        Ok(Self {
            reference,
            cache,
            latest,
            presence,
            reconciled: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub const fn reference(&self) -> ReferenceInstant {
        self.reference
    }

    #[must_use]
    pub const fn cache(&self) -> &DimensionCache {
        &self.cache
    }

    #[must_use]
    pub const fn latest(&self) -> &LatestSnapshotIndex {
        &self.latest
    }

    #[must_use]
    pub const fn presence(&self) -> &PresenceIndexSet {
        &self.presence
    }

    /// Records that `node` is being reconciled. Returns false if it already was
    /// during this run.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn mark_reconciled(&self, node: &NodeIdentity) -> HistoryResult<bool> {
        let mut guard = self
            .reconciled
            .lock()
            .map_err(|_| HistoryError::internal("poisoned lock: reconciled nodes"))?;
        Ok(guard.insert(node.clone()))
    }

    /// Number of distinct nodes reconciled so far.
    #[must_use]
    pub fn reconciled_count(&self) -> usize {
        self.reconciled.lock().map(|guard| guard.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKind;
    use crate::storage::InMemoryHistoryStore;
    use chrono::{TimeZone, Utc};

    fn reference() -> ReferenceInstant {
        ReferenceInstant::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_mark_reconciled_once() {
        let store = InMemoryHistoryStore::new();
        let ctx = SyncContext::load(&store, reference(), &SyncConfig::default()).unwrap();
        let node = NodeIdentity::new("ABCD").unwrap();
        assert!(ctx.mark_reconciled(&node).unwrap());
        assert!(!ctx.mark_reconciled(&node).unwrap());
        assert_eq!(ctx.reconciled_count(), 1);
    }

    #[test]
    fn test_warm_start_is_optional() {
        let store = InMemoryHistoryStore::new();
        DimensionCache::new()
            .resolve(&store, DimensionKind::City, "Tallinn")
            .unwrap();

        let warm = SyncContext::load(&store, reference(), &SyncConfig::default()).unwrap();
        assert_eq!(warm.cache().len(DimensionKind::City), 1);

        let config = SyncConfig {
            warm_dimension_caches: false,
            ..SyncConfig::default()
        };
        let cold = SyncContext::load(&store, reference(), &config).unwrap();
        assert_eq!(cold.cache().len(DimensionKind::City), 0);
        assert!(cold.latest().is_empty());
    }
}
