//! Latest-snapshot index: the current version of every node as of a
//! reference instant, joined with its dimension texts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::dimension::{DimensionCache, DimensionKind};
use crate::error::{ExecutionError, HistoryResult};
use crate::node::{AttributeSet, NodeIdentity, NodeVersion, ResolvedVersion};
use crate::storage::HistoryStore;

/// Joins a stored version with the text behind its dimension identifiers.
///
/// # Errors
///
/// Returns an error if a dimension table cannot be read.
pub fn resolve_version(
    store: &dyn HistoryStore,
    cache: &DimensionCache,
    version: NodeVersion,
) -> HistoryResult<ResolvedVersion> {
    let mut attributes = AttributeSet {
        nickname: version.nickname.clone(),
        country: version.dimensions.country.clone(),
        last_changed_address_or_port: version.last_changed_address_or_port,
        first_seen: version.first_seen,
        ..AttributeSet::default()
    };
    for kind in DimensionKind::ALL {
        if let Some(id) = version.dimensions.get(kind) {
            attributes.set_dimension_text(kind, cache.text_of(store, kind, id)?);
        }
    }
    Ok(ResolvedVersion {
        version,
        attributes,
    })
}

/// Read-mostly map from node to its current [`ResolvedVersion`].
///
/// Built by one bulk query and never refreshed: each node is reconciled at
/// most once per run.
#[derive(Debug, Default)]
pub struct LatestSnapshotIndex {
    entries: HashMap<NodeIdentity, ResolvedVersion>,
}

impl LatestSnapshotIndex {
    /// Loads the version with the greatest last-confirmed-at not exceeding
    /// `at` for every node.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load(
        store: &dyn HistoryStore,
        cache: &DimensionCache,
        at: DateTime<Utc>,
    ) -> HistoryResult<Self> {
        let versions = store
            .latest_node_versions(at)
            .map_err(|e| ExecutionError::storage("load latest node versions", e))?;

        let mut entries = HashMap::with_capacity(versions.len());
        for version in versions {
            let resolved = resolve_version(store, cache, version)?;
            entries.insert(resolved.version.node.clone(), resolved);
        }
        debug!(nodes = entries.len(), %at, "latest-snapshot index loaded");
        Ok(Self { entries })
    }

    #[must_use]
    pub fn lookup(&self, node: &NodeIdentity) -> Option<&ResolvedVersion> {
        self.entries.get(node)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::CountryCode;
    use crate::node::{DimensionRefs, NewNodeVersion};
    use crate::storage::InMemoryHistoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_index_joins_dimension_text() {
        let store = InMemoryHistoryStore::new();
        let cache = DimensionCache::new();
        let us = cache
            .register_country(&store, &CountryCode::new("us").unwrap(), "United States")
            .unwrap();
        let platform = cache
            .resolve(&store, DimensionKind::Platform, "Tor 0.4.8.10 on Linux")
            .unwrap();

        let mut dimensions = DimensionRefs {
            country: Some(us.clone()),
            ..DimensionRefs::default()
        };
        dimensions.set(DimensionKind::Platform, Some(platform));
        let node = NodeIdentity::new("A1B2").unwrap();
        store
            .insert_node_version(NewNodeVersion {
                node: node.clone(),
                dimensions,
                nickname: Some("moria1".to_string()),
                last_changed_address_or_port: None,
                first_seen: Some(t0()),
                flags: vec!["Running".to_string()],
                payload: serde_json::json!({}),
                at: t0(),
            })
            .unwrap();

        let index = LatestSnapshotIndex::load(&store, &cache, t0()).unwrap();
        assert_eq!(index.len(), 1);
        let entry = index.lookup(&node).unwrap();
        assert_eq!(entry.attributes.nickname.as_deref(), Some("moria1"));
        assert_eq!(entry.attributes.country, Some(us));
        assert_eq!(entry.attributes.platform.as_deref(), Some("Tor 0.4.8.10 on Linux"));
        assert_eq!(entry.attributes.city, None);

        let earlier = LatestSnapshotIndex::load(&store, &cache, t0() - Duration::seconds(1)).unwrap();
        assert!(earlier.is_empty());
    }
}
