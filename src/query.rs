//! Read-side queries over the history tables.
//!
//! Every result is a [`RelayView`]: a stored version joined with its
//! dimension texts, its country's display name and the address rows that
//! overlap its validity interval. Malformed country codes or addresses yield
//! an empty result rather than an error.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::address::{AddressFamily, AddressPresence, AddressRole, AddressSlot};
use crate::dimension::{CountryCode, DimensionCache};
use crate::error::{ExecutionError, HistoryResult};
use crate::index::resolve_version;
use crate::node::{AttributeSet, NodeIdentity, NodeVersion};
use crate::storage::HistoryStore;

/// A version as presented to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayView {
    pub version: NodeVersion,
    pub attributes: AttributeSet,
    pub country_name: Option<String>,
    pub addresses: Vec<AddressPresence>,
}

/// Query interface bound to a store.
pub struct HistoryQuery {
    store: Arc<dyn HistoryStore>,
    cache: DimensionCache,
}

impl std::fmt::Debug for HistoryQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryQuery")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl HistoryQuery {
    #[must_use]
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            cache: DimensionCache::new(),
        }
    }

    /// Nodes whose current version is located in `code`.
    ///
    /// `code` must already be lower case, as stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn by_country(&self, code: &str) -> HistoryResult<Vec<RelayView>> {
        if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_lowercase()) {
            return Ok(Vec::new());
        }
        let Ok(code) = CountryCode::new(code) else {
            return Ok(Vec::new());
        };
        self.current(Utc::now())?
            .into_iter()
            .filter(|version| version.dimensions.country.as_ref() == Some(&code))
            .map(|version| self.view(version))
            .collect()
    }

    /// Current versions of every node that ever used `address` in any role.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn by_address(&self, address: &str) -> HistoryResult<Vec<RelayView>> {
        let text = address.trim();
        let text = text
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .unwrap_or(text);
        let Ok(ip) = text.parse::<IpAddr>() else {
            return Ok(Vec::new());
        };

        let family = AddressFamily::of(&ip);
        let mut nodes = BTreeSet::new();
        for role in AddressRole::ALL {
            let slot = AddressSlot::new(role, family);
            let rows = self
                .store
                .presence_by_address(slot, ip)
                .map_err(|e| ExecutionError::storage(format!("query {slot} for {ip}"), e))?;
            nodes.extend(rows.into_iter().map(|row| row.node));
        }

        self.current(Utc::now())?
            .into_iter()
            .filter(|version| nodes.contains(&version.node))
            .map(|version| self.view(version))
            .collect()
    }

    /// Nodes whose current contact line contains `needle`, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn by_contact(&self, needle: &str) -> HistoryResult<Vec<RelayView>> {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for version in self.current(Utc::now())? {
            if version.dimensions.contact.is_none() {
                continue;
            }
            let view = self.view(version)?;
            let matches = view
                .attributes
                .contact
                .as_deref()
                .is_some_and(|contact| contact.to_lowercase().contains(&needle));
            if matches {
                out.push(view);
            }
        }
        Ok(out)
    }

    /// What `node` looked like at `at`: its latest version inserted at or
    /// before that instant.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn as_of(&self, node: &NodeIdentity, at: DateTime<Utc>) -> HistoryResult<Option<RelayView>> {
        let version = self
            .versions(node)?
            .into_iter()
            .filter(|version| version.inserted_at <= at)
            .max_by_key(|version| (version.inserted_at, version.id));
        version.map(|v| self.view(v)).transpose()
    }

    /// Every version of `node`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn history(&self, node: &NodeIdentity) -> HistoryResult<Vec<RelayView>> {
        self.versions(node)?
            .into_iter()
            .map(|version| self.view(version))
            .collect()
    }

    fn versions(&self, node: &NodeIdentity) -> HistoryResult<Vec<NodeVersion>> {
        self.store
            .node_versions(node)
            .map_err(|e| ExecutionError::storage(format!("query versions of {node}"), e).into())
    }

    fn current(&self, at: DateTime<Utc>) -> HistoryResult<Vec<NodeVersion>> {
        let mut versions = self
            .store
            .latest_node_versions(at)
            .map_err(|e| ExecutionError::storage("query current versions", e))?;
        versions.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(versions)
    }

    fn view(&self, version: NodeVersion) -> HistoryResult<RelayView> {
        let store = self.store.as_ref();
        let country_name = match &version.dimensions.country {
            Some(code) => self.cache.country_name(store, code)?,
            None => None,
        };

        let mut addresses = Vec::new();
        for slot in AddressSlot::ALL {
            let rows = store
                .node_presence(slot, &version.node)
                .map_err(|e| ExecutionError::storage(format!("query {slot} of {}", version.node), e))?;
            addresses.extend(rows.into_iter().filter(|row| {
                row.inserted_at <= version.last_confirmed_at
                    && row.last_confirmed_at >= version.inserted_at
            }));
        }

        let resolved = resolve_version(store, &self.cache, version)?;
        Ok(RelayView {
            version: resolved.version,
            attributes: resolved.attributes,
            country_name,
            addresses,
        })
    }
}
