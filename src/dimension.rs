//! Normalized attribute dimensions and their run-scoped cache.
//!
//! Repeated free-text attributes (platform strings, contact lines, exit
//! policies, ...) are stored once per distinct text in a dimension table and
//! referenced by a small identifier. Country codes are their own identifier.
//!
//! The [`DimensionCache`] is the only writer of dimension rows. A uniqueness
//! rejection on insert means another run (or an earlier pass without a warm
//! cache) already created the row; the cache then looks the row up instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{ExecutionError, HistoryError, HistoryResult, ValidationError};
use crate::storage::HistoryStore;

/// Surrogate-keyed attribute kinds, each bound to its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Region,
    City,
    Platform,
    Version,
    Contact,
    ExitPolicy,
    ExitPolicySummary,
    ExitPolicyV6Summary,
}

impl DimensionKind {
    /// Every surrogate-keyed kind.
    pub const ALL: [Self; 8] = [
        Self::Region,
        Self::City,
        Self::Platform,
        Self::Version,
        Self::Contact,
        Self::ExitPolicy,
        Self::ExitPolicySummary,
        Self::ExitPolicyV6Summary,
    ];

    /// Name of the backing table.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Region => "regions",
            Self::City => "cities",
            Self::Platform => "platforms",
            Self::Version => "versions",
            Self::Contact => "contacts",
            Self::ExitPolicy => "exit_policies",
            Self::ExitPolicySummary => "exit_policy_summaries",
            Self::ExitPolicyV6Summary => "exit_policy_v6_summaries",
        }
    }

    /// Attribute name as it appears in diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Region => "region",
            Self::City => "city",
            Self::Platform => "platform",
            Self::Version => "version",
            Self::Contact => "contact",
            Self::ExitPolicy => "exit_policy",
            Self::ExitPolicySummary => "exit_policy_summary",
            Self::ExitPolicyV6Summary => "exit_policy_v6_summary",
        }
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-assigned identifier of a dimension row. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionId(pub u64);

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lower-case two-letter country code; doubles as the country's identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode(String);

impl CountryCode {
    /// Normalizes and validates a country code.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidCountryCode` unless the trimmed input is
    /// exactly two ASCII letters.
    pub fn new(code: impl AsRef<str>) -> Result<Self, ValidationError> {
        let code = code.as_ref().trim();
        if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(ValidationError::InvalidCountryCode {
                code: code.to_string(),
            });
        }
        Ok(Self(code.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CountryCode {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CountryCode> for String {
    fn from(code: CountryCode) -> Self {
        code.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn poisoned(context: &'static str) -> HistoryError {
    HistoryError::internal(format!("poisoned lock: {context}"))
}

/// Run-scoped cache mapping dimension text to identifiers.
///
/// Entries are never evicted. Each map is guarded by its own lock so the cache
/// is `Send + Sync`.
#[derive(Debug, Default)]
pub struct DimensionCache {
    ids: RwLock<HashMap<DimensionKind, HashMap<String, DimensionId>>>,
    texts: RwLock<HashMap<(DimensionKind, DimensionId), String>>,
    countries: RwLock<HashMap<CountryCode, String>>,
    created: AtomicUsize,
}

impl DimensionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-loads every dimension table and the country table.
    ///
    /// Returns the number of entries loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn warm(&self, store: &dyn HistoryStore) -> HistoryResult<usize> {
        let mut loaded = 0;
        for kind in DimensionKind::ALL {
            let rows = store
                .load_dimensions(kind)
                .map_err(|e| ExecutionError::storage(format!("load {}", kind.table_name()), e))?;
            for (id, text) in rows {
                self.remember(kind, &text, id)?;
                loaded += 1;
            }
        }

        let countries = store
            .load_countries()
            .map_err(|e| ExecutionError::storage("load countries", e))?;
        let mut guard = self.countries.write().map_err(|_| poisoned("countries"))?;
        for (code, name) in countries {
            guard.insert(code, name);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Resolves `text` of `kind` to its identifier, creating the row if needed.
    ///
    /// # Errors
    ///
    /// Returns an error for any store failure other than a uniqueness conflict,
    /// e.g. a value too long for its column.
    pub fn resolve(
        &self,
        store: &dyn HistoryStore,
        kind: DimensionKind,
        text: &str,
    ) -> HistoryResult<DimensionId> {
        if let Some(id) = self.cached(kind, text)? {
            trace!(%kind, id = id.0, "dimension cache hit");
            return Ok(id);
        }

        let id = match store.insert_dimension(kind, text) {
            Ok(id) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                id
            }
            Err(e) if e.is_duplicate() => self.lookup_existing(store, kind, text)?,
            Err(e) => {
                return Err(
                    ExecutionError::storage(format!("insert into {}", kind.table_name()), e).into(),
                )
            }
        };

        self.remember(kind, text, id)?;
        Ok(id)
    }

    /// Resolves an optional attribute; absent or empty text has no identifier.
    ///
    /// # Errors
    ///
    /// See [`DimensionCache::resolve`].
    pub fn resolve_optional(
        &self,
        store: &dyn HistoryStore,
        kind: DimensionKind,
        text: Option<&str>,
    ) -> HistoryResult<Option<DimensionId>> {
        match text {
            Some(t) if !t.is_empty() => self.resolve(store, kind, t).map(Some),
            _ => Ok(None),
        }
    }

    /// Looks up a country code without ever creating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn resolve_country(
        &self,
        store: &dyn HistoryStore,
        code: &CountryCode,
    ) -> HistoryResult<Option<CountryCode>> {
        if self
            .countries
            .read()
            .map_err(|_| poisoned("countries"))?
            .contains_key(code)
        {
            return Ok(Some(code.clone()));
        }

        let found = store
            .find_country(code)
            .map_err(|e| ExecutionError::storage("find country", e))?;
        match found {
            Some(name) => {
                self.countries
                    .write()
                    .map_err(|_| poisoned("countries"))?
                    .insert(code.clone(), name);
                Ok(Some(code.clone()))
            }
            None => Ok(None),
        }
    }

    /// Creates a country row with its display name.
    ///
    /// Registering an already-present code is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error for store failures other than a uniqueness conflict.
    pub fn register_country(
        &self,
        store: &dyn HistoryStore,
        code: &CountryCode,
        name: &str,
    ) -> HistoryResult<CountryCode> {
        let stored_name = match store.insert_country(code, name) {
            Ok(()) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                name.to_string()
            }
            Err(e) if e.is_duplicate() => store
                .find_country(code)
                .map_err(|e| ExecutionError::storage("find country", e))?
                .ok_or_else(|| ExecutionError::DuplicateWithoutRow {
                    table: "countries".to_string(),
                    value: code.to_string(),
                })?,
            Err(e) => return Err(ExecutionError::storage("insert into countries", e).into()),
        };

        self.countries
            .write()
            .map_err(|_| poisoned("countries"))?
            .insert(code.clone(), stored_name);
        Ok(code.clone())
    }

    /// Returns the display name of a registered country.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn country_name(
        &self,
        store: &dyn HistoryStore,
        code: &CountryCode,
    ) -> HistoryResult<Option<String>> {
        if let Some(name) = self
            .countries
            .read()
            .map_err(|_| poisoned("countries"))?
            .get(code)
        {
            return Ok(Some(name.clone()));
        }
        if self.resolve_country(store, code)?.is_none() {
            return Ok(None);
        }
        Ok(self
            .countries
            .read()
            .map_err(|_| poisoned("countries"))?
            .get(code)
            .cloned())
    }

    /// Reverse lookup: the text behind an identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn text_of(
        &self,
        store: &dyn HistoryStore,
        kind: DimensionKind,
        id: DimensionId,
    ) -> HistoryResult<Option<String>> {
        if let Some(text) = self
            .texts
            .read()
            .map_err(|_| poisoned("dimension texts"))?
            .get(&(kind, id))
        {
            return Ok(Some(text.clone()));
        }

        let text = store
            .dimension_text(kind, id)
            .map_err(|e| ExecutionError::storage(format!("read {}", kind.table_name()), e))?;
        if let Some(t) = &text {
            self.remember(kind, t, id)?;
        }
        Ok(text)
    }

    /// Number of dimension and country rows this cache created.
    #[must_use]
    pub fn rows_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of cached entries for `kind`.
    #[must_use]
    pub fn len(&self, kind: DimensionKind) -> usize {
        self.ids
            .read()
            .map(|guard| guard.get(&kind).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    fn cached(&self, kind: DimensionKind, text: &str) -> HistoryResult<Option<DimensionId>> {
        let guard = self.ids.read().map_err(|_| poisoned("dimension ids"))?;
        Ok(guard.get(&kind).and_then(|m| m.get(text)).copied())
    }

    fn remember(&self, kind: DimensionKind, text: &str, id: DimensionId) -> HistoryResult<()> {
        self.ids
            .write()
            .map_err(|_| poisoned("dimension ids"))?
            .entry(kind)
            .or_default()
            .insert(text.to_string(), id);
        self.texts
            .write()
            .map_err(|_| poisoned("dimension texts"))?
            .insert((kind, id), text.to_string());
        Ok(())
    }

    fn lookup_existing(
        &self,
        store: &dyn HistoryStore,
        kind: DimensionKind,
        text: &str,
    ) -> HistoryResult<DimensionId> {
        let ids = store
            .find_dimension(kind, text)
            .map_err(|e| ExecutionError::storage(format!("lookup in {}", kind.table_name()), e))?;
        let Some(first) = ids.first().copied() else {
            return Err(ExecutionError::DuplicateWithoutRow {
                table: kind.table_name().to_string(),
                value: text.to_string(),
            }
            .into());
        };
        if ids.len() > 1 {
            warn!(
                table = kind.table_name(),
                matches = ids.len(),
                id = first.0,
                "multiple rows for unique dimension value; using the first"
            );
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreLimits;
    use crate::storage::InMemoryHistoryStore;

    #[test]
    fn test_country_code_normalizes() {
        let code = CountryCode::new(" US ").unwrap();
        assert_eq!(code.as_str(), "us");
        assert!(CountryCode::new("usa").is_err());
        assert!(CountryCode::new("u1").is_err());
        assert!(CountryCode::new("").is_err());
    }

    #[test]
    fn test_country_code_serde_validates() {
        let code: CountryCode = serde_json::from_str("\"DE\"").unwrap();
        assert_eq!(code.as_str(), "de");
        assert!(serde_json::from_str::<CountryCode>("\"deu\"").is_err());
    }

    #[test]
    fn test_resolve_dedups() {
        let store = InMemoryHistoryStore::new();
        let cache = DimensionCache::new();

        let a = cache.resolve(&store, DimensionKind::Platform, "Tor 0.4.8.10 on Linux").unwrap();
        for _ in 0..5 {
            let b = cache
                .resolve(&store, DimensionKind::Platform, "Tor 0.4.8.10 on Linux")
                .unwrap();
            assert_eq!(a, b);
        }
        assert_eq!(store.counts().dimensions, 1);
        assert_eq!(cache.rows_created(), 1);
    }

    #[test]
    fn test_resolve_cache_hit_skips_store() {
        let store = InMemoryHistoryStore::new();
        let cache = DimensionCache::new();
        cache.resolve(&store, DimensionKind::City, "Berlin").unwrap();

        let before = store.stats();
        cache.resolve(&store, DimensionKind::City, "Berlin").unwrap();
        assert_eq!(store.stats(), before);
    }

    #[test]
    fn test_resolve_duplicate_falls_back_to_lookup() {
        let store = InMemoryHistoryStore::new();
        let first = DimensionCache::new();
        let id = first.resolve(&store, DimensionKind::Contact, "ops@example.org").unwrap();

        // A cold cache sees a uniqueness rejection and recovers the same id.
        let second = DimensionCache::new();
        let again = second
            .resolve(&store, DimensionKind::Contact, "ops@example.org")
            .unwrap();
        assert_eq!(id, again);
        assert_eq!(second.rows_created(), 0);
        assert_eq!(store.counts().dimensions, 1);
    }

    #[test]
    fn test_resolve_multiple_matches_uses_first() {
        let store = InMemoryHistoryStore::new();
        let first = store.force_dimension_row(DimensionKind::Region, "Texas");
        store.force_dimension_row(DimensionKind::Region, "Texas");

        let cache = DimensionCache::new();
        let id = cache.resolve(&store, DimensionKind::Region, "Texas").unwrap();
        assert_eq!(id, first);
        assert_eq!(cache.rows_created(), 0);
    }

    #[test]
    fn test_resolve_kinds_are_independent() {
        let store = InMemoryHistoryStore::new();
        let cache = DimensionCache::new();
        let region = cache.resolve(&store, DimensionKind::Region, "Bavaria").unwrap();
        let city = cache.resolve(&store, DimensionKind::City, "Bavaria").unwrap();
        assert_eq!(store.counts().dimensions, 2);
        assert_eq!(cache.text_of(&store, DimensionKind::Region, region).unwrap().as_deref(), Some("Bavaria"));
        assert_eq!(cache.text_of(&store, DimensionKind::City, city).unwrap().as_deref(), Some("Bavaria"));
    }

    #[test]
    fn test_resolve_too_long_is_fatal() {
        let limits = StoreLimits {
            version: 8,
            ..StoreLimits::default()
        };
        let store = InMemoryHistoryStore::with_limits(limits);
        let cache = DimensionCache::new();
        let err = cache
            .resolve(&store, DimensionKind::Version, "0.4.8.10-dev-long")
            .unwrap_err();
        assert!(err.is_execution());
        assert!(!err.is_retryable());
        assert_eq!(store.counts().dimensions, 0);
    }

    #[test]
    fn test_resolve_optional_empty_is_none() {
        let store = InMemoryHistoryStore::new();
        let cache = DimensionCache::new();
        assert_eq!(cache.resolve_optional(&store, DimensionKind::City, None).unwrap(), None);
        assert_eq!(cache.resolve_optional(&store, DimensionKind::City, Some("")).unwrap(), None);
        assert_eq!(store.counts().dimensions, 0);
    }

    #[test]
    fn test_country_resolve_before_and_after_register() {
        let store = InMemoryHistoryStore::new();
        let cache = DimensionCache::new();
        let us = CountryCode::new("us").unwrap();

        assert_eq!(cache.resolve_country(&store, &us).unwrap(), None);
        assert_eq!(store.counts().countries, 0);

        let registered = cache.register_country(&store, &us, "United States of America").unwrap();
        assert_eq!(registered.as_str(), "us");
        assert_eq!(cache.resolve_country(&store, &us).unwrap(), Some(us.clone()));
        assert_eq!(
            cache.country_name(&store, &us).unwrap().as_deref(),
            Some("United States of America")
        );

        // Registering again keeps the first name.
        cache.register_country(&store, &us, "USA").unwrap();
        assert_eq!(store.counts().countries, 1);
    }

    #[test]
    fn test_warm_loads_existing_rows() {
        let store = InMemoryHistoryStore::new();
        let seed = DimensionCache::new();
        let platform = seed.resolve(&store, DimensionKind::Platform, "Tor 0.4.8.10").unwrap();
        seed.register_country(&store, &CountryCode::new("de").unwrap(), "Germany")
            .unwrap();

        let cache = DimensionCache::new();
        assert_eq!(cache.warm(&store).unwrap(), 2);
        assert_eq!(cache.len(DimensionKind::Platform), 1);

        let before = store.stats();
        assert_eq!(
            cache.resolve(&store, DimensionKind::Platform, "Tor 0.4.8.10").unwrap(),
            platform
        );
        assert!(cache
            .resolve_country(&store, &CountryCode::new("de").unwrap())
            .unwrap()
            .is_some());
        assert_eq!(store.stats(), before);
    }
}
