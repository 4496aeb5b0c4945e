//! Node identities and historical attribute versions.
//!
//! A node is identified by its fingerprint for life. Its attributes are kept as
//! a chain of [`NodeVersion`] rows: a new row is written when an attribute
//! genuinely changes, and the validity of the current row is stretched in
//! place while the attributes stay the same.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::{CountryCode, DimensionId, DimensionKind};
use crate::error::ValidationError;

/// Globally unique, immutable node fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Creates a node identity from a fingerprint, trimming surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` if the fingerprint is empty.
    pub fn new(fingerprint: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = fingerprint.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingField {
                field: "fingerprint".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the fingerprint text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned identifier of a [`NodeVersion`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeVersionId(pub u64);

impl fmt::Display for NodeVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolved dimension identifiers carried by a version row.
///
/// `None` means the attribute was absent in the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRefs {
    pub country: Option<CountryCode>,
    pub region: Option<DimensionId>,
    pub city: Option<DimensionId>,
    pub platform: Option<DimensionId>,
    pub version: Option<DimensionId>,
    pub contact: Option<DimensionId>,
    pub exit_policy: Option<DimensionId>,
    pub exit_policy_summary: Option<DimensionId>,
    pub exit_policy_v6_summary: Option<DimensionId>,
}

impl DimensionRefs {
    /// Returns the identifier stored for a surrogate-keyed kind.
    #[must_use]
    pub const fn get(&self, kind: DimensionKind) -> Option<DimensionId> {
        match kind {
            DimensionKind::Region => self.region,
            DimensionKind::City => self.city,
            DimensionKind::Platform => self.platform,
            DimensionKind::Version => self.version,
            DimensionKind::Contact => self.contact,
            DimensionKind::ExitPolicy => self.exit_policy,
            DimensionKind::ExitPolicySummary => self.exit_policy_summary,
            DimensionKind::ExitPolicyV6Summary => self.exit_policy_v6_summary,
        }
    }

    /// Sets the identifier for a surrogate-keyed kind.
    pub fn set(&mut self, kind: DimensionKind, id: Option<DimensionId>) {
        let slot = match kind {
            DimensionKind::Region => &mut self.region,
            DimensionKind::City => &mut self.city,
            DimensionKind::Platform => &mut self.platform,
            DimensionKind::Version => &mut self.version,
            DimensionKind::Contact => &mut self.contact,
            DimensionKind::ExitPolicy => &mut self.exit_policy,
            DimensionKind::ExitPolicySummary => &mut self.exit_policy_summary,
            DimensionKind::ExitPolicyV6Summary => &mut self.exit_policy_v6_summary,
        };
        *slot = id;
    }
}

/// One historical attribute row of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVersion {
    pub id: NodeVersionId,
    pub node: NodeIdentity,
    pub dimensions: DimensionRefs,
    pub nickname: Option<String>,
    pub last_changed_address_or_port: Option<DateTime<Utc>>,
    pub first_seen: Option<DateTime<Utc>>,
    pub flags: Vec<String>,
    /// Decoded record fields that are not normalized into columns.
    pub payload: serde_json::Value,
    pub inserted_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
}

/// A version row about to be inserted.
///
/// Both engine timestamps of the new row are set to `at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNodeVersion {
    pub node: NodeIdentity,
    pub dimensions: DimensionRefs,
    pub nickname: Option<String>,
    pub last_changed_address_or_port: Option<DateTime<Utc>>,
    pub first_seen: Option<DateTime<Utc>>,
    pub flags: Vec<String>,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl NewNodeVersion {
    /// Materializes the row with the identifier assigned by the store.
    #[must_use]
    pub fn into_version(self, id: NodeVersionId) -> NodeVersion {
        NodeVersion {
            id,
            node: self.node,
            dimensions: self.dimensions,
            nickname: self.nickname,
            last_changed_address_or_port: self.last_changed_address_or_port,
            first_seen: self.first_seen,
            flags: self.flags,
            payload: self.payload,
            inserted_at: self.at,
            last_confirmed_at: self.at,
        }
    }
}

/// Text-level view of the attributes the change detector compares.
///
/// Dimension-backed attributes hold their text, not their identifier, so an
/// incoming record can be compared with a stored version without resolving
/// anything. Structured fields hold their canonical JSON serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSet {
    pub nickname: Option<String>,
    pub country: Option<CountryCode>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
    pub contact: Option<String>,
    pub last_changed_address_or_port: Option<DateTime<Utc>>,
    pub first_seen: Option<DateTime<Utc>>,
    pub exit_policy: Option<String>,
    pub exit_policy_summary: Option<String>,
    pub exit_policy_v6_summary: Option<String>,
}

impl AttributeSet {
    /// Returns the text held for a surrogate-keyed kind.
    #[must_use]
    pub fn dimension_text(&self, kind: DimensionKind) -> Option<&str> {
        let value = match kind {
            DimensionKind::Region => &self.region,
            DimensionKind::City => &self.city,
            DimensionKind::Platform => &self.platform,
            DimensionKind::Version => &self.version,
            DimensionKind::Contact => &self.contact,
            DimensionKind::ExitPolicy => &self.exit_policy,
            DimensionKind::ExitPolicySummary => &self.exit_policy_summary,
            DimensionKind::ExitPolicyV6Summary => &self.exit_policy_v6_summary,
        };
        value.as_deref()
    }

    /// Sets the text for a surrogate-keyed kind.
    pub fn set_dimension_text(&mut self, kind: DimensionKind, text: Option<String>) {
        let slot = match kind {
            DimensionKind::Region => &mut self.region,
            DimensionKind::City => &mut self.city,
            DimensionKind::Platform => &mut self.platform,
            DimensionKind::Version => &mut self.version,
            DimensionKind::Contact => &mut self.contact,
            DimensionKind::ExitPolicy => &mut self.exit_policy,
            DimensionKind::ExitPolicySummary => &mut self.exit_policy_summary,
            DimensionKind::ExitPolicyV6Summary => &mut self.exit_policy_v6_summary,
        };
        *slot = text;
    }
}

/// A stored version joined with the text of its dimension values.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedVersion {
    pub version: NodeVersion,
    pub attributes: AttributeSet,
}
