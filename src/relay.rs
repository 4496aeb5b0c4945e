//! Decoded snapshot documents.
//!
//! These types mirror the upstream details document field names. Fields the
//! engine does not normalize are kept verbatim and end up in the stored
//! version's payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::address::{AddressRole, AddressSlot, ParsedAddress};
use crate::dimension::CountryCode;
use crate::error::{ExecutionError, HistoryResult, ValidationError};
use crate::node::{AttributeSet, NodeIdentity};

/// `YYYY-MM-DD hh:mm:ss` timestamps, always UTC.
pub mod feed_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_str(&at.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(text) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        NaiveDateTime::parse_from_str(text, FORMAT)
            .map(|naive| Some(naive.and_utc()))
            .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{text}': {e}")))
    }
}

/// Document-level metadata of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build_revision: Option<String>,
    #[serde(default, with = "feed_time")]
    pub relays_published: Option<DateTime<Utc>>,
    #[serde(default, with = "feed_time")]
    pub bridges_published: Option<DateTime<Utc>>,
}

/// A whole details document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build_revision: Option<String>,
    #[serde(default, with = "feed_time")]
    pub relays_published: Option<DateTime<Utc>>,
    #[serde(default, with = "feed_time")]
    pub bridges_published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub relays: Vec<RelayRecord>,
}

impl Snapshot {
    /// Parses a details document.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Serialization` if the document is not valid.
    pub fn from_json(text: &str) -> HistoryResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            ExecutionError::Serialization {
                field: "snapshot".to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Splits the document into its header and relay records.
    #[must_use]
    pub fn into_parts(self) -> (SnapshotHeader, Vec<RelayRecord>) {
        let header = SnapshotHeader {
            version: self.version,
            build_revision: self.build_revision,
            relays_published: self.relays_published,
            bridges_published: self.bridges_published,
        };
        (header, self.relays)
    }
}

/// One relay entry of a details document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_address: Option<String>,
    #[serde(default, with = "feed_time", skip_serializing_if = "Option::is_none")]
    pub last_changed_address_or_port: Option<DateTime<Utc>>,
    #[serde(default, with = "feed_time", skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_policy: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_policy_summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_policy_v6_summary: Option<Value>,
    /// Everything else in the entry, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelayRecord {
    /// The node this record describes.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` if the fingerprint is empty.
    pub fn identity(&self) -> Result<NodeIdentity, ValidationError> {
        NodeIdentity::new(&self.fingerprint)
    }

    /// Normalized country code, if the record carries one.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidCountryCode` for anything but two letters.
    pub fn country_code(&self) -> Result<Option<CountryCode>, ValidationError> {
        match non_empty(self.country.as_deref()) {
            Some(code) => CountryCode::new(code).map(Some),
            None => Ok(None),
        }
    }

    /// Text-level attributes compared by the change detector.
    ///
    /// # Errors
    ///
    /// Returns an error if the country code is malformed or a structured field
    /// cannot be serialized.
    pub fn attributes(&self) -> HistoryResult<AttributeSet> {
        Ok(AttributeSet {
            nickname: non_empty(self.nickname.as_deref()).map(str::to_string),
            country: self.country_code()?,
            region: non_empty(self.region_name.as_deref()).map(str::to_string),
            city: non_empty(self.city_name.as_deref()).map(str::to_string),
            platform: non_empty(self.platform.as_deref()).map(str::to_string),
            version: non_empty(self.version.as_deref()).map(str::to_string),
            contact: non_empty(self.contact.as_deref().map(str::trim)).map(str::to_string),
            last_changed_address_or_port: self.last_changed_address_or_port,
            first_seen: self.first_seen,
            exit_policy: self
                .exit_policy
                .as_ref()
                .map(|lines| canonical_json("exit_policy", &Value::from(lines.clone())))
                .transpose()?,
            exit_policy_summary: self
                .exit_policy_summary
                .as_ref()
                .map(|v| canonical_json("exit_policy_summary", v))
                .transpose()?,
            exit_policy_v6_summary: self
                .exit_policy_v6_summary
                .as_ref()
                .map(|v| canonical_json("exit_policy_v6_summary", v))
                .transpose()?,
        })
    }

    /// Parsed addresses per slot, with repeated entries collapsed.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidAddress` for an unparseable entry.
    pub fn addresses(&self) -> Result<Vec<(AddressSlot, ParsedAddress)>, ValidationError> {
        let entries = self
            .or_addresses
            .iter()
            .map(|a| (AddressRole::OnionRouting, a.as_str()))
            .chain(self.exit_addresses.iter().map(|a| (AddressRole::Exit, a.as_str())))
            .chain(
                self.dir_address
                    .iter()
                    .map(|a| (AddressRole::Directory, a.as_str())),
            );

        let mut out: Vec<(AddressSlot, ParsedAddress)> = Vec::new();
        for (role, text) in entries {
            if text.trim().is_empty() {
                continue;
            }
            let parsed = ParsedAddress::parse(role, text)?;
            let entry = (parsed.slot(role), parsed);
            if !out.contains(&entry) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// The structured payload stored with a new version: every field that is
    /// not normalized into its own column.
    #[must_use]
    pub fn payload(&self) -> Value {
        let mut payload = self.extra.clone();
        if !self.or_addresses.is_empty() {
            payload.insert("or_addresses".to_string(), Value::from(self.or_addresses.clone()));
        }
        if !self.exit_addresses.is_empty() {
            payload.insert(
                "exit_addresses".to_string(),
                Value::from(self.exit_addresses.clone()),
            );
        }
        if let Some(dir) = &self.dir_address {
            payload.insert("dir_address".to_string(), Value::from(dir.clone()));
        }
        canonicalize(&Value::Object(payload))
    }
}

/// Import-log row written once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub run_id: Uuid,
    pub feed_version: Option<String>,
    pub build_revision: Option<String>,
    pub relays_published: Option<DateTime<Utc>>,
    pub bridges_published: Option<DateTime<Utc>>,
    pub reference: DateTime<Utc>,
    pub relay_count: usize,
}

impl ImportRecord {
    #[must_use]
    pub fn new(header: &SnapshotHeader, reference: DateTime<Utc>, relay_count: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            feed_version: header.version.clone(),
            build_revision: header.build_revision.clone(),
            relays_published: header.relays_published,
            bridges_published: header.bridges_published,
            reference,
            relay_count,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Rebuilds `value` with every object's keys in sorted order.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_json(field: &str, value: &Value) -> HistoryResult<String> {
    serde_json::to_string(&canonicalize(value)).map_err(|e| {
        ExecutionError::Serialization {
            field: field.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}
