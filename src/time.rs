//! Reference instants for synchronization runs.
//!
//! Every run reconciles against one fixed instant. It is either the wall clock,
//! a timestamp supplied by the operator, or a timestamp embedded in the name of
//! the snapshot file being imported. All instants are truncated to whole
//! seconds so that repeated imports of the same snapshot compare equal.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default pattern used to pull timestamp candidates out of file names.
pub const DEFAULT_FILENAME_PATTERN: &str = "[0-9][0-9_:-]+[0-9]";

/// Formats tried, in order, when no explicit format is supplied.
///
/// Naive formats are interpreted as UTC. RFC 3339 and RFC 2822 are tried after
/// these.
pub const DEFAULT_FORMATS: &[&str] = &[
    "%Y-%m-%d_%H:%M:%S",
    "%Y-%m-%d_%H:%M",
    "%Y%m%d%H%M%S",
    "%Y%m%d%H%M",
    "%Y-%m-%d-%H-%M-%S",
    "%Y-%m-%d-%H-%M",
];

/// The fixed instant a synchronization run reconciles against.
///
/// # Examples
///
/// ```
/// use relay_history::ReferenceInstant;
/// use chrono::{TimeZone, Utc};
///
/// let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
/// let reference = ReferenceInstant::new(at);
/// assert_eq!(reference.as_datetime(), at);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferenceInstant(DateTime<Utc>);

impl ReferenceInstant {
    /// Creates a reference instant, dropping sub-second precision.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at.trunc_subsecs(0))
    }

    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    /// Parses a timestamp with `format`, or with the default format list when
    /// `format` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTimestamp` if no format matches.
    pub fn parse(text: &str, format: Option<&str>) -> Result<Self, ValidationError> {
        let text = text.trim();
        let parsed = match format {
            Some(fmt) => parse_with(text, fmt),
            None => parse_default(text),
        };
        parsed.map(Self::new).ok_or_else(|| ValidationError::InvalidTimestamp {
            candidates: vec![text.to_string()],
        })
    }

    /// Extracts the timestamp embedded in a snapshot file name.
    ///
    /// Every match of `pattern` is tried against the default formats; the first
    /// candidate that parses wins.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTimestampPattern` if the pattern does not
    /// compile, or `ValidationError::InvalidTimestamp` if no candidate parses.
    pub fn from_filename(filename: &str, pattern: Option<&str>) -> Result<Self, ValidationError> {
        let pattern = pattern.unwrap_or(DEFAULT_FILENAME_PATTERN);
        let re = Regex::new(pattern).map_err(|e| ValidationError::InvalidTimestampPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        // Only the final path component carries the timestamp.
        let name = filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(filename);

        let candidates: Vec<String> = re.find_iter(name).map(|m| m.as_str().to_string()).collect();
        candidates
            .iter()
            .find_map(|c| parse_default(c))
            .map(Self::new)
            .ok_or(ValidationError::InvalidTimestamp { candidates })
    }

    /// Returns the instant as a `DateTime<Utc>`.
    #[must_use]
    pub const fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for ReferenceInstant {
    fn from(at: DateTime<Utc>) -> Self {
        Self::new(at)
    }
}

impl fmt::Display for ReferenceInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Where a run takes its reference instant from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ReferenceSource {
    /// The system clock at resolution time.
    #[default]
    Now,
    /// An operator-supplied timestamp.
    Explicit {
        /// Timestamp text.
        text: String,
        /// chrono format string; the default list is used when absent.
        #[serde(default)]
        format: Option<String>,
    },
    /// A timestamp embedded in the snapshot file name.
    FromFilename {
        /// File name or path of the imported snapshot.
        filename: String,
        /// Extraction regex; [`DEFAULT_FILENAME_PATTERN`] when absent.
        #[serde(default)]
        pattern: Option<String>,
    },
}

impl ReferenceSource {
    /// Resolves this source to a concrete instant.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the timestamp cannot be parsed.
    pub fn resolve(&self) -> Result<ReferenceInstant, ValidationError> {
        match self {
            Self::Now => Ok(ReferenceInstant::now()),
            Self::Explicit { text, format } => ReferenceInstant::parse(text, format.as_deref()),
            Self::FromFilename { filename, pattern } => {
                ReferenceInstant::from_filename(filename, pattern.as_deref())
            }
        }
    }
}

fn parse_with(text: &str, format: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(text, format) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, format)
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_default(text: &str) -> Option<DateTime<Utc>> {
    DEFAULT_FORMATS
        .iter()
        .find_map(|fmt| parse_with(text, fmt))
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
        .or_else(|| {
            DateTime::parse_from_rfc2822(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}
