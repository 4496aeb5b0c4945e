//! Configuration for synchronization runs and the in-memory store.
//!
//! Both structs deserialize with serde so an outer layer can load them from
//! whatever format it uses; missing fields take their defaults.

use serde::{Deserialize, Serialize};

use crate::dimension::DimensionKind;
use crate::error::ValidationError;

/// Knobs for a synchronization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bulk-load all dimension tables when the run context is built.
    pub warm_dimension_caches: bool,
    /// Emit a progress line every this many records.
    pub progress_interval: usize,
    /// Write an import-log row at the start of every run.
    pub record_imports: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            warm_dimension_caches: true,
            progress_interval: 1000,
            record_imports: true,
        }
    }
}

impl SyncConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if `progress_interval` is zero.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.progress_interval == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "progress_interval must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

/// Column capacities enforced by the in-memory store, in bytes.
///
/// Values longer than their column are rejected, never truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLimits {
    pub fingerprint: usize,
    pub nickname: usize,
    pub country_name: usize,
    pub region: usize,
    pub city: usize,
    pub platform: usize,
    pub version: usize,
    pub contact: usize,
    pub exit_policy: usize,
    pub exit_policy_summary: usize,
    pub exit_policy_v6_summary: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            fingerprint: 40,
            nickname: 19,
            country_name: 64,
            region: 128,
            city: 128,
            platform: 255,
            version: 64,
            contact: 1024,
            exit_policy: 65_535,
            exit_policy_summary: 65_535,
            exit_policy_v6_summary: 65_535,
        }
    }
}

impl StoreLimits {
    /// Capacity of the text column of a dimension table.
    #[must_use]
    pub const fn dimension(&self, kind: DimensionKind) -> usize {
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

    /// Validates the limits.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if any capacity is zero.
    pub fn validate(self) -> Result<Self, ValidationError> {
        let named = [
            ("fingerprint", self.fingerprint),
            ("nickname", self.nickname),
            ("country_name", self.country_name),
        ];
        for (name, value) in named {
            if value == 0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{name} capacity must be at least 1"),
                });
            }
        }
        for kind in DimensionKind::ALL {
            if self.dimension(kind) == 0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{kind} capacity must be at least 1"),
                });
            }
        }
        Ok(self)
    }
}
