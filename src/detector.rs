//! Change detection between an incoming record and a stored version.
//!
//! Pure functions over [`AttributeSet`]s. Structured fields (exit policies)
//! already hold their canonical JSON text, so string equality is structural
//! equality.

use std::fmt;

use crate::dimension::DimensionKind;
use crate::node::AttributeSet;

/// Outcome of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Same,
    Different,
}

/// An attribute taking part in change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeField {
    Nickname,
    Country,
    Dimension(DimensionKind),
    LastChangedAddressOrPort,
    FirstSeen,
}

impl AttributeField {
    /// Every compared attribute, in comparison order.
    pub const ALL: [Self; 12] = [
        Self::Nickname,
        Self::Country,
        Self::Dimension(DimensionKind::Region),
        Self::Dimension(DimensionKind::City),
        Self::Dimension(DimensionKind::Platform),
        Self::Dimension(DimensionKind::Version),
        Self::Dimension(DimensionKind::Contact),
        Self::LastChangedAddressOrPort,
        Self::FirstSeen,
        Self::Dimension(DimensionKind::ExitPolicy),
        Self::Dimension(DimensionKind::ExitPolicySummary),
        Self::Dimension(DimensionKind::ExitPolicyV6Summary),
    ];

    fn equal(self, a: &AttributeSet, b: &AttributeSet) -> bool {
        match self {
            Self::Nickname => a.nickname == b.nickname,
            Self::Country => a.country == b.country,
            Self::Dimension(DimensionKind::Contact) => {
                match (a.contact.as_deref(), b.contact.as_deref()) {
                    (Some(x), Some(y)) => x.to_lowercase() == y.to_lowercase(),
                    (x, y) => x == y,
                }
            }
            Self::Dimension(kind) => a.dimension_text(kind) == b.dimension_text(kind),
            Self::LastChangedAddressOrPort => {
                a.last_changed_address_or_port == b.last_changed_address_or_port
            }
            Self::FirstSeen => a.first_seen == b.first_seen,
        }
    }
}

impl fmt::Display for AttributeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nickname => f.write_str("nickname"),
            Self::Country => f.write_str("country"),
            Self::Dimension(kind) => write!(f, "{kind}"),
            Self::LastChangedAddressOrPort => f.write_str("last_changed_address_or_port"),
            Self::FirstSeen => f.write_str("first_seen"),
        }
    }
}

/// Stateless comparator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    /// Compares an incoming attribute set with the prior one.
    ///
    /// No prior version means the node is new: `Different`.
    #[must_use]
    pub fn compare(incoming: &AttributeSet, prior: Option<&AttributeSet>) -> Verdict {
        match prior {
            Some(prior) if AttributeField::ALL.iter().all(|f| f.equal(incoming, prior)) => {
                Verdict::Same
            }
            _ => Verdict::Different,
        }
    }

    /// Lists the attributes that differ. Empty when `prior` is absent.
    #[must_use]
    pub fn differences(incoming: &AttributeSet, prior: Option<&AttributeSet>) -> Vec<AttributeField> {
        let Some(prior) = prior else {
            return Vec::new();
        };
        AttributeField::ALL
            .into_iter()
            .filter(|f| !f.equal(incoming, prior))
            .collect()
    }
}
