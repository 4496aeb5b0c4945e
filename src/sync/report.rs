use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::reconcile::{NodeOutcome, NodeReport};
use crate::time::ReferenceInstant;

/// Summary of one synchronization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub reference: ReferenceInstant,
    pub confirmed: usize,
    pub extended: usize,
    pub superseded: usize,
    pub skipped: usize,
    pub presence_inserted: usize,
    pub presence_extended: usize,
    /// Dimension and country rows created during the run.
    pub dimension_rows_created: usize,
}

impl SyncReport {
    #[must_use]
    pub const fn new(run_id: Uuid, reference: ReferenceInstant) -> Self {
        Self {
            run_id,
            reference,
            confirmed: 0,
            extended: 0,
            superseded: 0,
            skipped: 0,
            presence_inserted: 0,
            presence_extended: 0,
            dimension_rows_created: 0,
        }
    }

    pub fn absorb(&mut self, node: &NodeReport) {
        match node.outcome {
            NodeOutcome::Confirmed => self.confirmed += 1,
            NodeOutcome::Extended => self.extended += 1,
            NodeOutcome::Superseded => self.superseded += 1,
            NodeOutcome::Skipped => self.skipped += 1,
        }
        self.presence_inserted += node.presence_inserted;
        self.presence_extended += node.presence_extended;
    }

    /// Records processed, including skipped duplicates.
    #[must_use]
    pub const fn processed(&self) -> usize {
        self.confirmed + self.extended + self.superseded + self.skipped
    }

    /// True if the run wrote no version or presence rows.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.extended == 0
            && self.superseded == 0
            && self.presence_inserted == 0
            && self.presence_extended == 0
            && self.dimension_rows_created == 0
    }
}
