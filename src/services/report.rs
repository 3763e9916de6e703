//! Per-item outcomes aggregated over one batch run

use serde::Serialize;

use crate::error::BridgeError;

/// What happened to one item of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ItemOutcome {
    Updated,
    /// Nothing to do, or another writer got there first
    Skipped { reason: String },
    /// Left unchanged for this cycle; retried on the next one
    Failed { error: String, transient: bool },
}

impl ItemOutcome {
    pub fn failed(error: &BridgeError) -> Self {
        ItemOutcome::Failed {
            error: error.to_string(),
            transient: error.is_transient(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub key: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Summary of one job run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub items: Vec<ItemResult>,
    /// True when the run stopped early on shutdown
    pub interrupted: bool,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, outcome: ItemOutcome) {
        self.items.push(ItemResult {
            key: key.into(),
            outcome,
        });
    }

    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Updated))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    /// Failures that will not clear up by retrying
    pub fn persistent_failures(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { transient: false, .. }))
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn outcome_for(&self, key: &str) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| &item.outcome)
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|item| pred(&item.outcome)).count()
    }
}
