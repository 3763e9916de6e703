//! Attestation tracker
//!
//! Records signer approvals per chain deal id and answers whether the
//! process-wide threshold has been reached. The threshold is read from the
//! config handle on every call.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::db::AttestationStore;
use crate::error::BridgeError;
use crate::validation::parse_deal_id_list;

/// Signatures still needed before `required` is reached
pub fn remaining(count: i64, required: u32) -> u32 {
    let count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
    required.saturating_sub(count)
}

/// Result of one batch ingestion request
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub recorded: Vec<i64>,
    pub already_recorded: Vec<i64>,
    pub rejected: Vec<String>,
}

#[derive(Clone)]
pub struct AttestationTracker {
    store: AttestationStore,
    config: ConfigHandle,
}

impl AttestationTracker {
    pub fn new(store: AttestationStore, config: ConfigHandle) -> Self {
        Self { store, config }
    }

    /// Idempotent insert. Returns true if this call created the attestation.
    ///
    /// The deal need not exist locally yet.
    pub fn record_attestation(&self, deal_id: i64, signer_id: &str) -> Result<bool, BridgeError> {
        let signer_id = signer_id.trim();
        if signer_id.is_empty() {
            return Err(BridgeError::InvalidInput("signer identity is required".into()));
        }
        let inserted = self.store.insert(deal_id, signer_id)?;
        if inserted {
            info!(deal_id, signer = signer_id, "Attestation recorded");
        } else {
            debug!(deal_id, signer = signer_id, "Attestation already present");
        }
        Ok(inserted)
    }

    pub fn count_attestations(&self, deal_id: i64) -> Result<i64, BridgeError> {
        self.store.count(deal_id)
    }

    /// Signer ids for a deal, in arrival order
    pub fn signers(&self, deal_id: i64) -> Result<Vec<String>, BridgeError> {
        Ok(self
            .store
            .list(deal_id)?
            .into_iter()
            .map(|a| a.signer_id)
            .collect())
    }

    pub fn threshold(&self) -> u32 {
        self.config.threshold()
    }

    pub fn threshold_met(&self, deal_id: i64) -> Result<bool, BridgeError> {
        let count = self.count_attestations(deal_id)?;
        Ok(remaining(count, self.threshold()) == 0)
    }

    /// Record one attestation per id in a comma-separated list
    ///
    /// Unparseable ids are skipped and reported; a missing signer rejects the
    /// whole request.
    pub fn record_batch(
        &self,
        deal_id_list: &str,
        signer_id: &str,
    ) -> Result<IngestResult, BridgeError> {
        if signer_id.trim().is_empty() {
            return Err(BridgeError::InvalidInput("signer identity is required".into()));
        }

        let (ids, rejected) = parse_deal_id_list(deal_id_list);
        for token in &rejected {
            warn!(token = %token, "Skipping unparseable deal id");
        }

        let mut result = IngestResult {
            rejected,
            ..IngestResult::default()
        };
        for id in ids {
            if self.record_attestation(id, signer_id)? {
                result.recorded.push(id);
            } else {
                result.already_recorded.push(id);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::open_in_memory;

    fn tracker(threshold: u32) -> (AttestationTracker, ConfigHandle) {
        let mut config = Config::default();
        config.attestation.threshold = threshold;
        let handle = ConfigHandle::new(config);
        let store = AttestationStore::new(open_in_memory().unwrap());
        (AttestationTracker::new(store, handle.clone()), handle)
    }

    #[test]
    fn test_record_is_idempotent() {
        let (tracker, _) = tracker(2);
        assert!(tracker.record_attestation(1, "alice").unwrap());
        assert!(!tracker.record_attestation(1, "alice").unwrap());
        assert_eq!(tracker.count_attestations(1).unwrap(), 1);
    }

    #[test]
    fn test_threshold_counts_distinct_signers() {
        let (tracker, _) = tracker(2);
        tracker.record_attestation(1, "alice").unwrap();
        assert!(!tracker.threshold_met(1).unwrap());
        tracker.record_attestation(1, "alice").unwrap();
        assert!(!tracker.threshold_met(1).unwrap());
        tracker.record_attestation(1, "bob").unwrap();
        assert!(tracker.threshold_met(1).unwrap());
        assert!(!tracker.threshold_met(2).unwrap());
    }

    #[test]
    fn test_threshold_read_at_evaluation_time() {
        let (tracker, handle) = tracker(3);
        tracker.record_attestation(9, "alice").unwrap();
        tracker.record_attestation(9, "bob").unwrap();
        assert!(!tracker.threshold_met(9).unwrap());

        let mut lowered = handle.current();
        lowered.attestation.threshold = 2;
        handle.replace(lowered).unwrap();
        assert!(tracker.threshold_met(9).unwrap());
    }

    #[test]
    fn test_record_batch() {
        let (tracker, _) = tracker(2);
        tracker.record_attestation(2, "alice").unwrap();

        let result = tracker.record_batch("1, 2,x,3", "alice").unwrap();
        assert_eq!(result.recorded, vec![1, 3]);
        assert_eq!(result.already_recorded, vec![2]);
        assert_eq!(result.rejected, vec!["x".to_string()]);

        assert!(matches!(
            tracker.record_batch("1", " "),
            Err(BridgeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_remaining() {
        assert_eq!(remaining(0, 3), 3);
        assert_eq!(remaining(2, 3), 1);
        assert_eq!(remaining(5, 3), 0);
    }
}
