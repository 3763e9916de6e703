//! Expiry sweeper
//!
//! Deals still Proposed or Published once their commitment window has passed
//! are forced to Expired with payment Refunding. Expired is terminal, so a
//! second sweep finds nothing to do.

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::report::{BatchReport, ItemOutcome};
use crate::config::ConfigHandle;
use crate::db::{DealMerge, DealRegistry, DealStatus, LockPaymentStatus};
use crate::error::BridgeError;

const SOURCE: &str = "expiry-sweeper";

pub struct ExpirySweeper {
    registry: DealRegistry,
    config: ConfigHandle,
}

impl ExpirySweeper {
    pub fn new(registry: DealRegistry, config: ConfigHandle) -> Self {
        Self { registry, config }
    }

    pub fn sweep(&self, shutdown: &watch::Receiver<bool>) -> Result<BatchReport, BridgeError> {
        self.sweep_at(Utc::now(), shutdown)
    }

    /// Sweep as if the current time were `now`
    pub fn sweep_at(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BatchReport, BridgeError> {
        let window = self.config.expiry().commitment_window();
        let cutoff = now - window;
        let candidates = self.registry.expiry_candidates(cutoff)?;

        let mut report = BatchReport::new();
        for deal in &candidates {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }

            let merge = DealMerge::from_deal(deal)
                .status(DealStatus::Expired, LockPaymentStatus::Refunding);
            let outcome = match self.registry.apply_merge(deal, &merge, SOURCE) {
                Ok(_) => {
                    info!(deal = %deal.id, created_at = %deal.created_at, "Deal expired");
                    ItemOutcome::Updated
                }
                Err(BridgeError::Conflict(reason)) => {
                    debug!(deal = %deal.id, %reason, "Expiry skipped");
                    ItemOutcome::Skipped { reason }
                }
                Err(e) => {
                    error!(deal = %deal.id, error = %e, "Failed to expire deal");
                    ItemOutcome::failed(&e)
                }
            };
            report.push(deal.id.clone(), outcome);
        }

        if report.total() > 0 {
            info!(
                expired = report.updated(),
                skipped = report.skipped(),
                failed = report.failed(),
                "Expiry sweep finished"
            );
        }
        Ok(report)
    }
}
