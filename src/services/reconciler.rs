//! Deal status reconciler
//!
//! Polls the chain observer for every open deal and merges what it sees into
//! the deal registry. Deals are handled one at a time; a failure on one deal is
//! recorded in the batch report and the run moves on.
//!
//! ## Mapping
//!
//! | Upstream | dealStatus | lockPaymentStatus |
//! |----------|------------|-------------------|
//! | active-equivalent | Active | Processing |
//! | error-equivalent | Error | Refunding |
//! | anything else | at least Published | Processing |

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::report::{BatchReport, ItemOutcome};
use crate::chain::{classify, ChainDealInfo, ChainObserver, UpstreamClass};
use crate::config::{ConfigHandle, LotusConfig};
use crate::db::{Deal, DealMerge, DealRegistry, DealStatus, LockPaymentStatus};
use crate::error::BridgeError;

const SOURCE: &str = "reconciler";

/// Compute the merge implied by an observation, or None if nothing changes
pub fn plan_merge(deal: &Deal, info: &ChainDealInfo, lotus: &LotusConfig) -> Option<DealMerge> {
    let (status, lock) = match classify(&info.status, lotus) {
        UpstreamClass::Active => (DealStatus::Active, LockPaymentStatus::Processing),
        UpstreamClass::Error => (DealStatus::Error, LockPaymentStatus::Refunding),
        UpstreamClass::Pending => {
            let status = match deal.deal_status {
                DealStatus::Proposed => DealStatus::Published,
                other => other,
            };
            (status, LockPaymentStatus::Processing)
        }
    };

    let mut merge = DealMerge::from_deal(deal).status(status, lock);
    merge.verified = info.verified;
    if info.deal_id > 0 {
        merge.deal_id = Some(info.deal_id);
    }
    merge.cost_computed = Some(info.cost_computed);
    merge.upstream_status = Some(info.status.clone());

    if merge == DealMerge::from_deal(deal) {
        None
    } else {
        Some(merge)
    }
}

pub struct Reconciler {
    registry: DealRegistry,
    observer: Arc<dyn ChainObserver>,
    config: ConfigHandle,
}

impl Reconciler {
    pub fn new(
        registry: DealRegistry,
        observer: Arc<dyn ChainObserver>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            registry,
            observer,
            config,
        }
    }

    /// One reconciliation pass over the current candidates
    pub async fn run(&self, shutdown: &watch::Receiver<bool>) -> Result<BatchReport, BridgeError> {
        let lotus = self.config.lotus();
        let candidates = self
            .registry
            .reconcile_candidates(&lotus.final_status_set(), lotus.batch_size)?;

        let mut report = BatchReport::new();
        for deal in &candidates {
            if *shutdown.borrow() {
                info!(
                    remaining = candidates.len() - report.total(),
                    "Reconciler stopping on shutdown"
                );
                report.interrupted = true;
                break;
            }
            let outcome = self.reconcile_deal(deal, &lotus).await;
            report.push(deal.id.clone(), outcome);
        }

        info!(
            candidates = candidates.len(),
            updated = report.updated(),
            skipped = report.skipped(),
            failed = report.failed(),
            persistent = report.persistent_failures(),
            "Deal status reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_deal(&self, deal: &Deal, lotus: &LotusConfig) -> ItemOutcome {
        let observed = tokio::time::timeout(
            lotus.request_timeout(),
            self.observer.get_deal_info(&deal.deal_cid),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BridgeError::Timeout(format!(
                "no answer within {}s",
                lotus.request_timeout_secs
            )))
        });

        let info = match observed {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    deal = %deal.id,
                    deal_cid = %deal.deal_cid,
                    error = %e,
                    transient = e.is_transient(),
                    "Chain observer call failed"
                );
                return ItemOutcome::failed(&e);
            }
        };

        let Some(merge) = plan_merge(deal, &info, lotus) else {
            debug!(deal = %deal.id, status = %info.status, "Deal unchanged");
            return ItemOutcome::Skipped {
                reason: "unchanged".to_string(),
            };
        };

        match self.registry.apply_merge(deal, &merge, SOURCE) {
            Ok(_) => ItemOutcome::Updated,
            Err(BridgeError::Conflict(reason)) => {
                debug!(deal = %deal.id, %reason, "Merge skipped");
                ItemOutcome::Skipped { reason }
            }
            Err(e) => {
                error!(deal = %deal.id, error = %e, "Failed to persist deal merge");
                ItemOutcome::failed(&e)
            }
        }
    }
}
