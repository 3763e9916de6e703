//! Release decision engine
//!
//! Decides when escrow for a fingerprint is released and exposes the refund
//! transition points.
//!
//! A fingerprint is released when one of its deals is Active and that deal's
//! attestation threshold is met, and no release row exists yet. When several
//! deals qualify, the most recently created one is credited. The release row
//! insert and the deal's move to `Success` share one immediate transaction,
//! and the `release_records` primary key rejects any second writer, so
//! concurrent evaluations produce exactly one release.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::attestation::AttestationTracker;
use super::report::{BatchReport, ItemOutcome};
use crate::db::deals::{get_deal, merge_deal};
use crate::db::ledger::{self, ReleaseInsert};
use crate::db::{
    DbPool, Deal, DealMerge, DealRegistry, DealStatus, EscrowLedger, LockPaymentStatus, PooledConn,
};
use crate::error::BridgeError;

const SOURCE: &str = "release-engine";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReleaseDecision {
    Released {
        fingerprint: String,
        amount: Decimal,
        deal_ref: String,
    },
    /// A release row already exists; nothing was written
    AlreadyReleased,
    NotEligible { reason: String },
}

/// One refund handed to a broadcaster
#[derive(Debug, Clone)]
pub struct RefundRequest<'a> {
    pub deal: &'a Deal,
    pub locked_amount: Option<Decimal>,
    /// 1 on the first dispatch for this deal; counted across restarts
    pub attempt: u32,
}

/// External transaction broadcaster for refunds
///
/// A deal stays in `Refunding` until its refund is confirmed, so the same deal
/// is handed over again every dispatch cycle with a growing `attempt`.
/// Implementations must treat `deal.id` as an idempotency key: an attempt
/// after the first must not pay out if an earlier one already went through.
#[async_trait::async_trait]
pub trait RefundBroadcaster: Send + Sync {
    async fn broadcast_refund(&self, request: RefundRequest<'_>) -> Result<(), BridgeError>;
}

/// Broadcaster that only logs; used when no wallet integration is configured
pub struct LoggingRefundBroadcaster;

#[async_trait::async_trait]
impl RefundBroadcaster for LoggingRefundBroadcaster {
    async fn broadcast_refund(&self, request: RefundRequest<'_>) -> Result<(), BridgeError> {
        info!(
            deal = %request.deal.id,
            fingerprint = %request.deal.fingerprint,
            amount = ?request.locked_amount,
            attempt = request.attempt,
            "Refund pending broadcast"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct ReleaseEngine {
    pool: DbPool,
    registry: DealRegistry,
    ledger: EscrowLedger,
    attestations: AttestationTracker,
}

impl ReleaseEngine {
    pub fn new(
        pool: DbPool,
        registry: DealRegistry,
        ledger: EscrowLedger,
        attestations: AttestationTracker,
    ) -> Self {
        Self {
            pool,
            registry,
            ledger,
            attestations,
        }
    }

    fn conn(&self) -> Result<PooledConn, BridgeError> {
        self.pool
            .get()
            .map_err(|e| BridgeError::Internal(format!("Failed to get connection: {}", e)))
    }

    /// Pick the deal to credit: newest Active deal with payment in flight whose
    /// threshold is met
    fn eligible_deal(&self, fingerprint: &str) -> Result<Result<Deal, String>, BridgeError> {
        let deals = self.registry.list_for_fingerprint(fingerprint)?;
        if deals.is_empty() {
            return Ok(Err("no deals for fingerprint".to_string()));
        }

        let mut saw_active = false;
        let in_flight = |d: &Deal| {
            d.deal_status == DealStatus::Active
                && d.lock_payment_status == LockPaymentStatus::Processing
        };
        for deal in deals.into_iter().filter(in_flight) {
            saw_active = true;
            let Some(deal_id) = deal.deal_id else {
                continue;
            };
            if self.attestations.threshold_met(deal_id)? {
                return Ok(Ok(deal));
            }
        }

        Ok(Err(if saw_active {
            format!(
                "attestation threshold of {} not met",
                self.attestations.threshold()
            )
        } else {
            "no active deal with payment in flight".to_string()
        }))
    }

    /// Evaluate one fingerprint; safe to call repeatedly and concurrently
    pub fn evaluate(&self, fingerprint: &str) -> Result<ReleaseDecision, BridgeError> {
        if self.ledger.release_exists(fingerprint)? {
            return Ok(ReleaseDecision::AlreadyReleased);
        }

        let deal = match self.eligible_deal(fingerprint)? {
            Ok(deal) => deal,
            Err(reason) => {
                debug!(fingerprint, %reason, "Release not eligible");
                return Ok(ReleaseDecision::NotEligible { reason });
            }
        };

        let mut conn = self.conn()?;
        let decision = conn.immediate_transaction::<_, BridgeError, _>(|conn| {
            if ledger::release_exists(conn, fingerprint)? {
                return Ok(ReleaseDecision::AlreadyReleased);
            }
            let Some(escrow) = ledger::get_escrow(conn, fingerprint)? else {
                return Ok(ReleaseDecision::NotEligible {
                    reason: "no escrow record".to_string(),
                });
            };

            if ledger::insert_release(conn, fingerprint, escrow.locked_amount, &deal.id)?
                == ReleaseInsert::AlreadyReleased
            {
                return Ok(ReleaseDecision::AlreadyReleased);
            }

            // Re-read inside the transaction so the version is current
            let current = get_deal(conn, &deal.id)?
                .ok_or_else(|| BridgeError::NotFound(format!("deal {}", deal.id)))?;
            if current.deal_status != DealStatus::Active {
                return Err(BridgeError::Conflict(format!(
                    "deal {} left Active during release",
                    deal.id
                )));
            }
            if current.lock_payment_status != LockPaymentStatus::Success {
                let merge = DealMerge::from_deal(&current)
                    .status(DealStatus::Active, LockPaymentStatus::Success);
                merge_deal(conn, &current, &merge, SOURCE)?;
            }

            Ok(ReleaseDecision::Released {
                fingerprint: fingerprint.to_string(),
                amount: escrow.locked_amount,
                deal_ref: deal.id.clone(),
            })
        });

        match decision {
            Ok(ReleaseDecision::Released { fingerprint, amount, deal_ref }) => {
                info!(%fingerprint, %amount, deal = %deal_ref, "Escrow released");
                Ok(ReleaseDecision::Released {
                    fingerprint,
                    amount,
                    deal_ref,
                })
            }
            Ok(other) => Ok(other),
            Err(e) if e.is_unique_violation() => Ok(ReleaseDecision::AlreadyReleased),
            Err(e) => Err(e),
        }
    }

    /// Unlock-payment pass over every fingerprint with an active, unpaid deal
    pub fn evaluate_pending(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BatchReport, BridgeError> {
        let fingerprints = self.registry.release_candidate_fingerprints()?;
        let mut report = BatchReport::new();

        for fingerprint in fingerprints {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            let outcome = match self.evaluate(&fingerprint) {
                Ok(ReleaseDecision::Released { .. }) => ItemOutcome::Updated,
                Ok(ReleaseDecision::AlreadyReleased) => ItemOutcome::Skipped {
                    reason: "already released".to_string(),
                },
                Ok(ReleaseDecision::NotEligible { reason }) => ItemOutcome::Skipped { reason },
                Err(e) => {
                    error!(%fingerprint, error = %e, "Release evaluation failed");
                    ItemOutcome::failed(&e)
                }
            };
            report.push(fingerprint, outcome);
        }

        info!(
            released = report.updated(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Unlock payment pass finished"
        );
        Ok(report)
    }

    /// Deals whose escrow should be refunded
    pub fn refund_candidates(&self) -> Result<Vec<Deal>, BridgeError> {
        self.registry.refund_candidates()
    }

    /// Hand every refund candidate to the broadcaster
    ///
    /// Candidates stay in `Refunding` until [`confirm_refund`](Self::confirm_refund)
    /// is called, so an unconfirmed refund is offered again next cycle with the
    /// next attempt number.
    pub async fn dispatch_refunds(
        &self,
        broadcaster: &Arc<dyn RefundBroadcaster>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BatchReport, BridgeError> {
        let candidates = self.refund_candidates()?;
        let mut report = BatchReport::new();

        for deal in candidates {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            let prepared = self
                .ledger
                .get_escrow(&deal.fingerprint)
                .map(|escrow| escrow.map(|e| e.locked_amount))
                .and_then(|amount| {
                    let attempt = self.registry.record_refund_dispatch(&deal.id)?;
                    Ok((amount, attempt))
                });
            let (locked_amount, attempt) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    error!(deal = %deal.id, error = %e, "Failed to prepare refund");
                    report.push(deal.id.clone(), ItemOutcome::failed(&e));
                    continue;
                }
            };
            if attempt > 1 {
                debug!(deal = %deal.id, attempt, "Refund still unconfirmed, dispatching again");
            }

            let request = RefundRequest {
                deal: &deal,
                locked_amount,
                attempt,
            };
            let outcome = match broadcaster.broadcast_refund(request).await {
                Ok(()) => ItemOutcome::Updated,
                Err(e) => {
                    warn!(deal = %deal.id, attempt, error = %e, "Refund broadcast failed");
                    ItemOutcome::failed(&e)
                }
            };
            report.push(deal.id.clone(), outcome);
        }

        info!(
            dispatched = report.updated(),
            failed = report.failed(),
            "Refund dispatch finished"
        );
        Ok(report)
    }

    /// Mark a refund as confirmed. Returns false if it was already confirmed.
    pub fn confirm_refund(&self, deal_ref: &str) -> Result<bool, BridgeError> {
        let deal = self
            .registry
            .get(deal_ref)?
            .ok_or_else(|| BridgeError::NotFound(format!("deal {}", deal_ref)))?;

        match deal.lock_payment_status {
            LockPaymentStatus::Refunded => Ok(false),
            LockPaymentStatus::Refunding if deal.deal_status.is_terminal() => {
                let merge = DealMerge::from_deal(&deal)
                    .status(deal.deal_status, LockPaymentStatus::Refunded);
                self.registry.apply_merge(&deal, &merge, SOURCE)?;
                info!(deal = %deal.id, "Refund confirmed");
                Ok(true)
            }
            other => Err(BridgeError::Conflict(format!(
                "deal {} is not awaiting a refund ({} / {})",
                deal.id, deal.deal_status, other
            ))),
        }
    }
}
