//! Read surface for presentation layers
//!
//! When a fingerprint has several deals, the summary describes the most
//! recently created Active deal, falling back to the most recently created
//! deal of any status.

use rust_decimal::Decimal;
use serde::Serialize;

use super::attestation::AttestationTracker;
use crate::db::models::DealTransition;
use crate::db::{Deal, DealRegistry, DealStatus, EscrowLedger, LockPaymentStatus};
use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealSummary {
    pub fingerprint: String,
    pub deal_ref: String,
    pub deal_id: Option<i64>,
    pub deal_status: DealStatus,
    pub lock_payment_status: LockPaymentStatus,
    pub signed_count: i64,
    pub signers: Vec<String>,
    pub threshold: u32,
    /// True once a release record exists for the fingerprint
    pub unlock_status: bool,
    pub locked_amount: Option<Decimal>,
    pub deal_count: usize,
}

/// Pick the deal a fingerprint-level view should describe
pub fn representative_deal(deals: &[Deal]) -> Option<&Deal> {
    let newest_first = |a: &&Deal, b: &&Deal| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    };
    deals
        .iter()
        .filter(|d| d.deal_status == DealStatus::Active)
        .max_by(newest_first)
        .or_else(|| deals.iter().max_by(newest_first))
}

#[derive(Clone)]
pub struct DealQueries {
    registry: DealRegistry,
    ledger: EscrowLedger,
    attestations: AttestationTracker,
}

impl DealQueries {
    pub fn new(
        registry: DealRegistry,
        ledger: EscrowLedger,
        attestations: AttestationTracker,
    ) -> Self {
        Self {
            registry,
            ledger,
            attestations,
        }
    }

    pub fn deal_summary_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<DealSummary, BridgeError> {
        let deals = self.registry.list_for_fingerprint(fingerprint)?;
        let deal = representative_deal(&deals)
            .ok_or_else(|| BridgeError::NotFound(format!("no deals for {}", fingerprint)))?;
        self.summarize(deal, deals.len())
    }

    pub fn deal_summary_by_deal_id(&self, deal_id: i64) -> Result<DealSummary, BridgeError> {
        let deal = self
            .registry
            .find_by_deal_id(deal_id)?
            .ok_or_else(|| BridgeError::NotFound(format!("deal {}", deal_id)))?;
        let deal_count = self.registry.list_for_fingerprint(&deal.fingerprint)?.len();
        self.summarize(&deal, deal_count)
    }

    pub fn transitions_by_deal_id(&self, deal_id: i64) -> Result<Vec<DealTransition>, BridgeError> {
        let deal = self
            .registry
            .find_by_deal_id(deal_id)?
            .ok_or_else(|| BridgeError::NotFound(format!("deal {}", deal_id)))?;
        self.registry.transitions(&deal.id)
    }

    fn summarize(&self, deal: &Deal, deal_count: usize) -> Result<DealSummary, BridgeError> {
        let signers = match deal.deal_id {
            Some(id) => self.attestations.signers(id)?,
            None => Vec::new(),
        };
        Ok(DealSummary {
            fingerprint: deal.fingerprint.clone(),
            deal_ref: deal.id.clone(),
            deal_id: deal.deal_id,
            deal_status: deal.deal_status,
            lock_payment_status: deal.lock_payment_status,
            signed_count: signers.len() as i64,
            signers,
            threshold: self.attestations.threshold(),
            unlock_status: self.ledger.release_exists(&deal.fingerprint)?,
            locked_amount: self
                .ledger
                .get_escrow(&deal.fingerprint)?
                .map(|e| e.locked_amount),
            deal_count,
        })
    }
}
