//! Deal registry
//!
//! Every status change goes through [`merge_deal`], which checks the lifecycle
//! rules and bumps `version` with a compare-and-swap. A writer that read a stale
//! version gets `BridgeError::Conflict` and must re-read. The same write appends
//! a row to `deal_transitions` when either status field changes.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use super::models::{
    current_timestamp, format_timestamp, Deal, DealRow, DealStatus, DealTransition,
    LockPaymentStatus, NewDealRow, NewDealTransition,
};
use super::schema::{deal_transitions, deals, refund_dispatches};
use super::{DbPool, PooledConn};
use crate::error::BridgeError;
use crate::validation::validate_duration_epochs;

/// Input from the deal-submission workflow
#[derive(Debug, Clone, Deserialize)]
pub struct NewDealInput {
    pub fingerprint: String,
    #[serde(default)]
    pub deal_cid: String,
    #[serde(default)]
    pub deal_id: Option<i64>,
    pub provider_id: String,
    #[serde(default)]
    pub verified: bool,
    pub committed_duration_epochs: i64,
    #[serde(default = "default_initial_status")]
    pub deal_status: DealStatus,
}

fn default_initial_status() -> DealStatus {
    DealStatus::Proposed
}

/// Target values for one atomic deal update
#[derive(Debug, Clone, PartialEq)]
pub struct DealMerge {
    pub deal_status: DealStatus,
    pub lock_payment_status: LockPaymentStatus,
    pub verified: bool,
    pub deal_id: Option<i64>,
    pub cost_computed: Option<Decimal>,
    pub upstream_status: Option<String>,
}

impl DealMerge {
    /// Start from the deal's current values
    pub fn from_deal(deal: &Deal) -> Self {
        Self {
            deal_status: deal.deal_status,
            lock_payment_status: deal.lock_payment_status,
            verified: deal.verified,
            deal_id: deal.deal_id,
            cost_computed: deal.cost_computed,
            upstream_status: deal.upstream_status.clone(),
        }
    }

    pub fn status(mut self, deal_status: DealStatus, lock: LockPaymentStatus) -> Self {
        self.deal_status = deal_status;
        self.lock_payment_status = lock;
        self
    }

    fn changes_status(&self, deal: &Deal) -> bool {
        self.deal_status != deal.deal_status || self.lock_payment_status != deal.lock_payment_status
    }
}

// ============================================================================
// Connection-level operations
// ============================================================================

pub fn get_deal(conn: &mut SqliteConnection, id: &str) -> Result<Option<Deal>, BridgeError> {
    deals::table
        .filter(deals::id.eq(id))
        .select(DealRow::as_select())
        .first(conn)
        .optional()?
        .map(Deal::try_from)
        .transpose()
}

pub fn list_for_fingerprint(
    conn: &mut SqliteConnection,
    fingerprint: &str,
) -> Result<Vec<Deal>, BridgeError> {
    deals::table
        .filter(deals::fingerprint.eq(fingerprint))
        .order((deals::created_at.desc(), deals::id.desc()))
        .select(DealRow::as_select())
        .load(conn)?
        .into_iter()
        .map(Deal::try_from)
        .collect()
}

/// Apply `merge` to `deal` if the stored version still matches `deal.version`
pub fn merge_deal(
    conn: &mut SqliteConnection,
    deal: &Deal,
    merge: &DealMerge,
    source: &str,
) -> Result<Deal, BridgeError> {
    if !deal.deal_status.can_transition_to(merge.deal_status) {
        return Err(BridgeError::Conflict(format!(
            "deal {}: illegal status transition {} -> {}",
            deal.id, deal.deal_status, merge.deal_status
        )));
    }
    if !deal.lock_payment_status.can_transition_to(merge.lock_payment_status) {
        return Err(BridgeError::Conflict(format!(
            "deal {}: illegal payment transition {} -> {}",
            deal.id, deal.lock_payment_status, merge.lock_payment_status
        )));
    }
    if merge.lock_payment_status == LockPaymentStatus::Success
        && merge.deal_status != DealStatus::Active
    {
        return Err(BridgeError::Conflict(format!(
            "deal {}: payment success requires an active deal",
            deal.id
        )));
    }

    let now = current_timestamp();
    let cost = merge.cost_computed.map(|c| c.to_string());

    let updated = diesel::update(
        deals::table
            .filter(deals::id.eq(&deal.id))
            .filter(deals::version.eq(deal.version)),
    )
    .set((
        deals::deal_status.eq(merge.deal_status.as_str()),
        deals::lock_payment_status.eq(merge.lock_payment_status.as_str()),
        deals::verified.eq(merge.verified),
        deals::deal_id.eq(merge.deal_id),
        deals::cost_computed.eq(cost),
        deals::upstream_status.eq(merge.upstream_status.as_deref()),
        deals::version.eq(deal.version + 1),
        deals::updated_at.eq(&now),
    ))
    .execute(conn)?;

    if updated == 0 {
        return Err(BridgeError::Conflict(format!(
            "deal {} changed since version {}",
            deal.id, deal.version
        )));
    }

    if merge.changes_status(deal) {
        diesel::insert_into(deal_transitions::table)
            .values(&NewDealTransition {
                deal_ref: &deal.id,
                from_status: deal.deal_status.as_str(),
                to_status: merge.deal_status.as_str(),
                from_lock_status: deal.lock_payment_status.as_str(),
                to_lock_status: merge.lock_payment_status.as_str(),
                source,
                created_at: &now,
            })
            .execute(conn)?;

        info!(
            deal = %deal.id,
            from = %deal.deal_status,
            to = %merge.deal_status,
            lock = %merge.lock_payment_status,
            source,
            "Deal transition"
        );
    }

    get_deal(conn, &deal.id)?
        .ok_or_else(|| BridgeError::NotFound(format!("deal {}", deal.id)))
}

// ============================================================================
// Deal Registry
// ============================================================================

#[derive(Clone)]
pub struct DealRegistry {
    pool: DbPool,
}

impl DealRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConn, BridgeError> {
        self.pool
            .get()
            .map_err(|e| BridgeError::Internal(format!("Failed to get connection: {}", e)))
    }

    /// Create a deal after validating its duration
    pub fn create_deal(&self, input: &NewDealInput) -> Result<Deal, BridgeError> {
        self.create_deal_at(input, Utc::now())
    }

    pub fn create_deal_at(
        &self,
        input: &NewDealInput,
        created_at: DateTime<Utc>,
    ) -> Result<Deal, BridgeError> {
        validate_duration_epochs(input.committed_duration_epochs)?;
        if input.fingerprint.trim().is_empty() {
            return Err(BridgeError::InvalidInput("fingerprint is required".into()));
        }
        if input.provider_id.trim().is_empty() {
            return Err(BridgeError::InvalidInput("provider_id is required".into()));
        }
        if input.deal_status.is_terminal() {
            return Err(BridgeError::InvalidInput(format!(
                "a deal cannot start in status {}",
                input.deal_status
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created = format_timestamp(created_at);
        let row = NewDealRow {
            id: &id,
            deal_cid: &input.deal_cid,
            deal_id: input.deal_id,
            fingerprint: &input.fingerprint,
            provider_id: &input.provider_id,
            verified: input.verified,
            committed_duration_epochs: input.committed_duration_epochs,
            deal_status: input.deal_status.as_str(),
            lock_payment_status: LockPaymentStatus::Created.as_str(),
            version: 0,
            created_at: &created,
            updated_at: &created,
        };

        let mut conn = self.conn()?;
        diesel::insert_into(deals::table).values(&row).execute(&mut conn)?;
        debug!(deal = %id, fingerprint = %input.fingerprint, "Deal created");

        get_deal(&mut conn, &id)?.ok_or_else(|| BridgeError::NotFound(format!("deal {}", id)))
    }

    pub fn get(&self, id: &str) -> Result<Option<Deal>, BridgeError> {
        let mut conn = self.conn()?;
        get_deal(&mut conn, id)
    }

    /// Most recently created deal carrying the chain deal id
    pub fn find_by_deal_id(&self, deal_id: i64) -> Result<Option<Deal>, BridgeError> {
        let mut conn = self.conn()?;
        deals::table
            .filter(deals::deal_id.eq(deal_id))
            .order((deals::created_at.desc(), deals::id.desc()))
            .select(DealRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Deal::try_from)
            .transpose()
    }

    /// All deals for a fingerprint, newest first
    pub fn list_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<Deal>, BridgeError> {
        let mut conn = self.conn()?;
        list_for_fingerprint(&mut conn, fingerprint)
    }

    /// Deals the reconciler should poll, newest first
    ///
    /// Excludes deals without a deal CID, deals whose payment is settled, and
    /// deals whose local or last upstream status appears in `final_statuses`
    /// (case-insensitive).
    pub fn reconcile_candidates(
        &self,
        final_statuses: &[String],
        limit: i64,
    ) -> Result<Vec<Deal>, BridgeError> {
        let finals = serde_json::to_string(final_statuses)?;
        let mut conn = self.conn()?;

        let rows: Vec<DealRow> = diesel::sql_query(
            r#"
            SELECT * FROM deals
            WHERE deal_cid != ''
              AND lock_payment_status NOT IN (?, ?, ?)
              AND lower(deal_status) NOT IN (SELECT lower(value) FROM json_each(?))
              AND lower(COALESCE(upstream_status, ''))
                  NOT IN (SELECT lower(value) FROM json_each(?))
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind::<diesel::sql_types::Text, _>(LockPaymentStatus::SETTLED[0].as_str())
        .bind::<diesel::sql_types::Text, _>(LockPaymentStatus::SETTLED[1].as_str())
        .bind::<diesel::sql_types::Text, _>(LockPaymentStatus::SETTLED[2].as_str())
        .bind::<diesel::sql_types::Text, _>(&finals)
        .bind::<diesel::sql_types::Text, _>(&finals)
        .bind::<diesel::sql_types::BigInt, _>(limit)
        .load(&mut conn)?;

        rows.into_iter().map(Deal::try_from).collect()
    }

    /// Proposed/Published deals created at or before `cutoff`
    pub fn expiry_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<Deal>, BridgeError> {
        let mut conn = self.conn()?;
        deals::table
            .filter(deals::deal_status.eq_any([
                DealStatus::Proposed.as_str(),
                DealStatus::Published.as_str(),
            ]))
            .filter(deals::lock_payment_status.ne(LockPaymentStatus::Refunded.as_str()))
            .filter(deals::created_at.le(format_timestamp(cutoff)))
            .order(deals::created_at.asc())
            .select(DealRow::as_select())
            .load(&mut conn)?
            .into_iter()
            .map(Deal::try_from)
            .collect()
    }

    /// Error/Expired deals waiting for a refund to be broadcast and confirmed
    pub fn refund_candidates(&self) -> Result<Vec<Deal>, BridgeError> {
        let mut conn = self.conn()?;
        deals::table
            .filter(deals::deal_status.eq_any([
                DealStatus::Error.as_str(),
                DealStatus::Expired.as_str(),
            ]))
            .filter(deals::lock_payment_status.eq(LockPaymentStatus::Refunding.as_str()))
            .order(deals::updated_at.asc())
            .select(DealRow::as_select())
            .load(&mut conn)?
            .into_iter()
            .map(Deal::try_from)
            .collect()
    }

    /// Count one more refund dispatch for a deal and return the attempt number
    ///
    /// Attempts start at 1 and survive restarts.
    pub fn record_refund_dispatch(&self, deal_ref: &str) -> Result<u32, BridgeError> {
        let mut conn = self.conn()?;
        let now = current_timestamp();
        let attempts: i32 = conn.immediate_transaction::<_, BridgeError, _>(|conn| {
            diesel::insert_into(refund_dispatches::table)
                .values((
                    refund_dispatches::deal_ref.eq(deal_ref),
                    refund_dispatches::attempts.eq(1),
                    refund_dispatches::last_dispatched_at.eq(&now),
                ))
                .on_conflict(refund_dispatches::deal_ref)
                .do_update()
                .set((
                    refund_dispatches::attempts.eq(refund_dispatches::attempts + 1),
                    refund_dispatches::last_dispatched_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(refund_dispatches::table
                .filter(refund_dispatches::deal_ref.eq(deal_ref))
                .select(refund_dispatches::attempts)
                .first(conn)?)
        })?;
        Ok(attempts.max(1) as u32)
    }

    /// Fingerprints with an active deal whose payment is still in flight
    pub fn release_candidate_fingerprints(&self) -> Result<Vec<String>, BridgeError> {
        let mut conn = self.conn()?;
        Ok(deals::table
            .filter(deals::deal_status.eq(DealStatus::Active.as_str()))
            .filter(deals::lock_payment_status.eq(LockPaymentStatus::Processing.as_str()))
            .select(deals::fingerprint)
            .distinct()
            .load(&mut conn)?)
    }

    /// Apply one merge atomically
    pub fn apply_merge(
        &self,
        deal: &Deal,
        merge: &DealMerge,
        source: &str,
    ) -> Result<Deal, BridgeError> {
        let mut conn = self.conn()?;
        conn.immediate_transaction(|conn| merge_deal(conn, deal, merge, source))
    }

    /// Status history for a deal, oldest first
    pub fn transitions(&self, deal_ref: &str) -> Result<Vec<DealTransition>, BridgeError> {
        let mut conn = self.conn()?;
        Ok(deal_transitions::table
            .filter(deal_transitions::deal_ref.eq(deal_ref))
            .order(deal_transitions::id.asc())
            .select(DealTransition::as_select())
            .load(&mut conn)?)
    }
}
