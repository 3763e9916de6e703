//! Attestation rows keyed by (chain deal id, signer)

use diesel::prelude::*;

use super::models::{current_timestamp, Attestation};
use super::schema::attestations;
use super::{DbPool, PooledConn};
use crate::error::BridgeError;

#[derive(Clone)]
pub struct AttestationStore {
    pool: DbPool,
}

impl AttestationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConn, BridgeError> {
        self.pool
            .get()
            .map_err(|e| BridgeError::Internal(format!("Failed to get connection: {}", e)))
    }

    /// Insert unless the pair exists. Returns true when a row was written.
    pub fn insert(&self, deal_id: i64, signer_id: &str) -> Result<bool, BridgeError> {
        let mut conn = self.conn()?;
        let row = Attestation {
            deal_id,
            signer_id: signer_id.to_string(),
            created_at: current_timestamp(),
        };
        let inserted = diesel::insert_or_ignore_into(attestations::table)
            .values(&row)
            .execute(&mut conn)?;
        Ok(inserted > 0)
    }

    pub fn count(&self, deal_id: i64) -> Result<i64, BridgeError> {
        let mut conn = self.conn()?;
        Ok(attestations::table
            .filter(attestations::deal_id.eq(deal_id))
            .count()
            .get_result(&mut conn)?)
    }

    pub fn list(&self, deal_id: i64) -> Result<Vec<Attestation>, BridgeError> {
        let mut conn = self.conn()?;
        Ok(attestations::table
            .filter(attestations::deal_id.eq(deal_id))
            .order(attestations::created_at.asc())
            .select(Attestation::as_select())
            .load(&mut conn)?)
    }
}
