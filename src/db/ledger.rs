//! Escrow ledger - content records, locked escrow and release records
//!
//! Escrow rows are append-only. A release row, once written, is the only
//! evidence that payment left escrow; its primary key on `fingerprint` makes a
//! second release impossible regardless of how many evaluators race.

use diesel::prelude::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use super::models::{
    current_timestamp, ContentRecordRow, EscrowRecord, EscrowRecordRow, ReleaseRecord,
    ReleaseRecordRow, UploadStatus,
};
use super::schema::{content_records, escrow_records, release_records};
use super::{DbPool, PooledConn};
use crate::error::BridgeError;

/// Input from the upload workflow
#[derive(Debug, Clone, Deserialize)]
pub struct NewContentInput {
    pub fingerprint: String,
    pub size_bytes: i64,
    #[serde(default = "default_upload_status")]
    pub upload_status: UploadStatus,
    pub locked_amount: Decimal,
}

fn default_upload_status() -> UploadStatus {
    UploadStatus::Stored
}

/// Outcome of attempting to write a release row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseInsert {
    Inserted,
    AlreadyReleased,
}

// ============================================================================
// Connection-level operations (usable inside a transaction)
// ============================================================================

pub fn get_escrow(
    conn: &mut SqliteConnection,
    fingerprint: &str,
) -> Result<Option<EscrowRecord>, BridgeError> {
    escrow_records::table
        .filter(escrow_records::fingerprint.eq(fingerprint))
        .select(EscrowRecordRow::as_select())
        .first(conn)
        .optional()?
        .map(EscrowRecord::try_from)
        .transpose()
}

pub fn release_exists(conn: &mut SqliteConnection, fingerprint: &str) -> Result<bool, BridgeError> {
    let count: i64 = release_records::table
        .filter(release_records::fingerprint.eq(fingerprint))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// Insert a release row; a key collision means someone else already released
pub fn insert_release(
    conn: &mut SqliteConnection,
    fingerprint: &str,
    amount: Decimal,
    deal_ref: &str,
) -> Result<ReleaseInsert, BridgeError> {
    let row = ReleaseRecordRow {
        fingerprint: fingerprint.to_string(),
        released_amount: amount.to_string(),
        deal_ref: deal_ref.to_string(),
        created_at: current_timestamp(),
    };

    let inserted = diesel::insert_or_ignore_into(release_records::table)
        .values(&row)
        .execute(conn)?;

    if inserted == 0 {
        debug!(fingerprint, "Release row already present");
        Ok(ReleaseInsert::AlreadyReleased)
    } else {
        Ok(ReleaseInsert::Inserted)
    }
}

// ============================================================================
// Escrow Ledger
// ============================================================================

/// Pool-backed view over content, escrow and release records
#[derive(Clone)]
pub struct EscrowLedger {
    pool: DbPool,
}

impl EscrowLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConn, BridgeError> {
        self.pool
            .get()
            .map_err(|e| BridgeError::Internal(format!("Failed to get connection: {}", e)))
    }

    /// Create the content record and its escrow entry, exactly once per fingerprint
    pub fn record_upload(&self, input: &NewContentInput) -> Result<EscrowRecord, BridgeError> {
        if input.fingerprint.trim().is_empty() {
            return Err(BridgeError::InvalidInput("fingerprint is required".into()));
        }
        if input.locked_amount.is_sign_negative() {
            return Err(BridgeError::InvalidInput("locked amount must not be negative".into()));
        }

        let now = current_timestamp();
        let content = ContentRecordRow {
            fingerprint: input.fingerprint.clone(),
            size_bytes: input.size_bytes,
            upload_status: input.upload_status.as_str().to_string(),
            created_at: now.clone(),
        };
        let escrow = EscrowRecordRow {
            fingerprint: input.fingerprint.clone(),
            locked_amount: input.locked_amount.to_string(),
            created_at: now,
        };

        let mut conn = self.conn()?;
        let result = conn.immediate_transaction::<_, BridgeError, _>(|conn| {
            diesel::insert_into(content_records::table)
                .values(&content)
                .execute(conn)?;
            diesel::insert_into(escrow_records::table)
                .values(&escrow)
                .execute(conn)?;
            Ok(())
        });

        match result {
            Ok(()) => {
                info!(
                    fingerprint = %input.fingerprint,
                    amount = %input.locked_amount,
                    "Escrow recorded"
                );
                EscrowRecord::try_from(escrow)
            }
            Err(e) if e.is_unique_violation() => Err(BridgeError::Conflict(format!(
                "escrow already recorded for {}",
                input.fingerprint
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn get_content(&self, fingerprint: &str) -> Result<Option<ContentRecordRow>, BridgeError> {
        let mut conn = self.conn()?;
        Ok(content_records::table
            .filter(content_records::fingerprint.eq(fingerprint))
            .select(ContentRecordRow::as_select())
            .first(&mut conn)
            .optional()?)
    }

    pub fn get_escrow(&self, fingerprint: &str) -> Result<Option<EscrowRecord>, BridgeError> {
        let mut conn = self.conn()?;
        get_escrow(&mut conn, fingerprint)
    }

    pub fn get_release(&self, fingerprint: &str) -> Result<Option<ReleaseRecord>, BridgeError> {
        let mut conn = self.conn()?;
        release_records::table
            .filter(release_records::fingerprint.eq(fingerprint))
            .select(ReleaseRecordRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(ReleaseRecord::try_from)
            .transpose()
    }

    pub fn release_exists(&self, fingerprint: &str) -> Result<bool, BridgeError> {
        let mut conn = self.conn()?;
        release_exists(&mut conn, fingerprint)
    }

    pub fn count_releases(&self, fingerprint: &str) -> Result<i64, BridgeError> {
        let mut conn = self.conn()?;
        Ok(release_records::table
            .filter(release_records::fingerprint.eq(fingerprint))
            .count()
            .get_result(&mut conn)?)
    }
}
