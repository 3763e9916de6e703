//! SQLite persistence for escrow, deal, attestation and release records
//!
//! ## Tables
//!
//! - `content_records` - One row per uploaded fingerprint (written by the upload workflow)
//! - `escrow_records` - Locked payment per fingerprint, append-only
//! - `deals` - Deal lifecycle, guarded by a `version` column for compare-and-swap
//! - `deal_transitions` - Audit log of every status change
//! - `attestations` - One row per (deal, signer)
//! - `release_records` - At most one per fingerprint; the primary key is the release guard
//! - `job_locks` - Named advisory locks for periodic jobs

pub mod attestations;
pub mod deals;
pub mod job_locks;
pub mod ledger;
pub mod models;
pub mod schema;

use std::path::Path;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use tracing::{debug, info};

use crate::error::BridgeError;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

pub use attestations::AttestationStore;
pub use deals::{DealMerge, DealRegistry, NewDealInput};
pub use job_locks::JobLocks;
pub use ledger::{EscrowLedger, NewContentInput, ReleaseInsert};
pub use models::{current_timestamp, Deal, DealStatus, LockPaymentStatus, UploadStatus};

/// Per-connection pragmas
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Open (or create) the database file and build a connection pool
pub fn open(path: &Path, pool_size: u32) -> Result<DbPool, BridgeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(path = %path.display(), "Opening SQLite database");

    let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
    let pool = Pool::builder()
        .max_size(pool_size)
        .connection_customizer(Box::new(ConnectionOptions {
            busy_timeout: Duration::from_secs(5),
        }))
        .build(manager)
        .map_err(|e| BridgeError::Internal(format!("Failed to build pool: {}", e)))?;

    let mut conn = pool.get()?;
    schema::init_schema(&mut conn)?;
    Ok(pool)
}

/// Open an in-memory database (for testing)
///
/// Every SQLite `:memory:` connection is its own database, so the pool is
/// pinned to a single connection.
pub fn open_in_memory() -> Result<DbPool, BridgeError> {
    debug!("Opening in-memory SQLite database");

    let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| BridgeError::Internal(format!("Failed to build pool: {}", e)))?;

    let mut conn = pool.get()?;
    schema::init_schema(&mut conn)?;
    Ok(pool)
}

/// Row counts for the health endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub deals: i64,
    pub open_deals: i64,
    pub escrows: i64,
    pub releases: i64,
}

pub fn stats(pool: &DbPool) -> Result<DbStats, BridgeError> {
    use models::LockPaymentStatus;
    use schema::{deals, escrow_records, release_records};

    let mut conn = pool.get()?;
    let settled: Vec<&str> = LockPaymentStatus::SETTLED.iter().map(|s| s.as_str()).collect();

    Ok(DbStats {
        deals: deals::table.count().get_result(&mut conn)?,
        open_deals: deals::table
            .filter(deals::lock_payment_status.ne_all(settled))
            .count()
            .get_result(&mut conn)?,
        escrows: escrow_records::table.count().get_result(&mut conn)?,
        releases: release_records::table.count().get_result(&mut conn)?,
    })
}
