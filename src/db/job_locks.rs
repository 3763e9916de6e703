//! Named advisory locks for periodic jobs
//!
//! A lock row names its holder and when it was taken. A row older than the
//! lease is considered abandoned (crashed process) and may be taken over.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::{debug, warn};

use super::models::{format_timestamp, parse_timestamp};
use super::schema::job_locks;
use super::{DbPool, PooledConn};
use crate::error::BridgeError;

#[derive(Clone)]
pub struct JobLocks {
    pool: DbPool,
    holder: String,
    lease: chrono::Duration,
}

impl JobLocks {
    /// `holder` identifies this process; `lease` bounds how long a lock survives its owner
    pub fn new(pool: DbPool, holder: impl Into<String>, lease: chrono::Duration) -> Self {
        Self {
            pool,
            holder: holder.into(),
            lease,
        }
    }

    fn conn(&self) -> Result<PooledConn, BridgeError> {
        self.pool
            .get()
            .map_err(|e| BridgeError::Internal(format!("Failed to get connection: {}", e)))
    }

    pub fn try_acquire(&self, job: &str) -> Result<bool, BridgeError> {
        self.try_acquire_at(job, Utc::now())
    }

    /// Take the lock if free or stale. Returns false when another run holds it.
    pub fn try_acquire_at(&self, job: &str, now: DateTime<Utc>) -> Result<bool, BridgeError> {
        let mut conn = self.conn()?;
        let acquired_at = format_timestamp(now);

        conn.immediate_transaction::<_, BridgeError, _>(|conn| {
            let existing: Option<(String, String)> = job_locks::table
                .filter(job_locks::job_name.eq(job))
                .select((job_locks::holder, job_locks::acquired_at))
                .first(conn)
                .optional()?;

            match existing {
                None => {
                    diesel::insert_into(job_locks::table)
                        .values((
                            job_locks::job_name.eq(job),
                            job_locks::holder.eq(&self.holder),
                            job_locks::acquired_at.eq(&acquired_at),
                        ))
                        .execute(conn)?;
                    debug!(job, "Job lock acquired");
                    Ok(true)
                }
                Some((holder, taken)) => {
                    let taken = parse_timestamp(&taken)?;
                    if now - taken < self.lease {
                        return Ok(false);
                    }
                    warn!(job, stale_holder = %holder, "Taking over stale job lock");
                    diesel::update(job_locks::table.filter(job_locks::job_name.eq(job)))
                        .set((
                            job_locks::holder.eq(&self.holder),
                            job_locks::acquired_at.eq(&acquired_at),
                        ))
                        .execute(conn)?;
                    Ok(true)
                }
            }
        })
    }

    pub fn lease(&self) -> chrono::Duration {
        self.lease
    }

    pub fn renew(&self, job: &str) -> Result<bool, BridgeError> {
        self.renew_at(job, Utc::now())
    }

    /// Push the lease of a lock held by this process forward to `now`.
    /// Returns false when the lock is no longer ours.
    pub fn renew_at(&self, job: &str, now: DateTime<Utc>) -> Result<bool, BridgeError> {
        let mut conn = self.conn()?;
        let renewed = diesel::update(
            job_locks::table
                .filter(job_locks::job_name.eq(job))
                .filter(job_locks::holder.eq(&self.holder)),
        )
        .set(job_locks::acquired_at.eq(format_timestamp(now)))
        .execute(&mut conn)?;
        Ok(renewed == 1)
    }

    /// Release a lock held by this process
    pub fn release(&self, job: &str) -> Result<(), BridgeError> {
        let mut conn = self.conn()?;
        diesel::delete(
            job_locks::table
                .filter(job_locks::job_name.eq(job))
                .filter(job_locks::holder.eq(&self.holder)),
        )
        .execute(&mut conn)?;
        debug!(job, "Job lock released");
        Ok(())
    }
}
