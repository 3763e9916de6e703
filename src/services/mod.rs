//! Service layer for escrow-bridge
//!
//! Services hold the reconciliation and release state machine. Each one
//! wraps repository calls (`db/*.rs`) with lifecycle rules and batch
//! reporting.
//!
//! ```text
//! Scheduler / HTTP handlers
//!     ↓
//! Service Layer (reconcile, attest, release, sweep)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod attestation;
pub mod reconciler;
pub mod release;
pub mod report;
pub mod response;
pub mod summary;
pub mod sweeper;

pub use attestation::{AttestationTracker, IngestResult};
pub use reconciler::Reconciler;
pub use release::{
    LoggingRefundBroadcaster, RefundBroadcaster, RefundRequest, ReleaseDecision, ReleaseEngine,
};
pub use report::{BatchReport, ItemOutcome};
pub use summary::{DealQueries, DealSummary};
pub use sweeper::ExpirySweeper;

use std::sync::Arc;

use crate::chain::ChainObserver;
use crate::config::ConfigHandle;
use crate::db::{AttestationStore, DbPool, DealRegistry, EscrowLedger};

/// Service container for dependency injection
#[derive(Clone)]
pub struct Services {
    pub registry: DealRegistry,
    pub ledger: EscrowLedger,
    pub attestations: AttestationTracker,
    pub reconciler: Arc<Reconciler>,
    pub release: ReleaseEngine,
    pub sweeper: Arc<ExpirySweeper>,
    pub queries: DealQueries,
    pub config: ConfigHandle,
}

impl Services {
    pub fn new(pool: DbPool, observer: Arc<dyn ChainObserver>, config: ConfigHandle) -> Self {
        let registry = DealRegistry::new(pool.clone());
        let ledger = EscrowLedger::new(pool.clone());
        let attestations =
            AttestationTracker::new(AttestationStore::new(pool.clone()), config.clone());

        Self {
            reconciler: Arc::new(Reconciler::new(registry.clone(), observer, config.clone())),
            release: ReleaseEngine::new(
                pool,
                registry.clone(),
                ledger.clone(),
                attestations.clone(),
            ),
            sweeper: Arc::new(ExpirySweeper::new(registry.clone(), config.clone())),
            queries: DealQueries::new(registry.clone(), ledger.clone(), attestations.clone()),
            registry,
            ledger,
            attestations,
            config,
        }
    }
}
