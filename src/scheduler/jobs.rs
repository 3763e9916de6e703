//! Job adapters binding services to scheduling rules

use std::sync::Arc;

use tokio::sync::watch;

use super::Job;
use crate::error::BridgeError;
use crate::services::{BatchReport, ExpirySweeper, Reconciler, RefundBroadcaster, ReleaseEngine};

/// Run blocking database work off the async executor
async fn blocking<F>(f: F) -> Result<BatchReport, BridgeError>
where
    F: FnOnce() -> Result<BatchReport, BridgeError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::Internal(format!("Blocking job task failed: {}", e)))?
}

/// scan-deal-status
pub struct ReconcileJob(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl Job for ReconcileJob {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<BatchReport, BridgeError> {
        self.0.run(&shutdown).await
    }
}

/// unlock-payment
pub struct UnlockPaymentJob(pub ReleaseEngine);

#[async_trait::async_trait]
impl Job for UnlockPaymentJob {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<BatchReport, BridgeError> {
        let engine = self.0.clone();
        blocking(move || engine.evaluate_pending(&shutdown)).await
    }
}

/// update-pay-status
pub struct UpdatePayStatusJob {
    pub engine: ReleaseEngine,
    pub broadcaster: Arc<dyn RefundBroadcaster>,
}

#[async_trait::async_trait]
impl Job for UpdatePayStatusJob {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<BatchReport, BridgeError> {
        self.engine.dispatch_refunds(&self.broadcaster, &shutdown).await
    }
}

/// sweep-expired-deals
pub struct SweepExpiredJob(pub Arc<ExpirySweeper>);

#[async_trait::async_trait]
impl Job for SweepExpiredJob {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<BatchReport, BridgeError> {
        let sweeper = Arc::clone(&self.0);
        blocking(move || sweeper.sweep(&shutdown)).await
    }
}
