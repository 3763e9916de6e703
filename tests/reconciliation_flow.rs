//! End-to-end flows through the service layer against real SQLite

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;

use escrow_bridge::chain::{ChainDealInfo, ChainObserver};
use escrow_bridge::config::{Config, ConfigHandle};
use escrow_bridge::db::{
    self, DbPool, DealMerge, DealStatus, LockPaymentStatus, NewContentInput, NewDealInput,
    UploadStatus,
};
use escrow_bridge::services::{ItemOutcome, RefundBroadcaster, ReleaseDecision, Services};
use escrow_bridge::{BridgeError, LoggingRefundBroadcaster};

/// Observer answering from a table keyed by deal CID
#[derive(Default)]
struct TableObserver {
    answers: Mutex<HashMap<String, Result<ChainDealInfo, String>>>,
}

impl TableObserver {
    fn set(&self, deal_cid: &str, answer: Result<ChainDealInfo, String>) {
        self.answers.lock().unwrap().insert(deal_cid.to_string(), answer);
    }
}

#[async_trait::async_trait]
impl ChainObserver for TableObserver {
    async fn get_deal_info(&self, deal_cid: &str) -> Result<ChainDealInfo, BridgeError> {
        match self.answers.lock().unwrap().get(deal_cid) {
            Some(Ok(info)) => Ok(info.clone()),
            Some(Err(msg)) => Err(BridgeError::Upstream(msg.clone())),
            None => Err(BridgeError::Upstream(format!("unknown deal {}", deal_cid))),
        }
    }
}

fn active(deal_id: i64) -> ChainDealInfo {
    ChainDealInfo {
        status: "active".to_string(),
        verified: true,
        deal_id,
        cost_computed: Decimal::new(25, 1),
    }
}

fn config(threshold: u32) -> ConfigHandle {
    let mut config = Config::default();
    config.attestation.threshold = threshold;
    ConfigHandle::new(config)
}

fn services(pool: DbPool, observer: Arc<TableObserver>, threshold: u32) -> Services {
    Services::new(pool, observer, config(threshold))
}

fn escrow(fingerprint: &str, amount: i64) -> NewContentInput {
    NewContentInput {
        fingerprint: fingerprint.to_string(),
        size_bytes: 1024,
        upload_status: UploadStatus::Stored,
        locked_amount: Decimal::from(amount),
    }
}

fn deal(
    fingerprint: &str,
    deal_cid: &str,
    deal_id: Option<i64>,
    status: DealStatus,
) -> NewDealInput {
    NewDealInput {
        fingerprint: fingerprint.to_string(),
        deal_cid: deal_cid.to_string(),
        deal_id,
        provider_id: "f01234".to_string(),
        verified: false,
        committed_duration_epochs: 518_400,
        deal_status: status,
    }
}

fn no_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

#[tokio::test]
async fn test_active_deal_with_quorum_releases_once() {
    let observer = Arc::new(TableObserver::default());
    let services = services(db::open_in_memory().unwrap(), observer.clone(), 2);
    let shutdown = no_shutdown();

    services.ledger.record_upload(&escrow("cidA", 10)).unwrap();
    let created = services
        .registry
        .create_deal(&deal("cidA", "bafy-a", Some(1), DealStatus::Published))
        .unwrap();
    observer.set("bafy-a", Ok(active(1)));

    let report = services.reconciler.run(&shutdown).await.unwrap();
    assert_eq!(report.updated(), 1);

    let reconciled = services.registry.get(&created.id).unwrap().unwrap();
    assert_eq!(reconciled.deal_status, DealStatus::Active);
    assert_eq!(reconciled.lock_payment_status, LockPaymentStatus::Processing);
    assert!(reconciled.verified);
    assert_eq!(reconciled.cost_computed, Some(Decimal::new(25, 1)));

    // One signer is not enough
    services.attestations.record_attestation(1, "alice").unwrap();
    assert!(matches!(
        services.release.evaluate("cidA").unwrap(),
        ReleaseDecision::NotEligible { .. }
    ));

    services.attestations.record_attestation(1, "bob").unwrap();
    match services.release.evaluate("cidA").unwrap() {
        ReleaseDecision::Released { amount, deal_ref, .. } => {
            assert_eq!(amount, Decimal::from(10));
            assert_eq!(deal_ref, created.id);
        }
        other => panic!("expected release, got {:?}", other),
    }

    assert_eq!(
        services.release.evaluate("cidA").unwrap(),
        ReleaseDecision::AlreadyReleased
    );
    assert_eq!(services.ledger.count_releases("cidA").unwrap(), 1);

    let release = services.ledger.get_release("cidA").unwrap().unwrap();
    assert_eq!(release.released_amount, Decimal::from(10));

    let paid = services.registry.get(&created.id).unwrap().unwrap();
    assert_eq!(paid.lock_payment_status, LockPaymentStatus::Success);

    let summary = services.queries.deal_summary_by_fingerprint("cidA").unwrap();
    assert!(summary.unlock_status);
    assert_eq!(summary.signed_count, 2);

    // Settled deals drop out of reconciliation
    let report = services.reconciler.run(&shutdown).await.unwrap();
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn test_transient_failure_leaves_one_deal_for_next_cycle() {
    let observer = Arc::new(TableObserver::default());
    let services = services(db::open_in_memory().unwrap(), observer.clone(), 2);
    let shutdown = no_shutdown();

    let mut ids = Vec::new();
    for (n, cid) in ["bafy-1", "bafy-2", "bafy-3"].iter().enumerate() {
        let created = services
            .registry
            .create_deal(&deal(&format!("fp-{}", n), cid, None, DealStatus::Published))
            .unwrap();
        ids.push(created.id);
    }
    observer.set("bafy-1", Ok(active(11)));
    observer.set("bafy-2", Err("connection reset".to_string()));
    observer.set("bafy-3", Ok(active(13)));

    let report = services.reconciler.run(&shutdown).await.unwrap();
    assert_eq!(report.total(), 3);
    assert_eq!(report.updated(), 2);
    assert!(matches!(report.outcome_for(&ids[1]), Some(ItemOutcome::Failed { .. })));

    let untouched = services.registry.get(&ids[1]).unwrap().unwrap();
    assert_eq!(untouched.deal_status, DealStatus::Published);
    assert_eq!(untouched.lock_payment_status, LockPaymentStatus::Created);
    assert_eq!(
        services.registry.get(&ids[0]).unwrap().unwrap().deal_id,
        Some(11)
    );

    // Next cycle picks it up
    observer.set("bafy-2", Ok(active(12)));
    let report = services.reconciler.run(&shutdown).await.unwrap();
    assert_eq!(report.outcome_for(&ids[1]), Some(&ItemOutcome::Updated));
    assert_eq!(
        services.registry.get(&ids[1]).unwrap().unwrap().deal_status,
        DealStatus::Active
    );
}

#[tokio::test]
async fn test_expired_deal_is_swept_once_and_refunded() {
    let mut config = Config::default();
    config.expiry.start_epoch_hours = 72;
    config.expiry.expire_days = 4;
    let pool = db::open_in_memory().unwrap();
    let observer = Arc::new(TableObserver::default());
    let services = Services::new(pool, observer, ConfigHandle::new(config));
    let shutdown = no_shutdown();

    let t0 = Utc::now() - Duration::days(8);
    services.ledger.record_upload(&escrow("cidB", 5)).unwrap();
    let stale = services
        .registry
        .create_deal_at(&deal("cidB", "bafy-b", Some(2), DealStatus::Published), t0)
        .unwrap();
    let fresh = services
        .registry
        .create_deal(&deal("cidB", "bafy-c", Some(3), DealStatus::Published))
        .unwrap();

    let report = services.sweeper.sweep(&shutdown).unwrap();
    assert_eq!(report.updated(), 1);

    let expired = services.registry.get(&stale.id).unwrap().unwrap();
    assert_eq!(expired.deal_status, DealStatus::Expired);
    assert_eq!(expired.lock_payment_status, LockPaymentStatus::Refunding);
    assert_eq!(
        services.registry.get(&fresh.id).unwrap().unwrap().deal_status,
        DealStatus::Published
    );

    let again = services.sweeper.sweep(&shutdown).unwrap();
    assert_eq!(again.total(), 0);
    assert_eq!(
        services.registry.get(&stale.id).unwrap().unwrap(),
        expired
    );

    // Refund is offered until confirmed
    let broadcaster: Arc<dyn RefundBroadcaster> = Arc::new(LoggingRefundBroadcaster);
    let dispatched = services.release.dispatch_refunds(&broadcaster, &shutdown).await.unwrap();
    assert_eq!(dispatched.updated(), 1);

    assert!(services.release.confirm_refund(&stale.id).unwrap());
    assert!(!services.release.confirm_refund(&stale.id).unwrap());
    assert_eq!(
        services.registry.get(&stale.id).unwrap().unwrap().lock_payment_status,
        LockPaymentStatus::Refunded
    );

    let dispatched = services.release.dispatch_refunds(&broadcaster, &shutdown).await.unwrap();
    assert_eq!(dispatched.total(), 0);

    let history: Vec<_> = services
        .registry
        .transitions(&stale.id)
        .unwrap()
        .into_iter()
        .map(|t| (t.to_status, t.to_lock_status))
        .collect();
    assert_eq!(
        history,
        vec![
            ("expired".to_string(), "refunding".to_string()),
            ("expired".to_string(), "refunded".to_string()),
        ]
    );
}

#[test]
fn test_concurrent_release_writes_one_record() {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = db::open(&dir.path().join("bridge.db"), 8).unwrap();
    let services = services(pool, Arc::new(TableObserver::default()), 1);

    services.ledger.record_upload(&escrow("cidC", 42)).unwrap();
    let created = services
        .registry
        .create_deal(&deal("cidC", "bafy-d", Some(7), DealStatus::Published))
        .unwrap();
    let merge =
        DealMerge::from_deal(&created).status(DealStatus::Active, LockPaymentStatus::Processing);
    services.registry.apply_merge(&created, &merge, "test").unwrap();
    services.attestations.record_attestation(7, "alice").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = services.release.clone();
            std::thread::spawn(move || engine.evaluate("cidC").unwrap())
        })
        .collect();
    let decisions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let released = decisions
        .iter()
        .filter(|d| matches!(d, ReleaseDecision::Released { .. }))
        .count();
    assert_eq!(released, 1);
    assert!(decisions
        .iter()
        .all(|d| matches!(d, ReleaseDecision::Released { .. } | ReleaseDecision::AlreadyReleased)));
    assert_eq!(services.ledger.count_releases("cidC").unwrap(), 1);
}

#[test]
fn test_attestations_are_idempotent_per_signer() {
    let services = services(db::open_in_memory().unwrap(), Arc::new(TableObserver::default()), 2);

    let first = services.attestations.record_batch("5, 6,x", "alice").unwrap();
    assert_eq!(first.recorded, vec![5, 6]);
    assert_eq!(first.rejected, vec!["x".to_string()]);

    let second = services.attestations.record_batch("5", "alice").unwrap();
    assert!(second.recorded.is_empty());
    assert_eq!(second.already_recorded, vec![5]);

    assert_eq!(services.attestations.count_attestations(5).unwrap(), 1);
    assert!(!services.attestations.threshold_met(5).unwrap());

    services.attestations.record_attestation(5, "bob").unwrap();
    assert!(services.attestations.threshold_met(5).unwrap());
}

#[test]
fn test_duration_bounds_are_inclusive() {
    let services = services(db::open_in_memory().unwrap(), Arc::new(TableObserver::default()), 2);

    for (epochs, ok) in [
        (518_399, false),
        (518_400, true),
        (1_540_000, true),
        (1_540_001, false),
    ] {
        let mut input = deal("cidD", "bafy-e", None, DealStatus::Proposed);
        input.committed_duration_epochs = epochs;
        let result = services.registry.create_deal(&input);
        assert_eq!(result.is_ok(), ok, "epochs {}", epochs);
        if !ok {
            assert!(matches!(result, Err(BridgeError::InvalidInput(_))));
        }
    }
}
