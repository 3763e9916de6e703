//! Job scheduling
//!
//! A trigger source pushes [`JobName`] events onto a channel; the [`Scheduler`]
//! turns each event into a run of the registered [`Job`]. Production wiring
//! uses [`spawn_interval_triggers`]; tests send events by hand.
//!
//! A job never overlaps with itself. Within the process the scheduler tracks
//! which jobs are in flight; across processes each run holds the job's row in
//! `job_locks` and renews its lease while it runs. A firing that arrives while
//! the previous run is still going is dropped. Different jobs run concurrently.
//!
//! The lock and the in-flight slot are released when the run ends, including
//! when the job panics.

pub mod jobs;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::db::JobLocks;
use crate::error::BridgeError;
use crate::services::BatchReport;

pub use jobs::{ReconcileJob, SweepExpiredJob, UnlockPaymentJob, UpdatePayStatusJob};

/// Named scheduling rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobName {
    CreateTask,
    SendDeal,
    ScanDealStatus,
    UpdatePayStatus,
    UnlockPayment,
    SweepExpiredDeals,
}

impl JobName {
    pub const ALL: [JobName; 6] = [
        JobName::CreateTask,
        JobName::SendDeal,
        JobName::ScanDealStatus,
        JobName::UpdatePayStatus,
        JobName::UnlockPayment,
        JobName::SweepExpiredDeals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::CreateTask => "create-task",
            JobName::SendDeal => "send-deal",
            JobName::ScanDealStatus => "scan-deal-status",
            JobName::UpdatePayStatus => "update-pay-status",
            JobName::UnlockPayment => "unlock-payment",
            JobName::SweepExpiredDeals => "sweep-expired-deals",
        }
    }

    /// Configured cadence, None when the rule is disabled
    pub fn interval(&self, schedule: &ScheduleConfig) -> Option<Duration> {
        let secs = match self {
            JobName::CreateTask => schedule.create_task_secs,
            JobName::SendDeal => schedule.send_deal_secs,
            JobName::ScanDealStatus => schedule.scan_deal_status_secs,
            JobName::UpdatePayStatus => schedule.update_pay_status_secs,
            JobName::UnlockPayment => schedule.unlock_payment_secs,
            JobName::SweepExpiredDeals => schedule.sweep_expired_deals_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobName::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| BridgeError::InvalidInput(format!("unknown job '{}'", s)))
    }
}

/// A periodic unit of work
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Run once. Implementations check `shutdown` between items.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<BatchReport, BridgeError>;
}

/// Spawn one interval timer per enabled rule, each sending its name on `tx`
pub fn spawn_interval_triggers(
    schedule: &ScheduleConfig,
    tx: mpsc::Sender<JobName>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    JobName::ALL
        .into_iter()
        .filter_map(|job| job.interval(schedule).map(|every| (job, every)))
        .map(|(job, every)| {
            let tx = tx.clone();
            let mut shutdown = shutdown.clone();
            info!(job = %job, every_secs = every.as_secs(), "Trigger scheduled");
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(every);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            if tx.send(job).await.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!(job = %job, "Trigger stopped");
            })
        })
        .collect()
}

/// Result of a single firing
#[derive(Debug, PartialEq, Eq)]
pub enum FireOutcome {
    Started,
    /// Previous run is still in flight or holds the job lock
    AlreadyRunning,
    /// No job registered under this name (handled by an external workflow)
    Unregistered,
}

type RunResult = (JobName, Result<BatchReport, BridgeError>);

type InFlight = Arc<Mutex<HashSet<JobName>>>;

fn in_flight_set(set: &Mutex<HashSet<JobName>>) -> MutexGuard<'_, HashSet<JobName>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held by a running job; frees the job lock and the in-flight slot on drop
struct RunGuard {
    name: JobName,
    locks: JobLocks,
    in_flight: InFlight,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release(self.name.as_str()) {
            error!(job = %self.name, error = %e, "Failed to release job lock");
        }
        in_flight_set(&self.in_flight).remove(&self.name);
    }
}

/// How often a running job pushes its lease forward
fn renew_every(lease: chrono::Duration) -> Duration {
    lease
        .to_std()
        .map(|lease| lease / 3)
        .unwrap_or_default()
        .max(Duration::from_millis(10))
}

pub struct Scheduler {
    jobs: HashMap<JobName, Arc<dyn Job>>,
    locks: JobLocks,
    shutdown: watch::Receiver<bool>,
    running: JoinSet<RunResult>,
    in_flight: InFlight,
}

impl Scheduler {
    pub fn new(locks: JobLocks, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            jobs: HashMap::new(),
            locks,
            shutdown,
            running: JoinSet::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_running(&self, name: JobName) -> bool {
        in_flight_set(&self.in_flight).contains(&name)
    }

    pub fn register(&mut self, name: JobName, job: Arc<dyn Job>) -> &mut Self {
        self.jobs.insert(name, job);
        self
    }

    /// Start a run of `name` unless it is already running
    pub fn fire(&mut self, name: JobName) -> Result<FireOutcome, BridgeError> {
        let Some(job) = self.jobs.get(&name).cloned() else {
            debug!(job = %name, "No job registered, ignoring trigger");
            return Ok(FireOutcome::Unregistered);
        };

        if self.is_running(name) || !self.locks.try_acquire(name.as_str())? {
            warn!(job = %name, "Previous run still in progress, skipping trigger");
            return Ok(FireOutcome::AlreadyRunning);
        }
        in_flight_set(&self.in_flight).insert(name);

        let guard = RunGuard {
            name,
            locks: self.locks.clone(),
            in_flight: Arc::clone(&self.in_flight),
        };
        let locks = self.locks.clone();
        let every = renew_every(locks.lease());
        let shutdown = self.shutdown.clone();

        self.running.spawn(async move {
            let _guard = guard;
            debug!(job = %name, "Job started");

            let run = job.run(shutdown);
            tokio::pin!(run);
            let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let result = loop {
                tokio::select! {
                    result = &mut run => break result,
                    _ = heartbeat.tick() => match locks.renew(name.as_str()) {
                        Ok(true) => {}
                        Ok(false) => warn!(job = %name, "Job lock lost while running"),
                        Err(e) => warn!(job = %name, error = %e, "Failed to renew job lock"),
                    },
                }
            };
            (name, result)
        });
        Ok(FireOutcome::Started)
    }

    /// Wait for the next in-flight run to finish
    pub async fn join_next(&mut self) -> Option<RunResult> {
        loop {
            match self.running.join_next().await? {
                Ok(result) => return Some(result),
                Err(e) => error!(error = %e, "Job task panicked or was cancelled"),
            }
        }
    }

    /// Wait for every in-flight run
    pub async fn drain(&mut self) -> Vec<RunResult> {
        let mut results = Vec::new();
        while let Some(result) = self.join_next().await {
            results.push(result);
        }
        results
    }

    /// Dispatch triggers until shutdown, then wait for in-flight runs
    pub async fn run(mut self, mut triggers: mpsc::Receiver<JobName>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                trigger = triggers.recv() => {
                    let Some(name) = trigger else { break };
                    if let Err(e) = self.fire(name) {
                        error!(job = %name, error = %e, "Failed to start job");
                    }
                }
                Some(finished) = self.running.join_next(), if !self.running.is_empty() => {
                    match finished {
                        Ok((name, Ok(report))) => debug!(
                            job = %name,
                            updated = report.updated(),
                            failed = report.failed(),
                            "Job finished"
                        ),
                        Ok((name, Err(e))) => error!(job = %name, error = %e, "Job failed"),
                        Err(e) => error!(error = %e, "Job task panicked or was cancelled"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(in_flight = self.running.len(), "Scheduler stopping");
        self.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::services::ItemOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Blocks until the gate opens, tracking how many runs overlap
    struct GatedJob {
        gate: watch::Receiver<bool>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GatedJob {
        fn new(gate: watch::Receiver<bool>) -> Self {
            Self {
                gate,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Job for GatedJob {
        async fn run(&self, _shutdown: watch::Receiver<bool>) -> Result<BatchReport, BridgeError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let mut gate = self.gate.clone();
            let opened = gate.wait_for(|open| *open).await.map(|_| ());
            self.running.fetch_sub(1, Ordering::SeqCst);
            opened.map_err(|e| BridgeError::Internal(e.to_string()))?;

            let mut report = BatchReport::new();
            report.push("item", ItemOutcome::Updated);
            Ok(report)
        }
    }

    struct PanickingJob;

    #[async_trait::async_trait]
    impl Job for PanickingJob {
        async fn run(&self, _shutdown: watch::Receiver<bool>) -> Result<BatchReport, BridgeError> {
            panic!("job blew up");
        }
    }

    fn scheduler() -> (Scheduler, watch::Sender<bool>) {
        let locks = JobLocks::new(open_in_memory().unwrap(), "test", chrono::Duration::minutes(30));
        let (tx, rx) = watch::channel(false);
        (Scheduler::new(locks, rx), tx)
    }

    #[test]
    fn test_job_names_parse() {
        for job in JobName::ALL {
            assert_eq!(job.as_str().parse::<JobName>().unwrap(), job);
        }
        assert!("scan".parse::<JobName>().is_err());
    }

    #[test]
    fn test_disabled_rules_have_no_interval() {
        let schedule = ScheduleConfig::default();
        assert_eq!(JobName::CreateTask.interval(&schedule), None);
        assert_eq!(
            JobName::ScanDealStatus.interval(&schedule),
            Some(Duration::from_secs(300))
        );
    }

    #[tokio::test]
    async fn test_same_job_never_overlaps() {
        let (mut scheduler, _shutdown) = scheduler();
        let (gate, gate_rx) = watch::channel(false);
        scheduler.register(JobName::ScanDealStatus, Arc::new(GatedJob::new(gate_rx.clone())));
        scheduler.register(JobName::UnlockPayment, Arc::new(GatedJob::new(gate_rx)));

        assert_eq!(scheduler.fire(JobName::ScanDealStatus).unwrap(), FireOutcome::Started);
        assert_eq!(
            scheduler.fire(JobName::ScanDealStatus).unwrap(),
            FireOutcome::AlreadyRunning
        );
        // A different rule is not blocked
        assert_eq!(scheduler.fire(JobName::UnlockPayment).unwrap(), FireOutcome::Started);

        gate.send(true).unwrap();
        let results = scheduler.drain().await;
        assert_eq!(results.len(), 2);

        assert_eq!(scheduler.fire(JobName::ScanDealStatus).unwrap(), FireOutcome::Started);
        let (name, result) = scheduler.join_next().await.unwrap();
        assert_eq!(name, JobName::ScanDealStatus);
        assert_eq!(result.unwrap().updated(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_rule_is_ignored() {
        let (mut scheduler, _shutdown) = scheduler();
        assert_eq!(scheduler.fire(JobName::SendDeal).unwrap(), FireOutcome::Unregistered);
    }

    #[tokio::test]
    async fn test_run_loop_dispatches_until_shutdown() {
        let (mut scheduler, shutdown) = scheduler();
        let (gate, gate_rx) = watch::channel(false);
        scheduler.register(JobName::SweepExpiredDeals, Arc::new(GatedJob::new(gate_rx)));

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(scheduler.run(rx));

        tx.send(JobName::SweepExpiredDeals).await.unwrap();
        tokio::task::yield_now().await;
        gate.send(true).unwrap();
        shutdown.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_long_run_outlives_lease_without_overlap() {
        let pool = open_in_memory().unwrap();
        let lease = chrono::Duration::milliseconds(200);
        let (_shutdown, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new(JobLocks::new(pool.clone(), "test", lease), rx);

        let (gate, gate_rx) = watch::channel(false);
        let job = Arc::new(GatedJob::new(gate_rx));
        scheduler.register(JobName::ScanDealStatus, job.clone());

        assert_eq!(scheduler.fire(JobName::ScanDealStatus).unwrap(), FireOutcome::Started);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            scheduler.fire(JobName::ScanDealStatus).unwrap(),
            FireOutcome::AlreadyRunning
        );
        // The lease was renewed, so another process cannot take the lock either
        let other = JobLocks::new(pool.clone(), "other", lease);
        assert!(!other.try_acquire("scan-deal-status").unwrap());

        gate.send(true).unwrap();
        assert_eq!(scheduler.drain().await.len(), 1);
        assert_eq!(job.peak.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running(JobName::ScanDealStatus));
        assert!(other.try_acquire("scan-deal-status").unwrap());
    }

    #[tokio::test]
    async fn test_panicking_job_frees_its_lock() {
        let pool = open_in_memory().unwrap();
        let locks = JobLocks::new(pool.clone(), "test", chrono::Duration::minutes(30));
        let (_shutdown, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new(locks, rx);
        scheduler.register(JobName::SweepExpiredDeals, Arc::new(PanickingJob));

        assert_eq!(scheduler.fire(JobName::SweepExpiredDeals).unwrap(), FireOutcome::Started);
        assert!(scheduler.join_next().await.is_none());

        assert!(!scheduler.is_running(JobName::SweepExpiredDeals));
        assert_eq!(scheduler.fire(JobName::SweepExpiredDeals).unwrap(), FireOutcome::Started);
        assert!(scheduler.join_next().await.is_none());

        let other = JobLocks::new(pool, "other", chrono::Duration::minutes(30));
        assert!(other.try_acquire("sweep-expired-deals").unwrap());
    }
}
