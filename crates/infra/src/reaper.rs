//! Expiry reaper: moves overdue open negotiations to `Expired`.

use std::collections::HashSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use haggle_core::Clock;
use haggle_events::EventBus;
use haggle_negotiation::{Negotiation, NegotiationId};

use crate::directory::Directory;
use crate::error::ServiceError;
use crate::repository::NegotiationRepository;
use crate::service::{NegotiationEnvelope, NegotiationService};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Distinct records returned by the due-for-expiry scans.
    pub scanned: usize,
    pub expired: usize,
    /// Records that changed underneath the sweep (already closed, gone, or conflicting).
    pub skipped: usize,
}

/// Cumulative statistics of a spawned reaper.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaperStats {
    pub sweeps_completed: u64,
    pub sweeps_failed: u64,
    pub negotiations_expired: u64,
    pub races_skipped: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

/// Handle to a reaper running on a background thread.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ReaperStats>>,
}

impl ReaperHandle {
    /// Request graceful shutdown and wait for the current sweep to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ReaperStats {
        match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Periodic sweep over negotiations whose offer window has closed.
///
/// The reaper holds no state between sweeps; correctness relies on the
/// service's version check, so it can run alongside user traffic.
pub struct ExpiryReaper<R, D, B> {
    service: Arc<NegotiationService<R, D, B>>,
    batch_limit: usize,
}

impl<R, D, B> ExpiryReaper<R, D, B>
where
    R: NegotiationRepository,
    D: Directory,
    B: EventBus<NegotiationEnvelope>,
{
    pub fn new(service: Arc<NegotiationService<R, D, B>>, batch_limit: usize) -> Self {
        Self {
            service,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Expire every record due at `now`, fetching `batch_limit` records per page.
    ///
    /// Lost races on individual records are counted as skipped and not retried
    /// within the same sweep; repository or bus failures abort the sweep.
    pub fn run_expiry_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let mut report = SweepReport::default();
        let mut seen: HashSet<NegotiationId> = HashSet::new();

        loop {
            // Skipped records may still be due; widen the page so they cannot crowd out the rest.
            let limit = self.batch_limit + report.skipped;
            let page = self.service.repository().find_due_for_expiry(now, limit)?;
            let last_page = page.len() < limit;

            let fresh: Vec<Negotiation> = page
                .into_iter()
                .filter(|n| seen.insert(n.id_typed()))
                .collect();
            if fresh.is_empty() {
                break;
            }
            report.scanned += fresh.len();

            for n in fresh {
                match self.service.expire(n.tenant_id(), n.id_typed(), now) {
                    Ok(_) => report.expired += 1,
                    Err(err) if err.is_benign_race() => {
                        debug!(
                            tenant_id = %n.tenant_id(),
                            negotiation_id = %n.id_typed(),
                            error = %err,
                            "skipping negotiation during expiry sweep"
                        );
                        report.skipped += 1;
                    }
                    Err(err) => return Err(err),
                }
            }

            if last_page {
                break;
            }
        }

        Ok(report)
    }
}

impl<R, D, B> ExpiryReaper<R, D, B>
where
    R: NegotiationRepository + 'static,
    D: Directory + 'static,
    B: EventBus<NegotiationEnvelope> + 'static,
{
    /// Run a sweep every `interval` on a dedicated thread, reading `now` from `clock`.
    pub fn spawn<C>(self, clock: C, interval: Duration) -> ReaperHandle
    where
        C: Clock + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ReaperStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name("expiry-reaper".to_string())
            .spawn(move || reaper_loop(self, clock, interval, shutdown_rx, stats_clone))
            .expect("failed to spawn expiry reaper thread");

        ReaperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn reaper_loop<R, D, B, C>(
    reaper: ExpiryReaper<R, D, B>,
    clock: C,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ReaperStats>>,
) where
    R: NegotiationRepository,
    D: Directory,
    B: EventBus<NegotiationEnvelope>,
    C: Clock,
{
    info!(
        interval_ms = interval.as_millis() as u64,
        batch_limit = reaper.batch_limit,
        "expiry reaper started"
    );

    loop {
        let now = clock.now();
        let outcome = reaper.run_expiry_sweep(now);

        if let Ok(mut s) = stats.lock() {
            s.last_sweep_at = Some(now);
            match &outcome {
                Ok(report) => {
                    s.sweeps_completed += 1;
                    s.negotiations_expired += report.expired as u64;
                    s.races_skipped += report.skipped as u64;
                }
                Err(_) => s.sweeps_failed += 1,
            }
        }

        match outcome {
            Ok(report) if report.scanned > 0 => {
                info!(
                    scanned = report.scanned,
                    expired = report.expired,
                    skipped = report.skipped,
                    "expiry sweep finished"
                );
            }
            Ok(_) => debug!("expiry sweep found nothing due"),
            Err(err) => error!(error = %err, "expiry sweep failed; retrying next tick"),
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("expiry reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::TimeZone;
    use haggle_core::{
        AggregateRoot, Currency, ExpectedVersion, ManualClock, Money, OrderId, TenantId, UserId,
        VendorId,
    };
    use haggle_events::{InMemoryBusError, InMemoryEventBus, Subscription};
    use haggle_negotiation::{NegotiationRules, NegotiationStatus, Terms};

    use crate::directory::InMemoryDirectory;
    use crate::error::RepositoryError;
    use crate::repository::{InMemoryNegotiationRepository, NegotiationFilter};
    use crate::service::CreateNegotiation;

    /// In-memory store whose due scan or saves can be switched to fail.
    #[derive(Default)]
    struct FlakyRepository {
        inner: InMemoryNegotiationRepository,
        fail_scan: AtomicBool,
        conflict_saves: AtomicBool,
    }

    impl NegotiationRepository for FlakyRepository {
        fn get(
            &self,
            tenant_id: TenantId,
            id: NegotiationId,
        ) -> Result<Negotiation, RepositoryError> {
            self.inner.get(tenant_id, id)
        }

        fn save(
            &self,
            negotiation: &Negotiation,
            expected_version: ExpectedVersion,
        ) -> Result<(), RepositoryError> {
            if self.conflict_saves.load(Ordering::SeqCst) && negotiation.version() > 1 {
                return Err(RepositoryError::Conflict("concurrent writer".into()));
            }
            self.inner.save(negotiation, expected_version)
        }

        fn find_due_for_expiry(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Negotiation>, RepositoryError> {
            if self.fail_scan.load(Ordering::SeqCst) {
                return Err(RepositoryError::Backend("connection reset".into()));
            }
            self.inner.find_due_for_expiry(now, limit)
        }

        fn list(
            &self,
            tenant_id: TenantId,
            filter: &NegotiationFilter,
        ) -> Result<Vec<Negotiation>, RepositoryError> {
            self.inner.list(tenant_id, filter)
        }
    }

    /// In-memory bus that can be switched to reject publishes.
    #[derive(Default)]
    struct FlakyBus {
        inner: InMemoryEventBus<NegotiationEnvelope>,
        broken: AtomicBool,
    }

    impl EventBus<NegotiationEnvelope> for FlakyBus {
        type Error = InMemoryBusError;

        fn publish(&self, message: NegotiationEnvelope) -> Result<(), Self::Error> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(InMemoryBusError::Poisoned);
            }
            self.inner.publish(message)
        }

        fn subscribe(&self) -> Subscription<NegotiationEnvelope> {
            self.inner.subscribe()
        }
    }

    type Service = NegotiationService<Arc<FlakyRepository>, Arc<InMemoryDirectory>, Arc<FlakyBus>>;

    struct Fixture {
        service: Arc<Service>,
        repository: Arc<FlakyRepository>,
        bus: Arc<FlakyBus>,
        directory: Arc<InMemoryDirectory>,
        tenant_id: TenantId,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(FlakyRepository::default());
        let bus = Arc::new(FlakyBus::default());
        let directory = Arc::new(InMemoryDirectory::new());
        let service = Arc::new(NegotiationService::new(
            repository.clone(),
            directory.clone(),
            bus.clone(),
            NegotiationRules::default(),
        ));
        Fixture {
            service,
            repository,
            bus,
            directory,
            tenant_id: TenantId::new(),
        }
    }

    fn open_expiring_at(f: &Fixture, expires_at: DateTime<Utc>) -> Negotiation {
        let idr = Currency::new("IDR").unwrap();
        let order_id = OrderId::new();
        let vendor_id = VendorId::new();
        f.directory.add_order(f.tenant_id, order_id, idr);
        f.directory.add_vendor(f.tenant_id, vendor_id);

        f.service
            .create_negotiation(
                CreateNegotiation {
                    tenant_id: f.tenant_id,
                    order_id,
                    vendor_id,
                    actor_id: UserId::new(),
                    initial_offer: Money::new(1_000, idr),
                    currency: idr,
                    terms: Terms::default(),
                    expires_at: Some(expires_at),
                    note: None,
                },
                t0(),
            )
            .unwrap()
    }

    fn status_of(f: &Fixture, n: &Negotiation) -> NegotiationStatus {
        f.service
            .get_negotiation(f.tenant_id, n.id_typed())
            .unwrap()
            .status()
    }

    fn wait_for(handle: &ReaperHandle, done: impl Fn(&ReaperStats) -> bool) -> ReaperStats {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = handle.stats();
            if done(&stats) || std::time::Instant::now() >= deadline {
                return stats;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn sweep_expires_only_due_records() {
        let f = fixture();
        let due = open_expiring_at(&f, t0() + chrono::Duration::seconds(1));
        let later = open_expiring_at(&f, t0() + chrono::Duration::hours(1));

        let reaper = ExpiryReaper::new(f.service.clone(), 100);
        let now = t0() + chrono::Duration::seconds(2);
        let report = reaper.run_expiry_sweep(now).unwrap();
        assert_eq!(
            report,
            SweepReport {
                scanned: 1,
                expired: 1,
                skipped: 0
            }
        );

        let expired = f.service.get_negotiation(f.tenant_id, due.id_typed()).unwrap();
        assert_eq!(expired.status(), NegotiationStatus::Expired);
        assert_eq!(expired.closed_at(), Some(now));
        assert_eq!(status_of(&f, &later), NegotiationStatus::Open);

        let again = reaper.run_expiry_sweep(now).unwrap();
        assert_eq!(again, SweepReport::default());
        assert_eq!(
            f.service
                .get_negotiation(f.tenant_id, due.id_typed())
                .unwrap()
                .version(),
            2
        );
    }

    #[test]
    fn one_sweep_pages_through_every_due_record() {
        let f = fixture();
        let due: Vec<Negotiation> = (0..3)
            .map(|_| open_expiring_at(&f, t0() + chrono::Duration::seconds(1)))
            .collect();

        let reaper = ExpiryReaper::new(f.service.clone(), 2);
        let now = t0() + chrono::Duration::seconds(2);
        let report = reaper.run_expiry_sweep(now).unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.expired, 3);
        assert!(due.iter().all(|n| status_of(&f, n) == NegotiationStatus::Expired));
        assert!(f.repository.find_due_for_expiry(now, 10).unwrap().is_empty());
        assert_eq!(reaper.run_expiry_sweep(now).unwrap(), SweepReport::default());
    }

    #[test]
    fn persistent_conflicts_end_the_sweep() {
        let f = fixture();
        for _ in 0..3 {
            open_expiring_at(&f, t0() + chrono::Duration::seconds(1));
        }
        f.repository.conflict_saves.store(true, Ordering::SeqCst);

        let reaper = ExpiryReaper::new(f.service.clone(), 2);
        let report = reaper
            .run_expiry_sweep(t0() + chrono::Duration::seconds(2))
            .unwrap();

        assert_eq!(
            report,
            SweepReport {
                scanned: 3,
                expired: 0,
                skipped: 3
            }
        );
    }

    #[test]
    fn infrastructure_failures_abort_the_sweep() {
        let f = fixture();
        let n = open_expiring_at(&f, t0() + chrono::Duration::seconds(1));
        let reaper = ExpiryReaper::new(f.service.clone(), 10);
        let now = t0() + chrono::Duration::seconds(2);

        f.repository.fail_scan.store(true, Ordering::SeqCst);
        assert!(matches!(
            reaper.run_expiry_sweep(now),
            Err(ServiceError::Infrastructure(_))
        ));
        assert_eq!(status_of(&f, &n), NegotiationStatus::Open);

        // The transition commits before the bus rejects it.
        f.repository.fail_scan.store(false, Ordering::SeqCst);
        f.bus.broken.store(true, Ordering::SeqCst);
        assert!(matches!(
            reaper.run_expiry_sweep(now),
            Err(ServiceError::Infrastructure(_))
        ));
        assert_eq!(status_of(&f, &n), NegotiationStatus::Expired);
    }

    #[test]
    fn spawned_reaper_sweeps_and_shuts_down() {
        let f = fixture();
        let n = open_expiring_at(&f, t0() + chrono::Duration::seconds(1));

        let clock = Arc::new(ManualClock::new(t0() + chrono::Duration::minutes(1)));
        let handle =
            ExpiryReaper::new(f.service.clone(), 10).spawn(clock, Duration::from_millis(10));

        let stats = wait_for(&handle, |s| s.negotiations_expired > 0);
        handle.shutdown();

        assert_eq!(stats.negotiations_expired, 1);
        assert!(stats.sweeps_completed >= 1);
        assert_eq!(stats.sweeps_failed, 0);
        assert_eq!(status_of(&f, &n), NegotiationStatus::Expired);
    }

    #[test]
    fn spawned_reaper_survives_failed_sweeps() {
        let f = fixture();
        let n = open_expiring_at(&f, t0() + chrono::Duration::seconds(1));
        f.repository.fail_scan.store(true, Ordering::SeqCst);

        let clock = Arc::new(ManualClock::new(t0() + chrono::Duration::minutes(1)));
        let handle =
            ExpiryReaper::new(f.service.clone(), 10).spawn(clock, Duration::from_millis(10));

        let failing = wait_for(&handle, |s| s.sweeps_failed >= 2);
        assert!(failing.sweeps_failed >= 2);
        assert_eq!(failing.negotiations_expired, 0);

        f.repository.fail_scan.store(false, Ordering::SeqCst);
        let recovered = wait_for(&handle, |s| s.negotiations_expired > 0);
        handle.shutdown();

        assert_eq!(recovered.negotiations_expired, 1);
        assert!(recovered.sweeps_completed >= 1);
        assert_eq!(status_of(&f, &n), NegotiationStatus::Expired);
    }
}
