//! Disk-space admission control and reservation bookkeeping.
//!
//! The OS lags behind what in-flight stages are about to write, so every
//! stage that creates data first claims the bytes here. [`SpaceLedger`]
//! keeps the sum of live claims per monitored path and admits a request only
//! if `used + reserved + required*(1+margin)` stays under the threshold.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use stowage_core::space::{DiskSpaceInfo, SpaceLimits, SpaceStatus};
use stowage_core::types::Timestamp;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// DiskProbe
// ---------------------------------------------------------------------------

/// Source of volume statistics.
pub trait DiskProbe: Send + Sync {
    fn probe(&self, path: &Path) -> std::io::Result<DiskSpaceInfo>;
}

/// Reads volume statistics with `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    #[cfg(unix)]
    fn probe(&self, path: &Path) -> std::io::Result<DiskSpaceInfo> {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();

        // SAFETY: `c_path` is NUL-terminated and `stat` is a valid out pointer.
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: statvfs returned 0, so the struct is initialised.
        let stat = unsafe { stat.assume_init() };

        let block_size = stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * block_size;
        let free = stat.f_bavail as u64 * block_size;
        Ok(DiskSpaceInfo {
            total_bytes: total,
            used_bytes: total.saturating_sub(free),
            free_bytes: free,
        })
    }

    #[cfg(not(unix))]
    fn probe(&self, _path: &Path) -> std::io::Result<DiskSpaceInfo> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "statvfs is only available on unix",
        ))
    }
}

// ---------------------------------------------------------------------------
// SpaceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SpaceConfig {
    /// When false every admission succeeds; reservations are still tracked.
    pub enabled: bool,
    pub limits: SpaceLimits,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Paths included in [`SpaceLedger::report`].
    pub monitored_paths: Vec<PathBuf>,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limits: SpaceLimits::default(),
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(3600),
            monitored_paths: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// A claim on `bytes` of `path`. Released exactly once.
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    path: PathBuf,
    bytes: u64,
    created_at: Timestamp,
    released: bool,
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Per-path line of [`SpaceLedger::report`].
#[derive(Debug, Clone, Serialize)]
pub struct PathSpaceReport {
    pub path: PathBuf,
    pub status: SpaceStatus,
    pub info: Option<DiskSpaceInfo>,
    pub reserved_bytes: u64,
    pub threshold_bytes: u64,
}

// ---------------------------------------------------------------------------
// SpaceLedger
// ---------------------------------------------------------------------------

pub struct SpaceLedger {
    config: SpaceConfig,
    probe: Arc<dyn DiskProbe>,
    reserved: Mutex<HashMap<PathBuf, u64>>,
    next_id: AtomicU64,
}

impl SpaceLedger {
    pub fn new(config: SpaceConfig, probe: Arc<dyn DiskProbe>) -> Self {
        Self {
            config,
            probe,
            reserved: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, u64>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Volume statistics, or `None` if the probe failed.
    pub fn query(&self, path: &Path) -> Option<DiskSpaceInfo> {
        match self.probe.probe(path) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Disk probe failed");
                None
            }
        }
    }

    /// Bytes currently held by live reservations on `path`.
    pub fn reserved_on(&self, path: &Path) -> u64 {
        self.lock().get(path).copied().unwrap_or(0)
    }

    pub fn status(&self, path: &Path) -> (SpaceStatus, Option<DiskSpaceInfo>) {
        match self.query(path) {
            Some(info) => (
                self.config.limits.status(&info, self.reserved_on(path)),
                Some(info),
            ),
            None => (SpaceStatus::Unavailable, None),
        }
    }

    /// Whether `required` bytes could be claimed on `path` right now.
    pub fn admit(&self, required: u64, path: &Path) -> bool {
        let reserved = self.reserved_on(path);
        self.check(required, path, reserved)
    }

    fn check(&self, required: u64, path: &Path, reserved: u64) -> bool {
        if !self.config.enabled {
            return true;
        }
        match self.query(path) {
            Some(info) => self.config.limits.admits(&info, reserved, required),
            None => false,
        }
    }

    /// Claim `bytes` on `path` if admission still holds under the lock.
    ///
    /// Returns `None` when the claim would exceed the threshold; callers
    /// treat that as backpressure.
    pub fn reserve(&self, path: &Path, bytes: u64) -> Option<Reservation> {
        let mut reserved = self.lock();
        let current = reserved.get(path).copied().unwrap_or(0);
        if !self.check(bytes, path, current) {
            tracing::debug!(path = %path.display(), bytes, reserved = current, "Reservation denied");
            return None;
        }
        *reserved.entry(path.to_path_buf()).or_insert(0) += bytes;
        drop(reserved);

        let reservation = Reservation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            bytes,
            created_at: Utc::now(),
            released: false,
        };
        tracing::debug!(
            reservation_id = reservation.id,
            path = %path.display(),
            bytes,
            "Space reserved"
        );
        Some(reservation)
    }

    /// Return `bytes` on `path` to the pool. Floors at zero.
    pub fn release(&self, path: &Path, bytes: u64) {
        let mut reserved = self.lock();
        if let Some(held) = reserved.get_mut(path) {
            *held = held.saturating_sub(bytes);
            if *held == 0 {
                reserved.remove(path);
            }
        }
    }

    /// Release a reservation. A second call is a no-op.
    pub fn release_reservation(&self, reservation: &mut Reservation) {
        if reservation.released {
            return;
        }
        self.release(&reservation.path, reservation.bytes);
        reservation.released = true;
        tracing::debug!(
            reservation_id = reservation.id,
            bytes = reservation.bytes,
            "Space released"
        );
    }

    /// Poll until `required` bytes are admissible, `timeout` elapses or
    /// `cancel` fires. Never errors; returns the last observed statistics.
    pub async fn wait_for_space(
        &self,
        required: u64,
        path: &Path,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> (bool, Option<DiskSpaceInfo>) {
        let deadline = Instant::now() + timeout;
        let mut logged = false;
        loop {
            let info = self.query(path);
            if self.admit(required, path) {
                return (true, info);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    path = %path.display(),
                    required,
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for disk space"
                );
                return (false, info);
            }
            if !logged {
                tracing::info!(path = %path.display(), required, "Waiting for disk space");
                logged = true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = cancel.cancelled() => return (false, info),
                _ = tokio::time::sleep(poll_interval.min(remaining)) => {}
            }
        }
    }

    /// Status of every monitored path.
    pub fn report(&self) -> Vec<PathSpaceReport> {
        self.config
            .monitored_paths
            .iter()
            .map(|path| {
                let (status, info) = self.status(path);
                PathSpaceReport {
                    path: path.clone(),
                    status,
                    info,
                    reserved_bytes: self.reserved_on(path),
                    threshold_bytes: self.config.limits.threshold_bytes(),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ReservationGuard
// ---------------------------------------------------------------------------

/// Owns a [`Reservation`] and releases whatever it still holds on drop.
pub struct ReservationGuard {
    ledger: Arc<SpaceLedger>,
    reservation: Reservation,
}

impl ReservationGuard {
    pub fn acquire(ledger: &Arc<SpaceLedger>, path: &Path, bytes: u64) -> Option<Self> {
        ledger.reserve(path, bytes).map(|reservation| Self {
            ledger: Arc::clone(ledger),
            reservation,
        })
    }

    pub fn bytes(&self) -> u64 {
        self.reservation.bytes
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// Claim `extra` more bytes under the same admission rule.
    pub fn grow(&mut self, extra: u64) -> bool {
        match self.ledger.reserve(&self.reservation.path, extra) {
            Some(mut added) => {
                self.reservation.bytes += added.bytes;
                added.released = true;
                true
            }
            None => false,
        }
    }

    /// Give back everything above `bytes`.
    pub fn shrink_to(&mut self, bytes: u64) {
        if bytes < self.reservation.bytes {
            let surplus = self.reservation.bytes - bytes;
            self.ledger.release(&self.reservation.path, surplus);
            self.reservation.bytes = bytes;
        }
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.ledger.release_reservation(&mut self.reservation);
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.ledger.release_reservation(&mut self.reservation);
    }
}

impl std::fmt::Debug for ReservationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationGuard")
            .field("reservation", &self.reservation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FixedProbe {
        used: u64,
        fail: AtomicBool,
    }

    impl DiskProbe for FixedProbe {
        fn probe(&self, _path: &Path) -> std::io::Result<DiskSpaceInfo> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("probe offline"));
            }
            Ok(DiskSpaceInfo {
                total_bytes: 10_000,
                used_bytes: self.used,
                free_bytes: 10_000 - self.used,
            })
        }
    }

    fn ledger(used: u64) -> Arc<SpaceLedger> {
        let config = SpaceConfig {
            limits: SpaceLimits {
                max_usage_bytes: 1_000,
                low_water_bytes: 0,
                safety_margin_percent: 10,
            },
            monitored_paths: vec![PathBuf::from("/work")],
            ..Default::default()
        };
        Arc::new(SpaceLedger::new(
            config,
            Arc::new(FixedProbe {
                used,
                fail: AtomicBool::new(false),
            }),
        ))
    }

    fn work() -> &'static Path {
        Path::new("/work")
    }

    // -- reserve / release --------------------------------------------------

    #[test]
    fn reservations_never_exceed_admitted_total() {
        let ledger = ledger(0);
        let mut held = Vec::new();
        while let Some(r) = ledger.reserve(work(), 100) {
            held.push(r);
        }
        // each claim needs 110 with margin; 9 * 100 + 110 > 1000
        assert_eq!(held.len(), 9);
        assert_eq!(ledger.reserved_on(work()), 900);
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let ledger = ledger(0);
        let barrier = std::sync::Barrier::new(16);
        let granted: Vec<Reservation> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        let mut mine = Vec::new();
                        while let Some(r) = ledger.reserve(work(), 100) {
                            mine.push(r);
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(granted.len(), 9);
        assert_eq!(ledger.reserved_on(work()), 900);
    }

    #[test]
    fn double_release_is_noop() {
        let ledger = ledger(0);
        let mut a = ledger.reserve(work(), 100).unwrap();
        let _b = ledger.reserve(work(), 50).unwrap();
        ledger.release_reservation(&mut a);
        ledger.release_reservation(&mut a);
        assert!(a.is_released());
        assert_eq!(ledger.reserved_on(work()), 50);
    }

    #[test]
    fn release_floors_at_zero_and_drops_entry() {
        let ledger = ledger(0);
        let _r = ledger.reserve(work(), 10).unwrap();
        ledger.release(work(), 1_000);
        assert_eq!(ledger.reserved_on(work()), 0);
        assert!(ledger.lock().is_empty());
    }

    #[test]
    fn probe_failure_is_a_denial() {
        let ledger = ledger(0);
        let probe = FixedProbe {
            used: 0,
            fail: AtomicBool::new(true),
        };
        let failing = SpaceLedger::new(ledger.config().clone(), Arc::new(probe));
        assert!(!failing.admit(1, work()));
        assert!(failing.reserve(work(), 1).is_none());
        assert_eq!(failing.status(work()).0, SpaceStatus::Unavailable);
    }

    #[test]
    fn disabled_ledger_always_admits() {
        let config = SpaceConfig {
            enabled: false,
            ..ledger(0).config().clone()
        };
        let ledger = SpaceLedger::new(
            config,
            Arc::new(FixedProbe {
                used: 9_999,
                fail: AtomicBool::new(false),
            }),
        );
        assert!(ledger.reserve(work(), 5_000).is_some());
    }

    // -- guard --------------------------------------------------------------

    #[test]
    fn guard_releases_on_drop() {
        let ledger = ledger(0);
        {
            let _g = ReservationGuard::acquire(&ledger, work(), 300).unwrap();
            assert_eq!(ledger.reserved_on(work()), 300);
        }
        assert_eq!(ledger.reserved_on(work()), 0);
    }

    #[test]
    fn guard_grows_and_shrinks() {
        let ledger = ledger(0);
        let mut g = ReservationGuard::acquire(&ledger, work(), 300).unwrap();
        assert!(g.grow(200));
        assert_eq!(g.bytes(), 500);
        assert!(!g.grow(500));
        assert_eq!(ledger.reserved_on(work()), 500);

        g.shrink_to(120);
        assert_eq!(ledger.reserved_on(work()), 120);
        g.release();
        assert_eq!(ledger.reserved_on(work()), 0);
    }

    // -- waiting ------------------------------------------------------------

    #[tokio::test]
    async fn wait_for_space_returns_once_space_frees_up() {
        let ledger = ledger(0);
        let blocker = ledger.reserve(work(), 800).unwrap();
        let cancel = CancellationToken::new();

        let l2 = Arc::clone(&ledger);
        let releaser = tokio::spawn(async move {
            let mut blocker = blocker;
            tokio::time::sleep(Duration::from_millis(30)).await;
            l2.release_reservation(&mut blocker);
        });

        let (ok, info) = ledger
            .wait_for_space(
                500,
                work(),
                Duration::from_secs(5),
                Duration::from_millis(5),
                &cancel,
            )
            .await;
        releaser.await.unwrap();
        assert!(ok);
        assert!(info.is_some());
    }

    #[tokio::test]
    async fn wait_for_space_times_out_without_error() {
        let ledger = ledger(950);
        let cancel = CancellationToken::new();
        let (ok, info) = ledger
            .wait_for_space(
                500,
                work(),
                Duration::from_millis(20),
                Duration::from_millis(5),
                &cancel,
            )
            .await;
        assert!(!ok);
        assert_eq!(info.map(|i| i.used_bytes), Some(950));
    }

    #[test]
    fn report_covers_monitored_paths() {
        let ledger = ledger(100);
        let _r = ledger.reserve(work(), 50).unwrap();
        let report = ledger.report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].reserved_bytes, 50);
        assert_eq!(report[0].threshold_bytes, 1_000);
        assert_eq!(report[0].status, SpaceStatus::Sufficient);
    }
}
