//! Cleanup Scheduler
//!
//! Background task that reclaims sandboxes whose cleanup deadline has passed.
//!
//! ```text
//!            ┌──────────── startup ────────────┐
//!            │ reclaim_on_startup()            │  leases + orphaned dirs on disk
//!            └────────────────┬────────────────┘
//!                             ▼
//!   ┌──► tick (sweep_interval) ──► registry.sweep(now) ──► cleanup(each) ──┐
//!   └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failure on one session is logged and the sweep moves on; the registry
//! requeues the failed session with a retry deadline.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::sandbox::{
    CleanupOutcome, Lease, SandboxRegistry, SandboxState, LEASE_SUFFIX, SANDBOX_PREFIX,
};

// ============================================================================
// Configuration
// ============================================================================

/// Scheduler parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Period between sweeps
    pub sweep_interval: Duration,
    /// Age after which an unleased sandbox directory counts as orphaned
    pub orphan_grace: Duration,
    /// How long cleaned sessions stay visible in the registry
    pub cleaned_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            orphan_grace: Duration::from_secs(3600),
            cleaned_retention: Duration::from_secs(600),
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one periodic sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions removed by this sweep
    pub cleaned: usize,
    /// Sessions whose removal failed (requeued)
    pub failed: usize,
    /// Sessions skipped because another task was cleaning them
    pub in_progress: usize,
    /// Cleaned sessions dropped from the registry
    pub pruned: usize,
}

/// Outcome of the startup reclaim scan
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Expired leases whose sandbox was removed
    pub leases_reclaimed: usize,
    /// Leases whose deadline has not passed yet
    pub leases_pending: usize,
    /// Unleased sandbox directories removed
    pub orphans_removed: usize,
    /// Entries that could not be handled
    pub failed: usize,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Periodic sandbox reclamation
#[derive(Clone, Debug)]
pub struct CleanupScheduler {
    registry: SandboxRegistry,
    config: SchedulerConfig,
}

impl CleanupScheduler {
    /// Scheduler over `registry`
    #[must_use]
    pub fn new(registry: SandboxRegistry, config: SchedulerConfig) -> Self {
        Self { registry, config }
    }

    /// Scheduler parameters
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Registry being swept
    #[must_use]
    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    /// Clean every session due at `now`
    pub async fn sweep_once(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for session in self.registry.sweep(now) {
            match self.registry.cleanup(&session.id).await {
                Ok(CleanupOutcome::Cleaned) => report.cleaned += 1,
                Ok(CleanupOutcome::AlreadyClean) => {}
                Ok(CleanupOutcome::InProgress) => report.in_progress += 1,
                Err(e) => {
                    tracing::warn!(
                        sandbox_id = %session.id,
                        error = %e,
                        "Sweep could not clean sandbox"
                    );
                    report.failed += 1;
                }
            }
        }
        report.pruned = self.registry.prune_cleaned(self.config.cleaned_retention);

        if report.cleaned + report.failed > 0 {
            tracing::info!(
                cleaned = report.cleaned,
                failed = report.failed,
                pruned = report.pruned,
                "Sandbox sweep finished"
            );
        }
        report
    }

    /// Reclaim sandboxes left on disk by a previous process
    ///
    /// Expired leases are cleaned (directory, provider artifact, lease).
    /// Sandbox directories without a lease are removed once older than
    /// `orphan_grace`. Paths owned by the live registry are never touched.
    pub async fn reclaim_on_startup(&self) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        let root = self.registry.root().to_path_buf();

        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(root = %root.display(), "Sandbox root absent, nothing to reclaim");
                return report;
            }
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Cannot scan sandbox root");
                report.failed += 1;
                return report;
            }
        };

        let mut leases = Vec::new();
        let mut dirs = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name.starts_with(SANDBOX_PREFIX) {
                        continue;
                    }
                    if name.ends_with(LEASE_SUFFIX) {
                        leases.push(entry.path());
                    } else if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                        dirs.push(entry.path());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Sandbox root scan interrupted");
                    report.failed += 1;
                    break;
                }
            }
        }

        for lease_path in leases {
            self.reclaim_lease(&lease_path, &mut report).await;
        }
        for dir in dirs {
            self.reclaim_orphan(&dir, &mut report).await;
        }

        tracing::info!(
            root = %root.display(),
            leases_reclaimed = report.leases_reclaimed,
            leases_pending = report.leases_pending,
            orphans_removed = report.orphans_removed,
            failed = report.failed,
            "Startup reclaim finished"
        );
        report
    }

    async fn reclaim_lease(&self, lease_path: &Path, report: &mut ReclaimReport) {
        let lease = match Lease::load(lease_path).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable lease");
                report.failed += 1;
                return;
            }
        };

        // a lease only ever names its sibling directory
        if Lease::path_for(&lease.sandbox_path).file_name() != lease_path.file_name() {
            tracing::warn!(
                lease = %lease_path.display(),
                sandbox = %lease.sandbox_path.display(),
                "Lease does not match its sandbox, skipping"
            );
            report.failed += 1;
            return;
        }
        if self.registry.owns_path(&lease.sandbox_path) {
            return;
        }
        if !lease.is_expired(Utc::now()) {
            report.leases_pending += 1;
            return;
        }

        match self
            .registry
            .remove_sandbox_files(&lease.sandbox_path, lease.provider_session_id.as_deref())
            .await
        {
            Ok(()) => {
                tracing::info!(sandbox = %lease.sandbox_path.display(), "Reclaimed leased sandbox");
                report.leases_reclaimed += 1;
            }
            Err(e) => {
                tracing::warn!(sandbox = %lease.sandbox_path.display(), error = %e, "Lease reclaim failed");
                report.failed += 1;
            }
        }
    }

    async fn reclaim_orphan(&self, dir: &Path, report: &mut ReclaimReport) {
        if self.registry.owns_path(dir) || self.registry.owns_path(&canonical(dir).await) {
            return;
        }
        // leased directories are handled by the lease pass
        if tokio::fs::try_exists(Lease::path_for(dir))
            .await
            .unwrap_or(true)
        {
            return;
        }

        let age = match tokio::fs::metadata(dir).await.and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "No mtime for sandbox directory");
                return;
            }
        };
        if age < self.config.orphan_grace {
            return;
        }

        match self.registry.remove_sandbox_files(dir, None).await {
            Ok(()) => {
                tracing::info!(
                    dir = %dir.display(),
                    age_secs = age.as_secs(),
                    "Removed orphaned sandbox"
                );
                report.orphans_removed += 1;
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Orphan removal failed");
                report.failed += 1;
            }
        }
    }

    /// Reclaim, then sweep every `sweep_interval` until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            root = %self.registry.root().display(),
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            "Starting cleanup scheduler"
        );

        self.reclaim_on_startup().await;

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_once(Instant::now()).await;
                }
            }
        }

        tracing::info!("Cleanup scheduler stopped");
    }

    /// Run the scheduler on its own task
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Wait until no session is pending, cleaning each as it comes due
    ///
    /// Returns early with the remaining count once `limit` has elapsed.
    pub async fn drain(&self, limit: Duration) -> usize {
        let give_up = Instant::now() + limit;
        loop {
            self.sweep_once(Instant::now()).await;
            let pending = self.registry.count(SandboxState::PendingCleanup);
            if pending == 0 {
                return 0;
            }
            let now = Instant::now();
            if now >= give_up {
                tracing::warn!(pending, "Gave up waiting for sandbox cleanup");
                return pending;
            }
            let wake = self
                .registry
                .next_deadline()
                .unwrap_or(now + self.config.sweep_interval)
                .clamp(now, give_up);
            tokio::time::sleep_until(wake).await;
        }
    }
}

async fn canonical(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::RegistryConfig;
    use pretty_assertions::assert_eq;

    fn scheduler(root: &Path) -> CleanupScheduler {
        CleanupScheduler::new(
            SandboxRegistry::new(RegistryConfig::default().with_root(root)),
            SchedulerConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_once_cleans_due_sessions() {
        let root = tempfile::tempdir().unwrap();
        let scheduler = scheduler(root.path());
        let registry = scheduler.registry().clone();
        let due = registry.allocate().await.unwrap();
        let later = registry.allocate().await.unwrap();
        registry
            .mark_pending_cleanup(&due.id, Duration::from_secs(1))
            .await
            .unwrap();
        registry
            .mark_pending_cleanup(&later.id, Duration::from_secs(120))
            .await
            .unwrap();

        let report = scheduler
            .sweep_once(Instant::now() + Duration::from_secs(1))
            .await;
        assert_eq!(report.cleaned, 1);
        assert!(!due.path.exists());
        assert!(later.path.exists());
        assert_eq!(registry.state(&due.id), Some(SandboxState::Cleaned));
        assert_eq!(
            registry.state(&later.id),
            Some(SandboxState::PendingCleanup)
        );
    }

    #[tokio::test]
    async fn test_sweep_continues_after_missing_path() {
        let root = tempfile::tempdir().unwrap();
        let scheduler = scheduler(root.path());
        let registry = scheduler.registry().clone();
        let gone = registry.allocate().await.unwrap();
        let present = registry.allocate().await.unwrap();
        tokio::fs::remove_dir_all(&gone.path).await.unwrap();
        registry.mark_abandoned(&gone.id);
        registry.mark_abandoned(&present.id);

        let report = scheduler.sweep_once(Instant::now()).await;
        assert_eq!(report.cleaned, 2);
        assert_eq!(report.failed, 0);
        assert!(!present.path.exists());
    }

    #[tokio::test]
    async fn test_reclaim_skips_live_sessions() {
        let root = tempfile::tempdir().unwrap();
        let scheduler = CleanupScheduler::new(
            SandboxRegistry::new(RegistryConfig::default().with_root(root.path())),
            SchedulerConfig {
                orphan_grace: Duration::ZERO,
                ..SchedulerConfig::default()
            },
        );
        let live = scheduler.registry().allocate().await.unwrap();

        let report = scheduler.reclaim_on_startup().await;
        assert_eq!(report, ReclaimReport::default());
        assert!(live.path.exists());
    }

    #[tokio::test]
    async fn test_reclaim_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let scheduler = scheduler(&root.path().join("never-created"));
        assert_eq!(scheduler.reclaim_on_startup().await, ReclaimReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let root = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let handle = scheduler(root.path()).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_pending() {
        let root = tempfile::tempdir().unwrap();
        let scheduler = scheduler(root.path());
        let registry = scheduler.registry().clone();
        let session = registry.allocate().await.unwrap();
        registry
            .mark_pending_cleanup(&session.id, Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(scheduler.drain(Duration::from_secs(5)).await, 0);
        assert!(!session.path.exists());
        assert!(!Lease::path_for(&session.path).exists());
    }
}
