use crate::clock::Clock;
use crate::security::RateLimiter;
use crate::transcode::TranscodeCache;
use futures::future::{BoxFuture, FutureExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Reads the resident memory of this process in bytes
pub type MemoryProbe = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// Deletes one processed artifact
pub type ArtifactRemover =
    Arc<dyn Fn(PathBuf) -> BoxFuture<'static, std::io::Result<()>> + Send + Sync>;

fn remove_from_disk() -> ArtifactRemover {
    Arc::new(|path: PathBuf| tokio::fs::remove_file(path).boxed())
}

/// Resident set size of the current process
pub fn resident_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory())
}

/// Result of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
    pub bytes_freed: u64,
    pub resident_bytes: Option<u64>,
    pub cache_entries_cleared: usize,
    pub clients_pruned: usize,
}

/// Periodic cleanup of processed video artifacts and in-memory state
pub struct CleanupSweeper {
    dir: PathBuf,
    retention: Duration,
    memory_high_water_bytes: u64,
    clock: Arc<dyn Clock>,
    memory_probe: MemoryProbe,
    remover: ArtifactRemover,
    cache: Option<Arc<TranscodeCache>>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl CleanupSweeper {
    pub fn new(
        dir: impl Into<PathBuf>,
        retention: Duration,
        memory_high_water_mb: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dir: dir.into(),
            retention,
            memory_high_water_bytes: memory_high_water_mb * 1024 * 1024,
            clock,
            memory_probe: Arc::new(resident_memory_bytes),
            remover: remove_from_disk(),
            cache: None,
            rate_limiter: None,
        }
    }

    /// Clear this cache when memory crosses the high-water mark
    pub fn with_cache(mut self, cache: Arc<TranscodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Prune idle clients from this limiter on every sweep
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_memory_probe(mut self, probe: MemoryProbe) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn with_remover(mut self, remover: ArtifactRemover) -> Self {
        self.remover = remover;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run one sweep; individual failures are logged and skipped
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.remove_expired(&mut report).await;

        report.resident_bytes = (self.memory_probe)();
        if let (Some(resident), Some(cache)) = (report.resident_bytes, &self.cache) {
            if resident > self.memory_high_water_bytes {
                report.cache_entries_cleared = cache.clear();
                warn!(
                    resident_mb = resident / 1024 / 1024,
                    high_water_mb = self.memory_high_water_bytes / 1024 / 1024,
                    cleared = report.cache_entries_cleared,
                    "High memory usage, cleared transcode cache"
                );
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            report.clients_pruned = limiter.prune();
        }

        metrics::counter!("sweeper_files_deleted_total").increment(report.deleted as u64);

        info!(
            deleted = report.deleted,
            failed = report.failed,
            bytes_freed = report.bytes_freed,
            resident_mb = report.resident_bytes.map(|b| b / 1024 / 1024),
            clients_pruned = report.clients_pruned,
            "Sweep complete"
        );

        report
    }

    async fn remove_expired(&self, report: &mut SweepReport) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Processed directory does not exist yet");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to list processed directory");
                report.failed += 1;
                return;
            }
        };

        let now = self.clock.now();

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read directory entry");
                    report.failed += 1;
                    break;
                }
            };
            let path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat artifact");
                    report.failed += 1;
                    continue;
                }
            };

            let expired = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.retention);

            if !expired {
                continue;
            }

            match (self.remover)(path.clone()).await {
                Ok(()) => {
                    report.deleted += 1;
                    report.bytes_freed += metadata.len();
                    info!(path = %path.display(), "Removed expired processed video");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove artifact");
                    report.failed += 1;
                }
            }
        }
    }

    /// Sweep immediately, then every `interval` until cancelled
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Cleanup sweeper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cleanup sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transcode::{ImageEncoder, ImageOptions, TranscodeError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn artifact(dir: &Path, name: &str, modified: SystemTime) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"processed").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        path
    }

    fn sweeper(dir: &Path, clock: Arc<ManualClock>) -> CleanupSweeper {
        CleanupSweeper::new(dir, 2 * HOUR, 400, clock).with_memory_probe(Arc::new(|| Some(1024)))
    }

    #[tokio::test]
    async fn test_only_expired_artifacts_removed() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let clock = Arc::new(ManualClock::new(now));

        let old = artifact(dir.path(), "a_processed_1.mp4", now - 3 * HOUR);
        let older = artifact(dir.path(), "b_processed_2.mp4", now - 30 * HOUR);
        let fresh = artifact(dir.path(), "c_processed_3.mp4", now - HOUR);

        let report = sweeper(dir.path(), clock).sweep_once().await;

        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes_freed, 2 * b"processed".len() as u64);
        assert!(!old.exists());
        assert!(!older.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_failed_removal_does_not_stop_sweep() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let clock = Arc::new(ManualClock::new(now));

        let stuck = artifact(dir.path(), "a_processed_1.mp4", now - 3 * HOUR);
        let others = [
            artifact(dir.path(), "b_processed_2.mp4", now - 3 * HOUR),
            artifact(dir.path(), "c_processed_3.mp4", now - 4 * HOUR),
        ];

        let remover: ArtifactRemover = Arc::new(|path: PathBuf| {
            async move {
                if path.ends_with("a_processed_1.mp4") {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "busy",
                    ));
                }
                tokio::fs::remove_file(path).await
            }
            .boxed()
        });

        let report = sweeper(dir.path(), clock)
            .with_remover(remover)
            .sweep_once()
            .await;

        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, 1);
        assert!(stuck.exists());
        assert!(others.iter().all(|path| !path.exists()));
    }

    #[tokio::test]
    async fn test_subdirectories_are_left_alone() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let clock = Arc::new(ManualClock::new(SystemTime::now() + 100 * HOUR));

        let report = sweeper(dir.path(), clock).sweep_once().await;

        assert_eq!(report.deleted, 0);
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());

        let report = sweeper(&dir.path().join("absent"), clock).sweep_once().await;
        assert_eq!(report, SweepReport {
            resident_bytes: Some(1024),
            ..SweepReport::default()
        });
    }

    struct Fixed;

    #[async_trait]
    impl ImageEncoder for Fixed {
        async fn encode(&self, _: &Path, _: &ImageOptions) -> Result<Bytes, TranscodeError> {
            Ok(Bytes::from_static(b"webp"))
        }
    }

    #[tokio::test]
    async fn test_memory_pressure_clears_cache() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("cat.png");
        std::fs::write(&source, b"png").unwrap();

        let cache = Arc::new(TranscodeCache::new(
            Arc::new(Fixed),
            10,
            4096,
            Duration::from_secs(5),
        ));
        cache.transform(&source, ImageOptions::default()).await.unwrap();

        let calm = CleanupSweeper::new(dir.path(), 2 * HOUR, 400, Arc::new(ManualClock::default()))
            .with_cache(cache.clone())
            .with_memory_probe(Arc::new(|| Some(100 * 1024 * 1024)));
        assert_eq!(calm.sweep_once().await.cache_entries_cleared, 0);
        assert_eq!(cache.len(), 1);

        let pressured =
            CleanupSweeper::new(dir.path(), 2 * HOUR, 400, Arc::new(ManualClock::default()))
                .with_cache(cache.clone())
                .with_memory_probe(Arc::new(|| Some(512 * 1024 * 1024)));
        assert_eq!(pressured.sweep_once().await.cache_entries_cleared, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_prunes_rate_limiter() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), 5, clock.clone()));
        limiter.check("10.0.0.1");
        clock.advance(Duration::from_secs(120));

        let report = sweeper(dir.path(), clock)
            .with_rate_limiter(limiter.clone())
            .sweep_once()
            .await;

        assert_eq!(report.clients_pruned, 1);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let stale = artifact(dir.path(), "x_processed_1.mp4", now - 3 * HOUR);

        let sweeper = Arc::new(sweeper(dir.path(), Arc::new(ManualClock::new(now))));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(Duration::from_secs(3600), cancel.clone()));

        // The first tick fires immediately
        for _ in 0..50 {
            if !stale.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!stale.exists());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }

    #[test]
    fn test_resident_memory_is_reported() {
        assert!(resident_memory_bytes().is_some_and(|bytes| bytes > 0));
    }
}
