use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as SyncMutex, MutexGuard,
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    commander::CommanderLocator,
    download::{BulkSource, SOURCE_FILE_NAME},
    error::{CacheError, Result},
    freshness::{self, FreshnessTracker},
    models::{AlliedSystemReport, CacheStatus, CatalogEntry, FreshnessPhase, RefreshOutcome},
    refresh::Refresher,
    store::SystemStore,
};

const DATABASE_FILE_NAME: &str = "systems.db";
const FRESHNESS_FILE_NAME: &str = "freshness.json";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub data_dir: PathBuf,
    pub refresh_interval_hours: u32,
    pub max_corruption_retries: u32,
    pub ingest_batch_size: usize,
    pub read_pool_size: usize,
}

impl CacheConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE_NAME)
    }

    pub fn source_path(&self) -> PathBuf {
        self.data_dir.join(SOURCE_FILE_NAME)
    }

    pub fn freshness_path(&self) -> PathBuf {
        self.data_dir.join(FRESHNESS_FILE_NAME)
    }
}

/// The tracker mutex also serializes refreshes: a caller arriving while a
/// refresh runs waits for it and then finds the tracker fresh.
pub struct SystemCache<S> {
    store: Arc<SystemStore>,
    refresher: Refresher<S, SystemStore>,
    freshness: Mutex<FreshnessTracker>,
    refreshing: AtomicBool,
    last_refresh_at: SyncMutex<Option<DateTime<Utc>>>,
    source_path: PathBuf,
    refresh_interval_hours: u32,
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S: BulkSource> SystemCache<S> {
    pub async fn open(config: CacheConfig, source: S) -> Result<Self> {
        let database_path = config.database_path();
        let read_pool_size = config.read_pool_size;
        let store = tokio::task::spawn_blocking(move || {
            SystemStore::open(&database_path, read_pool_size)
        })
        .await
        .map_err(|err| CacheError::StorageUnavailable {
            path: config.database_path(),
            message: format!("open task join error: {err}"),
        })??;
        let store = Arc::new(store);
        debug!(database = %store.path().display(), "Systems store ready");

        let tracker = FreshnessTracker::load(
            &config.freshness_path(),
            &config.source_path(),
            config.refresh_interval_hours,
        );
        let refresher = Refresher::new(
            source,
            Arc::clone(&store),
            config.source_path(),
            config.ingest_batch_size,
            config.max_corruption_retries,
        );

        Ok(Self {
            store,
            refresher,
            last_refresh_at: SyncMutex::new(tracker.last_refresh_at()),
            freshness: Mutex::new(tracker),
            refreshing: AtomicBool::new(false),
            source_path: config.source_path(),
            refresh_interval_hours: config.refresh_interval_hours.max(1),
        })
    }

    pub async fn ensure_fresh(&self, force: bool) -> Result<RefreshOutcome> {
        let mut tracker = self.freshness.lock().await;
        if !force && !tracker.is_expired(Utc::now()) {
            return Ok(RefreshOutcome::Skipped);
        }

        let _in_flight = InFlight::start(&self.refreshing);
        let outcome = self.refresher.ensure_fresh(&mut tracker, force).await;
        *self.lock_last_refresh() = tracker.last_refresh_at();
        outcome
    }

    pub async fn status(&self) -> Result<CacheStatus> {
        let system_count = Some(self.with_store(|store| store.count()).await?);
        let last_refresh_at = *self.lock_last_refresh();
        let state = if self.refreshing.load(Ordering::SeqCst) {
            FreshnessPhase::RefreshInProgress
        } else if freshness::is_due(
            last_refresh_at,
            &self.source_path,
            self.refresh_interval_hours,
            Utc::now(),
        ) {
            FreshnessPhase::Stale
        } else {
            FreshnessPhase::Fresh
        };
        Ok(CacheStatus {
            state,
            last_refresh_at,
            refresh_interval_hours: self.refresh_interval_hours,
            system_count,
        })
    }

    pub async fn system_by_id(&self, id: i64) -> Result<Option<CatalogEntry>> {
        self.with_store(move |store| store.get_by_id(id)).await
    }

    pub async fn system_by_name(&self, name: &str) -> Result<Option<CatalogEntry>> {
        let name = name.to_string();
        self.with_store(move |store| store.get_by_name(&name)).await
    }

    pub async fn nearest_controlled(
        &self,
        reference_id: i64,
        power: &str,
    ) -> Result<Option<CatalogEntry>> {
        let power = power.to_string();
        self.with_store(move |store| store.nearest_controlled(reference_id, &power))
            .await
    }

    pub async fn nearest_allied_system<L: CommanderLocator>(
        &self,
        locator: &L,
    ) -> Result<AlliedSystemReport> {
        let system_name = locator.current_system().await;
        let power = locator
            .current_power()
            .await
            .filter(|power| !power.trim().is_empty());

        if let Err(err) = self.ensure_fresh(false).await {
            warn!("Refresh before allied system lookup failed, using cached data: {err}");
        }

        let mut report = AlliedSystemReport {
            power: power.clone(),
            ..AlliedSystemReport::default()
        };

        let Some(system_name) = system_name else {
            debug!("Commander position unknown");
            return Ok(report);
        };
        let Some(current) = self.system_by_name(&system_name).await? else {
            debug!(system = %system_name, "Current system not in populated catalog");
            return Ok(report);
        };

        if let Some(power) = power.as_deref() {
            let nearest = self.nearest_controlled(current.id, power).await?;
            report.distance = nearest.as_ref().map(|n| current.distance_to(n));
            report.nearest = nearest;
        }
        report.current_system = Some(current);
        Ok(report)
    }

    fn lock_last_refresh(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_refresh_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn with_store<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SystemStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || query(store.as_ref()))
            .await
            .map_err(|err| CacheError::StorageRead {
                message: format!("query task join error: {err}"),
            })?
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, time::Duration};

    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::*;
    use crate::refresh::tests::{StaticSource, DUMP};

    // Holds every download until released.
    #[derive(Default)]
    struct GatedSource {
        release: Arc<Notify>,
    }

    impl BulkSource for GatedSource {
        async fn fetch(&self, dest: &Path) -> Result<u64> {
            self.release.notified().await;
            fs::write(dest, DUMP).expect("write fixture");
            Ok(DUMP.len() as u64)
        }
    }

    struct FixedLocator {
        system: Option<&'static str>,
        power: Option<&'static str>,
    }

    impl CommanderLocator for FixedLocator {
        async fn current_system(&self) -> Option<String> {
            self.system.map(str::to_string)
        }

        async fn current_power(&self) -> Option<String> {
            self.power.map(str::to_string)
        }
    }

    fn config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            data_dir: dir.path().to_path_buf(),
            refresh_interval_hours: 24,
            max_corruption_retries: 1,
            ingest_batch_size: 2,
            read_pool_size: 2,
        }
    }

    async fn open<S: BulkSource>(dir: &TempDir, source: S) -> Arc<SystemCache<S>> {
        Arc::new(SystemCache::open(config(dir), source).await.expect("open cache"))
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_download() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, StaticSource::serving(DUMP)).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.ensure_fresh(false).await })
            })
            .collect();
        let mut refreshed = 0;
        for handle in handles {
            if let RefreshOutcome::Refreshed { .. } = handle.await.expect("join").expect("refresh") {
                refreshed += 1;
            }
        }

        assert_eq!(refreshed, 1);
        assert_eq!(cache.refresher_fetches(), 1);
        assert_eq!(cache.system_by_id(3).await.expect("get").map(|s| s.name), Some("C".into()));
    }

    #[tokio::test]
    async fn allied_system_is_nearest_controlled_from_current_position() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, StaticSource::serving(DUMP)).await;
        let locator = FixedLocator {
            system: Some("A"),
            power: Some("Alpha"),
        };

        let report = cache.nearest_allied_system(&locator).await.expect("query");
        assert_eq!(report.current_system.map(|s| s.id), Some(1));
        assert_eq!(report.nearest.map(|s| s.name), Some("B".into()));
        assert_eq!(report.distance, Some(1.0));
    }

    #[tokio::test]
    async fn unpledged_commander_gets_empty_result() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, StaticSource::serving(DUMP)).await;

        for power in [None, Some(""), Some("  ")] {
            let locator = FixedLocator {
                system: Some("A"),
                power,
            };
            let report = cache.nearest_allied_system(&locator).await.expect("query");
            assert!(report.nearest.is_none());
            assert!(report.power.is_none());
        }
    }

    #[tokio::test]
    async fn outage_keeps_serving_cached_rows() {
        let dir = TempDir::new().expect("tempdir");
        {
            let cache = open(&dir, StaticSource::serving(DUMP)).await;
            cache.ensure_fresh(false).await.expect("initial refresh");
        }

        let cache = open(&dir, StaticSource::offline()).await;
        let err = cache.ensure_fresh(true).await.expect_err("offline");
        assert!(matches!(err, CacheError::RefreshFailed { .. }));

        let locator = FixedLocator {
            system: Some("A"),
            power: Some("Beta"),
        };
        let report = cache.nearest_allied_system(&locator).await.expect("query");
        assert_eq!(report.nearest.map(|s| s.name), Some("D".into()));
    }

    #[tokio::test]
    async fn status_reports_fresh_after_refresh() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, StaticSource::serving(DUMP)).await;

        let before = cache.status().await.expect("status");
        assert_eq!(before.state, FreshnessPhase::Stale);
        assert_eq!(before.system_count, Some(0));

        cache.ensure_fresh(false).await.expect("refresh");
        let after = cache.status().await.expect("status");
        assert_eq!(after.state, FreshnessPhase::Fresh);
        assert_eq!(after.system_count, Some(4));
        assert!(after.last_refresh_at.is_some());
    }

    #[tokio::test]
    async fn status_ignores_a_held_tracker_lock_when_nothing_refreshes() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, StaticSource::serving(DUMP)).await;
        cache.ensure_fresh(false).await.expect("refresh");

        let _held = cache.freshness.lock().await;
        let status = cache.status().await.expect("status");
        assert_eq!(status.state, FreshnessPhase::Fresh);
        assert!(status.last_refresh_at.is_some());
    }

    #[tokio::test]
    async fn status_reports_refresh_in_progress_while_downloading() {
        let dir = TempDir::new().expect("tempdir");
        let source = GatedSource::default();
        let release = Arc::clone(&source.release);
        let cache = open(&dir, source).await;

        let running = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.ensure_fresh(false).await })
        };
        let mut in_progress = false;
        for _ in 0..200 {
            if cache.status().await.expect("status").state == FreshnessPhase::RefreshInProgress {
                in_progress = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(in_progress);

        release.notify_one();
        running.await.expect("join").expect("refresh");
        let status = cache.status().await.expect("status");
        assert_eq!(status.state, FreshnessPhase::Fresh);
        assert!(status.last_refresh_at.is_some());
    }

    impl SystemCache<StaticSource> {
        fn refresher_fetches(&self) -> u32 {
            self.refresher.source().fetches.load(Ordering::SeqCst)
        }
    }
}
