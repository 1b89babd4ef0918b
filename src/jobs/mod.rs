use crate::{
    config::MaintenanceConfig,
    error::RelayResult,
    identity::CachingDidResolver,
    rate_limit::RepoRateLimiter,
    sequencer::EventManager,
};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

pub mod tasks;

pub use tasks::{CompactionRun, Compactor};

/// Intervals for the periodic jobs
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Zero disables scheduled compaction
    pub compact_interval: Duration,
    pub event_trim_interval: Duration,
    pub cache_upkeep_interval: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            compact_interval: Duration::from_secs(4 * 3600),
            event_trim_interval: Duration::from_secs(600),
            cache_upkeep_interval: Duration::from_secs(1800),
        }
    }
}

impl From<&MaintenanceConfig> for JobSchedulerConfig {
    fn from(config: &MaintenanceConfig) -> Self {
        Self {
            compact_interval: config.compact_interval,
            event_trim_interval: config.event_trim_interval,
            ..Default::default()
        }
    }
}

/// Job scheduler for background tasks
pub struct JobScheduler {
    config: JobSchedulerConfig,
    compactor: Arc<Compactor>,
    events: Arc<EventManager>,
    identities: Arc<CachingDidResolver>,
    rate_limiter: RepoRateLimiter,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobScheduler {
    pub fn new(
        config: JobSchedulerConfig,
        compactor: Arc<Compactor>,
        events: Arc<EventManager>,
        identities: Arc<CachingDidResolver>,
        rate_limiter: RepoRateLimiter,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            compactor,
            events,
            identities,
            rate_limiter,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Start all background jobs
    pub fn start(self: &Arc<Self>) {
        info!("Starting background job scheduler");

        if self.config.compact_interval.is_zero() {
            info!("Scheduled compaction disabled");
        } else {
            let this = Arc::clone(self);
            self.spawn_every(self.config.compact_interval, move || {
                let this = Arc::clone(&this);
                async move { this.compaction_job().await }
            });
        }

        if self.events.retention().is_some() {
            let this = Arc::clone(self);
            self.spawn_every(self.config.event_trim_interval, move || {
                let this = Arc::clone(&this);
                async move { this.event_trim_job().await }
            });
        }

        let this = Arc::clone(self);
        self.spawn_every(self.config.cache_upkeep_interval, move || {
            let this = Arc::clone(&this);
            async move { this.cache_upkeep_job() }
        });

        info!("Background jobs started");
    }

    /// Run `job` every `period`, first after one full period
    fn spawn_every<F, Fut>(&self, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = job() => {}
                }
            }
        });
    }

    /// Compact superseded repository data (runs every compact-interval)
    async fn compaction_job(&self) {
        info!("Running scheduled compaction");
        match self.compactor.run().await {
            Ok(CompactionRun::Completed(_)) => {}
            Ok(CompactionRun::AlreadyRunning) => {
                info!("Skipping scheduled compaction: a run is already in progress");
            }
            Err(e) => error!("Compaction failed: {}", e),
        }
    }

    /// Apply event log retention (runs every event-trim-interval)
    async fn event_trim_job(&self) {
        match tasks::trim_event_log(&self.events).await {
            Ok(Some(stats)) if stats.events_removed > 0 => {
                info!(
                    "Trimmed {} events, replay now starts after {}",
                    stats.events_removed, stats.trimmed_through
                );
            }
            Ok(_) => {}
            Err(e) => error!("Event log trim failed: {}", e),
        }
    }

    /// Drop expired cache entries (runs every 30 minutes)
    fn cache_upkeep_job(&self) {
        let purged = tasks::cache_upkeep(&self.identities, &self.rate_limiter);
        if purged > 0 {
            info!("Purged {} expired identity cache entries", purged);
        }
    }

    /// Cancel the timers and wait for a running job to stop
    pub async fn shutdown(&self) -> RelayResult<()> {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Background jobs stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DidDocument, DidResolver, IdentityCacheConfig, IdentityError};
    use crate::repo::{
        AppliedRepo, CompactionStats, FetchedRepo, RepoHead, RepoStore, RepoStoreError, StagedHead,
    };
    use crate::sequencer::{DiskPersistOptions, DiskPersistence, EventManagerConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoResolver;

    #[async_trait]
    impl DidResolver for NoResolver {
        async fn resolve_did(&self, did: &str) -> Result<DidDocument, IdentityError> {
            Err(IdentityError::NotFound(did.to_string()))
        }
    }

    #[derive(Default)]
    struct CountingStore {
        compactions: AtomicUsize,
    }

    #[async_trait]
    impl RepoStore for CountingStore {
        async fn stage(&self, _repo: FetchedRepo) -> Result<AppliedRepo, RepoStoreError> {
            Ok(AppliedRepo::default())
        }

        async fn advance(&self, _head: &StagedHead) -> Result<bool, RepoStoreError> {
            Ok(false)
        }

        async fn head(&self, _did: &str) -> Result<Option<RepoHead>, RepoStoreError> {
            Ok(None)
        }

        async fn take_down(&self, _did: &str) -> Result<(), RepoStoreError> {
            Ok(())
        }

        async fn reverse_take_down(&self, _did: &str) -> Result<(), RepoStoreError> {
            Ok(())
        }

        async fn is_taken_down(&self, _did: &str) -> Result<bool, RepoStoreError> {
            Ok(false)
        }

        async fn compact(&self) -> Result<CompactionStats, RepoStoreError> {
            self.compactions.fetch_add(1, Ordering::SeqCst);
            Ok(CompactionStats::default())
        }
    }

    async fn scheduler(compact_interval: Duration) -> (Arc<JobScheduler>, Arc<CountingStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let persister = DiskPersistence::open(dir.path(), DiskPersistOptions::default())
            .await
            .unwrap();
        let events = Arc::new(EventManager::new(Arc::new(persister), EventManagerConfig::default()));
        let store = Arc::new(CountingStore::default());
        let identities = Arc::new(CachingDidResolver::new(
            Arc::new(NoResolver),
            IdentityCacheConfig::default(),
        ));

        let scheduler = JobScheduler::new(
            JobSchedulerConfig {
                compact_interval,
                ..Default::default()
            },
            Arc::new(Compactor::new(store.clone())),
            events,
            identities,
            RepoRateLimiter::unlimited(),
        );
        (scheduler, store, dir)
    }

    #[tokio::test]
    async fn test_scheduler_runs_compaction_until_shutdown() {
        let (scheduler, store, _dir) = scheduler(Duration::from_millis(20)).await;
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await.unwrap();

        let runs = store.compactions.load(Ordering::SeqCst);
        assert!(runs >= 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.compactions.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_zero_interval_disables_compaction() {
        let (scheduler, store, _dir) = scheduler(Duration::ZERO).await;
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await.unwrap();
        assert_eq!(store.compactions.load(Ordering::SeqCst), 0);
    }
}
