/// Background task implementations
use crate::{
    error::RelayResult,
    identity::CachingDidResolver,
    metrics,
    rate_limit::RepoRateLimiter,
    repo::{CompactionStats, RepoStore},
    sequencer::{EventManager, TrimStats},
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of asking for a compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionRun {
    Completed(CompactionStats),
    /// Another run was in progress; nothing was done
    AlreadyRunning,
}

/// Repository compaction, shared by the timer and the admin endpoint
///
/// At most one run is active at a time. A request that arrives during a run
/// returns immediately instead of queueing a second pass.
pub struct Compactor {
    repos: Arc<dyn RepoStore>,
    running: Mutex<()>,
}

impl Compactor {
    pub fn new(repos: Arc<dyn RepoStore>) -> Self {
        Self {
            repos,
            running: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    pub async fn run(&self) -> RelayResult<CompactionRun> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Compaction already in progress");
            return Ok(CompactionRun::AlreadyRunning);
        };

        let started = Instant::now();
        let result = self.repos.compact().await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(stats) => {
                metrics::record_background_job("compaction", "success", elapsed);
                info!(
                    "Compacted {} repos, removed {} snapshots in {:.2}s",
                    stats.repos_compacted, stats.snapshots_removed, elapsed
                );
                Ok(CompactionRun::Completed(stats))
            }
            Err(e) => {
                metrics::record_background_job("compaction", "error", elapsed);
                Err(e.into())
            }
        }
    }
}

/// Apply the event log's retention window
pub async fn trim_event_log(events: &EventManager) -> RelayResult<Option<TrimStats>> {
    let started = Instant::now();
    let result = events.trim().await;
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_background_job("event_trim", status, started.elapsed().as_secs_f64());
    result
}

/// Drop expired identity entries and idle per-repository limiter state
pub fn cache_upkeep(identities: &CachingDidResolver, rate_limiter: &RepoRateLimiter) -> usize {
    let started = Instant::now();
    let purged = identities.purge_expired();
    rate_limiter.retain_recent();
    metrics::record_background_job("cache_upkeep", "success", started.elapsed().as_secs_f64());
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{AppliedRepo, FetchedRepo, RepoHead, RepoStoreError, StagedHead};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Store whose compaction blocks until the gate opens
    struct SlowStore {
        gate: Semaphore,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl RepoStore for SlowStore {
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
            self.runs.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| RepoStoreError::Storage(e.to_string()))?;
            Ok(CompactionStats {
                repos_compacted: 1,
                snapshots_removed: 2,
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_compaction_runs_once() {
        let store = Arc::new(SlowStore {
            gate: Semaphore::new(0),
            runs: AtomicUsize::new(0),
        });
        let compactor = Arc::new(Compactor::new(store.clone()));

        let first = {
            let compactor = Arc::clone(&compactor);
            tokio::spawn(async move { compactor.run().await })
        };
        while store.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(compactor.is_running());

        let second = compactor.run().await.unwrap();
        assert_eq!(second, CompactionRun::AlreadyRunning);

        store.gate.add_permits(1);
        let first = first.await.unwrap().unwrap();
        assert_eq!(
            first,
            CompactionRun::Completed(CompactionStats {
                repos_compacted: 1,
                snapshots_removed: 2,
            })
        );
        assert_eq!(store.runs.load(Ordering::SeqCst), 1);
        assert!(!compactor.is_running());
    }
}
