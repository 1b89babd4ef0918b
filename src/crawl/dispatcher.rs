/// Crawl dispatcher - per-source queues, pumps and retries
use crate::{
    config::CrawlConfig,
    crawl::{CrawlError, CrawlProcessor, CrawlTask, Enqueued, SourceQueue},
    error::{RelayError, RelayResult},
    metrics,
    sources::{normalize_host, SourceRegistry},
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct CrawlDispatcherConfig {
    pub concurrency_per_source: usize,
    pub max_queue_per_source: usize,
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub retry_backoff: Duration,
    /// How long `stop` waits for running tasks before cancelling them
    pub drain_timeout: Duration,
}

impl Default for CrawlDispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency_per_source: 100,
            max_queue_per_source: 1000,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CrawlConfig> for CrawlDispatcherConfig {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            concurrency_per_source: config.concurrency_per_source,
            max_queue_per_source: config.max_queue_per_source,
            max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff,
            drain_timeout: config.drain_timeout,
        }
    }
}

/// Queue state of one source
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceCrawlState {
    pub host: String,
    pub queued: usize,
    pub in_flight: usize,
}

/// Snapshot of every source queue
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlState {
    pub accepting: bool,
    pub sources: Vec<SourceCrawlState>,
}

/// Backoff before retry number `attempts`, doubling from `base`
fn retry_delay(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(1u32 << attempts.saturating_sub(1).min(16))
}

struct SourceSlot {
    host: String,
    queue: Mutex<SourceQueue>,
    ready: Notify,
    permits: Arc<Semaphore>,
}

impl SourceSlot {
    fn publish_depth(&self, depth: usize) {
        metrics::set_queue_depth(&self.host, depth);
    }
}

/// Schedules crawl tasks per source
///
/// Each source gets a queue bounded by `max_queue_per_source` and a pump
/// that runs up to `concurrency_per_source` tasks at once. Transient
/// failures are retried with exponential backoff; invalid content flags the
/// source and is dropped.
pub struct CrawlDispatcher {
    config: CrawlDispatcherConfig,
    processor: Arc<dyn CrawlProcessor>,
    sources: Arc<SourceRegistry>,
    slots: RwLock<HashMap<String, Arc<SourceSlot>>>,
    started: AtomicBool,
    accepting: AtomicBool,
    intake: CancellationToken,
    hard_stop: CancellationToken,
    tracker: TaskTracker,
}

impl CrawlDispatcher {
    pub fn new(
        config: CrawlDispatcherConfig,
        processor: Arc<dyn CrawlProcessor>,
        sources: Arc<SourceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            processor,
            sources,
            slots: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            intake: CancellationToken::new(),
            hard_stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Start pumping every known queue; queues created later start on creation
    pub fn start(self: &Arc<Self>) {
        let slots = self.slots.write();
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in slots.values() {
            self.spawn_pump(Arc::clone(slot));
        }
        info!("Crawl dispatcher started");
    }

    fn spawn_pump(self: &Arc<Self>, slot: Arc<SourceSlot>) {
        let this = Arc::clone(self);
        self.tracker.spawn(async move { this.pump(slot).await });
    }

    fn slot(self: &Arc<Self>, host: &str) -> Arc<SourceSlot> {
        if let Some(slot) = self.slots.read().get(host) {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(host) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(SourceSlot {
            host: host.to_string(),
            queue: Mutex::new(SourceQueue::new(host, self.config.max_queue_per_source)),
            ready: Notify::new(),
            permits: Arc::new(Semaphore::new(self.config.concurrency_per_source)),
        });
        slots.insert(host.to_string(), Arc::clone(&slot));
        if self.started.load(Ordering::SeqCst) {
            self.spawn_pump(Arc::clone(&slot));
        }
        slot
    }

    /// Queue a crawl of `did` from `host`
    ///
    /// Fails fast with `Backpressure` when the source's queue is full and
    /// with `ShuttingDown` once `stop` has begun.
    pub fn announce(self: &Arc<Self>, host: &str, did: &str, rev: Option<String>) -> RelayResult<Enqueued> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }
        let host = normalize_host(host)?;
        let slot = self.slot(&host);

        let (result, depth) = {
            let mut queue = slot.queue.lock();
            // `stop` clears queues under this lock after refusing intake
            if !self.accepting.load(Ordering::SeqCst) {
                return Err(RelayError::ShuttingDown);
            }
            let result = queue.push(CrawlTask::new(host.as_str(), did, rev));
            (result, queue.depth())
        };
        slot.publish_depth(depth);

        match &result {
            Ok(enqueued) => {
                metrics::record_announcement(enqueued.as_str());
                if *enqueued == Enqueued::Queued {
                    slot.ready.notify_one();
                }
            }
            Err(_) => {
                metrics::record_announcement("backpressure");
                debug!("Crawl queue for {} is full, rejecting {}", host, did);
            }
        }
        result
    }

    async fn pump(self: Arc<Self>, slot: Arc<SourceSlot>) {
        debug!("Crawl pump for {} running", slot.host);
        loop {
            let permit = tokio::select! {
                _ = self.intake.cancelled() => break,
                permit = Arc::clone(&slot.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let task = loop {
                let (task, depth) = {
                    let mut queue = slot.queue.lock();
                    (queue.take(), queue.depth())
                };
                if let Some(task) = task {
                    slot.publish_depth(depth);
                    break Some(task);
                }
                tokio::select! {
                    _ = self.intake.cancelled() => break None,
                    _ = slot.ready.notified() => {}
                }
            };
            let Some(task) = task else { break };

            let this = Arc::clone(&self);
            let task_slot = Arc::clone(&slot);
            self.tracker
                .spawn(async move { this.run_task(task_slot, task, permit).await });
        }
        debug!("Crawl pump for {} stopped", slot.host);
    }

    async fn run_task(self: Arc<Self>, slot: Arc<SourceSlot>, mut task: CrawlTask, permit: OwnedSemaphorePermit) {
        let started = Instant::now();
        metrics::CRAWL_TASKS_ACTIVE.inc();

        let result = tokio::select! {
            _ = self.hard_stop.cancelled() => Err(CrawlError::Cancelled),
            result = self.processor.process(&task) => result,
        };

        metrics::CRAWL_TASKS_ACTIVE.dec();
        slot.queue.lock().complete(&task.did);
        drop(permit);
        slot.ready.notify_one();

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(outcome) => {
                metrics::record_crawl_task("success", elapsed);
                debug!(
                    "Crawled {} from {}: {} events",
                    task.did, task.host, outcome.sequenced
                );
                for target in outcome.discovered {
                    if let Err(e) = self.announce(&target.host, &target.did, None) {
                        debug!("Could not queue spidered repo {}: {}", target.did, e);
                    }
                }
            }
            Err(CrawlError::Transient(reason)) => {
                task.attempts += 1;
                if task.attempts >= self.config.max_attempts {
                    metrics::record_crawl_task("exhausted", elapsed);
                    warn!(
                        "Giving up on {} from {} after {} attempts: {}",
                        task.did, task.host, task.attempts, reason
                    );
                } else {
                    metrics::record_crawl_task("retry", elapsed);
                    debug!(
                        "Crawl of {} from {} failed (attempt {}): {}",
                        task.did, task.host, task.attempts, reason
                    );
                    self.schedule_retry(slot, task);
                }
            }
            Err(CrawlError::Invalid(reason)) => {
                metrics::record_crawl_task("invalid", elapsed);
                metrics::SOURCE_FLAGS_TOTAL.inc();
                if let Err(e) = self.sources.flag(&task.host, &reason).await {
                    warn!("Failed to flag source {}: {}", task.host, e);
                }
            }
            Err(CrawlError::Cancelled) => {
                metrics::record_crawl_task("cancelled", elapsed);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, slot: Arc<SourceSlot>, task: CrawlTask) {
        let delay = retry_delay(self.config.retry_backoff, task.attempts);
        let intake = self.intake.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = intake.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let (requeued, depth) = {
                        let mut queue = slot.queue.lock();
                        let did = task.did.clone();
                        let requeued = queue.requeue(task);
                        if !requeued {
                            debug!("Retry of {} superseded or queue full", did);
                        }
                        (requeued, queue.depth())
                    };
                    if requeued {
                        slot.publish_depth(depth);
                        slot.ready.notify_one();
                    }
                }
            }
        });
    }

    pub fn state(&self) -> CrawlState {
        let mut sources: Vec<SourceCrawlState> = self
            .slots
            .read()
            .values()
            .map(|slot| {
                let queue = slot.queue.lock();
                SourceCrawlState {
                    host: slot.host.clone(),
                    queued: queue.depth(),
                    in_flight: queue.in_flight(),
                }
            })
            .collect();
        sources.sort_by(|a, b| a.host.cmp(&b.host));
        CrawlState {
            accepting: self.accepting.load(Ordering::SeqCst),
            sources,
        }
    }

    pub fn queue_depth(&self, host: &str) -> usize {
        self.slots
            .read()
            .get(host)
            .map_or(0, |slot| slot.queue.lock().depth())
    }

    /// Stop intake, drain running tasks, cancel whatever outlives the timeout
    pub async fn stop(&self) -> RelayResult<()> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.intake.cancel();
        self.tracker.close();

        let dropped: usize = self
            .slots
            .read()
            .values()
            .map(|slot| {
                let dropped = slot.queue.lock().clear();
                slot.publish_depth(0);
                dropped
            })
            .sum();
        if dropped > 0 {
            info!("Dropped {} queued crawl tasks at shutdown", dropped);
        }

        if tokio::time::timeout(self.config.drain_timeout, self.tracker.wait())
            .await
            .is_ok()
        {
            info!("Crawl dispatcher stopped");
            return Ok(());
        }

        let remaining = self.tracker.len();
        self.hard_stop.cancel();
        self.tracker.wait().await;
        Err(RelayError::Internal(format!(
            "crawl drain timed out after {:?} with {} tasks still running",
            self.config.drain_timeout, remaining
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::CrawlOutcome;
    use crate::db;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore as Gate;

    /// Processor that blocks on a gate and records peak concurrency
    struct GatedProcessor {
        gate: Arc<Gate>,
        running: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
        result: Mutex<Result<CrawlOutcome, CrawlError>>,
    }

    impl GatedProcessor {
        fn new(result: Result<CrawlOutcome, CrawlError>) -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Gate::new(0)),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                done: AtomicUsize::new(0),
                result: Mutex::new(result),
            })
        }
    }

    #[async_trait]
    impl CrawlProcessor for GatedProcessor {
        async fn process(&self, _task: &CrawlTask) -> Result<CrawlOutcome, CrawlError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            self.result.lock().clone()
        }
    }

    async fn registry() -> Arc<SourceRegistry> {
        let pool = db::open_in_memory().await.unwrap();
        let registry = SourceRegistry::load(pool, true).await.unwrap();
        registry.get_or_create("pds.example.com").await.unwrap();
        Arc::new(registry)
    }

    fn config(concurrency: usize, queue: usize) -> CrawlDispatcherConfig {
        CrawlDispatcherConfig {
            concurrency_per_source: concurrency,
            max_queue_per_source: queue,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(1),
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrency_bounded_per_source() {
        let processor = GatedProcessor::new(Ok(CrawlOutcome::default()));
        let dispatcher = CrawlDispatcher::new(config(2, 10), processor.clone(), registry().await);
        dispatcher.start();

        for i in 0..5 {
            dispatcher
                .announce("pds.example.com", &format!("did:plc:r{}", i), None)
                .unwrap();
        }
        wait_until(|| processor.running.load(Ordering::SeqCst) == 2).await;
        assert_eq!(dispatcher.queue_depth("pds.example.com"), 3);

        processor.gate.add_permits(5);
        wait_until(|| processor.done.load(Ordering::SeqCst) == 5).await;
        assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_backpressure_when_queue_full() {
        let processor = GatedProcessor::new(Ok(CrawlOutcome::default()));
        let dispatcher = CrawlDispatcher::new(config(1, 2), processor.clone(), registry().await);

        // Not started, so nothing drains
        dispatcher.announce("pds.example.com", "did:plc:a", None).unwrap();
        dispatcher.announce("pds.example.com", "did:plc:b", None).unwrap();
        let err = dispatcher
            .announce("pds.example.com", "did:plc:c", None)
            .unwrap_err();
        assert!(matches!(err, RelayError::Backpressure { capacity: 2, .. }));

        // Coalescing never needs more room
        assert_eq!(
            dispatcher
                .announce("pds.example.com", "did:plc:a", Some("3kaab".into()))
                .unwrap(),
            Enqueued::Coalesced
        );
        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_exhausted() {
        let processor = GatedProcessor::new(Err(CrawlError::Transient("503".into())));
        processor.gate.add_permits(100);
        let dispatcher = CrawlDispatcher::new(config(1, 10), processor.clone(), registry().await);
        dispatcher.start();

        dispatcher.announce("pds.example.com", "did:plc:a", None).unwrap();
        wait_until(|| processor.done.load(Ordering::SeqCst) == 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(processor.done.load(Ordering::SeqCst), 3);
        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_content_flags_source() {
        let processor = GatedProcessor::new(Err(CrawlError::Invalid("bad repo".into())));
        processor.gate.add_permits(100);
        let sources = registry().await;
        let dispatcher = CrawlDispatcher::new(config(1, 10), processor.clone(), Arc::clone(&sources));
        dispatcher.start();

        dispatcher.announce("pds.example.com", "did:plc:a", None).unwrap();
        wait_until(|| {
            sources
                .get("pds.example.com")
                .map_or(false, |s| s.flag_count == 1)
        })
        .await;
        assert_eq!(processor.done.load(Ordering::SeqCst), 1);
        let source = sources.get("pds.example.com").unwrap();
        assert_eq!(source.last_flag.as_deref(), Some("bad repo"));
        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_times_out_and_cancels() {
        let processor = GatedProcessor::new(Ok(CrawlOutcome::default()));
        let mut cfg = config(1, 10);
        cfg.drain_timeout = Duration::from_millis(50);
        let dispatcher = CrawlDispatcher::new(cfg, processor.clone(), registry().await);
        dispatcher.start();

        dispatcher.announce("pds.example.com", "did:plc:stuck", None).unwrap();
        wait_until(|| processor.running.load(Ordering::SeqCst) == 1).await;

        let err = dispatcher.stop().await.unwrap_err();
        assert!(err.to_string().contains("drain timed out"));
        assert!(matches!(
            dispatcher.announce("pds.example.com", "did:plc:late", None),
            Err(RelayError::ShuttingDown)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_task_queued_after_stop() {
        let processor = GatedProcessor::new(Ok(CrawlOutcome::default()));
        let dispatcher = CrawlDispatcher::new(config(1, 100_000), processor.clone(), registry().await);

        let announcers: Vec<_> = (0..4)
            .map(|n| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    for i in 0.. {
                        let did = format!("did:plc:a{}x{}", n, i);
                        match dispatcher.announce("pds.example.com", &did, None) {
                            Err(RelayError::ShuttingDown) => break,
                            _ => tokio::task::yield_now().await,
                        }
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.stop().await.unwrap();
        for announcer in announcers {
            announcer.await.unwrap();
        }

        assert_eq!(dispatcher.queue_depth("pds.example.com"), 0);
        assert!(dispatcher.state().sources.iter().all(|s| s.queued == 0));
        assert!(!dispatcher.state().accepting);
    }

    #[test]
    fn test_retry_delay_doubles() {
        let base = Duration::from_millis(10);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(10));
        assert_eq!(retry_delay(base, 2), Duration::from_millis(20));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(40));
    }
}
