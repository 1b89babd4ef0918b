/// Relay orchestrator
///
/// Owns every long-lived component, wires them together from configuration,
/// starts them in dependency order, exposes the operator actions, and stops
/// them again in reverse order while collecting every failure.
use crate::{
    config::{EventLogConfig, RelayConfig},
    crawl::{
        CrawlDispatcher, CrawlState, CrawlWorker, Enqueued, HttpRepoFetcher, PdsClientPolicy,
        RepoFetch, Slurper, SlurperConfig,
    },
    db,
    error::{RelayError, RelayResult},
    identity::{
        bypass_modifier, identity_http_client, CachingDidResolver, DidResolver, HandleResolver,
        IdentityCacheConfig, MultiResolver, PlcResolver, ProdHandleResolver, TrialHandleResolver,
        WebResolver,
    },
    jobs::{CompactionRun, Compactor, JobScheduler},
    rate_limit::RepoRateLimiter,
    repo::{RepoHead, RepoStore, SqliteRepoStore},
    sequencer::{
        AccountEvent, AccountStatus, DbPersistence, DiskPersistOptions, DiskPersistence,
        EventManager, EventManagerConfig, EventPersistence, RepoEvent, SequencedEvent,
        Subscription, TrimStats,
    },
    sources::{normalize_host, Source, SourceRegistry, SourceStatus},
};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A component with its own shutdown step
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &'static str;

    async fn shutdown(&self) -> RelayResult<()>;
}

#[async_trait]
impl Subsystem for Slurper {
    fn name(&self) -> &'static str {
        "slurper"
    }

    async fn shutdown(&self) -> RelayResult<()> {
        Slurper::shutdown(self).await
    }
}

#[async_trait]
impl Subsystem for CrawlDispatcher {
    fn name(&self) -> &'static str {
        "crawl dispatcher"
    }

    async fn shutdown(&self) -> RelayResult<()> {
        self.stop().await
    }
}

#[async_trait]
impl Subsystem for JobScheduler {
    fn name(&self) -> &'static str {
        "job scheduler"
    }

    async fn shutdown(&self) -> RelayResult<()> {
        JobScheduler::shutdown(self).await
    }
}

#[async_trait]
impl Subsystem for EventManager {
    fn name(&self) -> &'static str {
        "event manager"
    }

    async fn shutdown(&self) -> RelayResult<()> {
        EventManager::shutdown(self).await
    }
}

/// The metadata database pool
pub struct Database(pub SqlitePool);

#[async_trait]
impl Subsystem for Database {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn shutdown(&self) -> RelayResult<()> {
        self.0.close().await;
        Ok(())
    }
}

/// Every failure reported during shutdown, by subsystem
#[derive(Debug, Default)]
pub struct ShutdownErrors {
    pub failures: Vec<(&'static str, RelayError)>,
}

impl ShutdownErrors {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for ShutdownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} subsystem(s) failed to shut down", self.failures.len())?;
        for (name, err) in &self.failures {
            write!(f, "; {}: {}", name, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownErrors {}

/// Shut down `subsystems` in order; a failure never skips the rest
pub async fn shutdown_all(subsystems: &[Arc<dyn Subsystem>]) -> Result<(), ShutdownErrors> {
    let mut errors = ShutdownErrors::default();
    for subsystem in subsystems {
        info!("Stopping {}", subsystem.name());
        if let Err(e) = subsystem.shutdown().await {
            error!("{} failed to shut down: {}", subsystem.name(), e);
            errors.failures.push((subsystem.name(), e));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Collaborators the relay is assembled from
pub struct RelayComponents {
    pub db: SqlitePool,
    pub did_resolver: Arc<dyn DidResolver>,
    pub handle_resolver: Arc<dyn HandleResolver>,
    pub fetcher: Arc<dyn RepoFetch>,
    pub repos: Arc<dyn RepoStore>,
    pub persister: Arc<dyn EventPersistence>,
    pub slurper: SlurperConfig,
}

/// The relay
pub struct Relay {
    config: RelayConfig,
    db: SqlitePool,
    sources: Arc<SourceRegistry>,
    identities: Arc<CachingDidResolver>,
    repos: Arc<dyn RepoStore>,
    events: Arc<EventManager>,
    dispatcher: Arc<CrawlDispatcher>,
    slurper: Arc<Slurper>,
    compactor: Arc<Compactor>,
    jobs: Arc<JobScheduler>,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl Relay {
    /// Build the production relay from configuration
    pub async fn new(config: RelayConfig) -> RelayResult<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.storage.data_directory).await?;

        let pool = db::create_pool(
            &config.storage.db_url,
            db::DatabaseOptions {
                max_connections: config.storage.max_connections,
                ..Default::default()
            },
        )
        .await?;
        db::run_migrations(&pool).await?;
        db::test_connection(&pool).await?;

        let http = identity_http_client()?;
        let mut did_resolver = MultiResolver::new();
        did_resolver.add_handler(
            "plc",
            Arc::new(PlcResolver::new(config.identity.plc_host.clone(), http.clone())),
        );
        did_resolver.add_handler(
            "web",
            Arc::new(WebResolver::new(config.identity.insecure_did_web, http.clone())),
        );

        let handle_resolver: Arc<dyn HandleResolver> = if config.identity.handle_resolver_hosts.is_empty() {
            let mut resolver = ProdHandleResolver::new(
                http.clone(),
                config.identity.handle_cache_size,
                config.identity.handle_cache_ttl,
            );
            if let Some(token) = &config.identity.rate_limit_bypass {
                resolver = resolver.with_request_modifier(bypass_modifier(
                    config.identity.handle_bypass_suffix.clone(),
                    token.clone(),
                ));
            }
            Arc::new(resolver)
        } else {
            Arc::new(TrialHandleResolver::new(
                config.identity.handle_resolver_hosts.clone(),
                http,
            ))
        };

        let fetcher = HttpRepoFetcher::new(
            config.crawl.max_fetch_concurrency,
            PdsClientPolicy {
                partner_suffix: config.crawl.partner_host_suffix.clone(),
                bypass_token: config.crawl.rate_limit_bypass.clone(),
                ..Default::default()
            },
        )?;

        let persister: Arc<dyn EventPersistence> = match &config.storage.event_log {
            EventLogConfig::Database => Arc::new(DbPersistence::open(pool.clone()).await?),
            EventLogConfig::Disk {
                directory,
                retention,
                events_per_segment,
            } => Arc::new(
                DiskPersistence::open(
                    directory.clone(),
                    DiskPersistOptions {
                        retention: *retention,
                        events_per_segment: *events_per_segment,
                        ..Default::default()
                    },
                )
                .await?,
            ),
        };

        let components = RelayComponents {
            repos: Arc::new(SqliteRepoStore::new(pool.clone())),
            db: pool,
            did_resolver: Arc::new(did_resolver),
            handle_resolver,
            fetcher: Arc::new(fetcher),
            persister,
            slurper: SlurperConfig::default(),
        };
        Self::from_components(config, components).await
    }

    /// Assemble the relay around injected collaborators
    pub async fn from_components(config: RelayConfig, components: RelayComponents) -> RelayResult<Self> {
        let sources = Arc::new(SourceRegistry::load(components.db.clone(), config.crawl.ssl).await?);

        let identities = Arc::new(CachingDidResolver::new(
            components.did_resolver,
            IdentityCacheConfig {
                ttl: config.identity.did_cache_ttl,
                capacity: config.identity.did_cache_size,
            },
        ));

        let events = Arc::new(EventManager::new(
            components.persister,
            EventManagerConfig {
                subscriber_buffer: config.firehose.subscriber_buffer,
                playback_batch: config.firehose.playback_batch,
            },
        ));

        let rate_limiter = RepoRateLimiter::per_hour(config.crawl.default_repo_limit);
        let worker = Arc::new(CrawlWorker::new(
            Arc::clone(&sources),
            Arc::clone(&identities),
            components.handle_resolver,
            components.fetcher,
            Arc::clone(&components.repos),
            Arc::clone(&events),
            rate_limiter.clone(),
            config.crawl.spidering,
        ));

        let dispatcher = CrawlDispatcher::new(
            (&config.crawl).into(),
            worker.clone(),
            Arc::clone(&sources),
        );
        let slurper = Slurper::new(
            components.slurper,
            Arc::clone(&sources),
            Arc::clone(&dispatcher),
            worker,
        );

        let compactor = Arc::new(Compactor::new(Arc::clone(&components.repos)));
        let jobs = JobScheduler::new(
            (&config.maintenance).into(),
            Arc::clone(&compactor),
            Arc::clone(&events),
            Arc::clone(&identities),
            rate_limiter,
        );

        Ok(Self {
            config,
            db: components.db,
            sources,
            identities,
            repos: components.repos,
            events,
            dispatcher,
            slurper,
            compactor,
            jobs,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    /// Start crawling, maintenance and upstream subscriptions
    pub fn start(&self) -> RelayResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.dispatcher.start();
        self.jobs.start();
        let upstreams = self.slurper.start()?;
        info!(
            "Relay started: {} sources known, {} subscribed",
            self.sources.list().len(),
            upstreams
        );
        Ok(())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn identities(&self) -> &Arc<CachingDidResolver> {
        &self.identities
    }

    pub fn upstream_hosts(&self) -> Vec<String> {
        self.slurper.active_hosts()
    }

    /// Current head of a repository; taken-down repositories are hidden
    pub async fn repo_head(&self, did: &str) -> RelayResult<Option<RepoHead>> {
        if self.repos.is_taken_down(did).await? {
            return Ok(None);
        }
        Ok(self.repos.head(did).await?)
    }

    /// Open a firehose subscription
    pub async fn subscribe(&self, cursor: Option<i64>) -> RelayResult<Subscription> {
        self.events.subscribe(cursor).await
    }

    /// A host asked to be crawled; register it and subscribe to its events
    pub async fn request_crawl(&self, host: &str) -> RelayResult<Source> {
        let host = normalize_host(host)?;
        let mut source = self.sources.get_or_create(&host).await?;
        match source.status {
            SourceStatus::Banned => return Err(RelayError::Banned(host)),
            SourceStatus::Inactive => {
                info!("Reactivating {} on crawl request", host);
                source = self.sources.set_status(&host, SourceStatus::Active).await?;
            }
            SourceStatus::Active => {}
        }

        if self.started.load(Ordering::SeqCst) {
            self.slurper.subscribe(&host)?;
        }
        Ok(source)
    }

    /// Queue a crawl of one repository from a host
    pub async fn crawl_repo(&self, host: &str, did: &str, rev: Option<String>) -> RelayResult<Enqueued> {
        let host = normalize_host(host)?;
        let source = self.sources.get_or_create(&host).await?;
        if !source.is_active() {
            return Err(RelayError::Validation(format!("{} is {}", host, source.status)));
        }
        self.dispatcher.announce(&host, did, rev)
    }

    /// Ban a host, registering it first if unknown, and drop its subscription
    pub async fn ban_source(&self, host: &str) -> RelayResult<Source> {
        let host = normalize_host(host)?;
        if self.sources.get(&host).is_none() {
            // get_or_create refuses hosts under a banned domain
            if let Err(e) = self.sources.get_or_create(&host).await {
                if !matches!(e, RelayError::Banned(_)) {
                    return Err(e);
                }
            }
        }
        let source = match self.sources.get(&host) {
            Some(_) => self.sources.set_status(&host, SourceStatus::Banned).await?,
            None => return Err(RelayError::Banned(host)),
        };
        if self.slurper.disconnect(&host) {
            info!("Disconnected banned source {}", host);
        }
        Ok(source)
    }

    pub async fn unban_source(&self, host: &str) -> RelayResult<Source> {
        let host = normalize_host(host)?;
        let source = self.sources.set_status(&host, SourceStatus::Active).await?;
        if self.started.load(Ordering::SeqCst) {
            self.slurper.subscribe(&host)?;
        }
        Ok(source)
    }

    /// Ban a domain and everything under it
    pub async fn ban_domain(&self, domain: &str) -> RelayResult<()> {
        let domain = normalize_host(domain)?;
        self.sources.ban_domain(&domain).await?;
        for host in self.slurper.active_hosts() {
            if self.sources.is_banned(&host) {
                self.slurper.disconnect(&host);
                info!("Disconnected {} under banned domain {}", host, domain);
            }
        }
        Ok(())
    }

    pub async fn unban_domain(&self, domain: &str) -> RelayResult<()> {
        let domain = normalize_host(domain)?;
        self.sources.unban_domain(&domain).await
    }

    pub fn domain_bans(&self) -> Vec<String> {
        self.sources.domain_bans()
    }

    /// Take a repository down relay-wide
    ///
    /// Its past events disappear from replay and subscribers are told the
    /// account is taken down.
    pub async fn take_down_repo(&self, did: &str) -> RelayResult<SequencedEvent> {
        self.repos.take_down(did).await?;
        self.events.take_down_repo(did).await?;
        let evt = self
            .events
            .add_event(RepoEvent::Account(AccountEvent::new(
                did.to_string(),
                false,
                Some(AccountStatus::Takendown),
            )))
            .await?;
        warn!("Took down {} (seq {})", did, evt.seq);
        Ok(evt)
    }

    /// Lift a takedown; new revisions are accepted again
    pub async fn reverse_take_down(&self, did: &str) -> RelayResult<SequencedEvent> {
        if !self.repos.is_taken_down(did).await? {
            return Err(RelayError::NotFound(format!("{} is not taken down", did)));
        }
        self.repos.reverse_take_down(did).await?;
        let evt = self
            .events
            .add_event(RepoEvent::Account(AccountEvent::new(did.to_string(), true, None)))
            .await?;
        info!("Reversed takedown of {} (seq {})", did, evt.seq);
        Ok(evt)
    }

    /// Run a compaction now unless one is already running
    pub async fn compact(&self) -> RelayResult<CompactionRun> {
        self.compactor.run().await
    }

    pub fn crawl_state(&self) -> CrawlState {
        self.dispatcher.state()
    }

    /// Apply the event log's retention window now
    pub async fn trim_events(&self) -> RelayResult<Option<TrimStats>> {
        self.events.trim().await
    }

    pub async fn health(&self) -> RelayResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }
        db::test_connection(&self.db).await
    }

    /// Subsystems in shutdown order
    fn subsystems(&self) -> Vec<Arc<dyn Subsystem>> {
        vec![
            self.slurper.clone() as Arc<dyn Subsystem>,
            self.dispatcher.clone() as Arc<dyn Subsystem>,
            self.jobs.clone() as Arc<dyn Subsystem>,
            self.events.clone() as Arc<dyn Subsystem>,
            Arc::new(Database(self.db.clone())) as Arc<dyn Subsystem>,
        ]
    }

    /// Stop everything, in order, reporting every failure
    pub async fn shutdown(&self) -> Result<(), ShutdownErrors> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Relay shutting down");
        let result = shutdown_all(&self.subsystems()).await;
        if result.is_ok() {
            info!("Relay stopped cleanly");
        }
        result
    }
}
