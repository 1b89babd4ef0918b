/// Crawl worker - turns a crawl task into sequenced events
use crate::{
    crawl::{CrawlError, CrawlOutcome, CrawlProcessor, CrawlTask, RepoFetch, SpiderTarget},
    error::RelayResult,
    identity::{CachingDidResolver, DidDocument, HandleResolver, IdentityError},
    rate_limit::RepoRateLimiter,
    repo::{RepoStore, StagedHead},
    sequencer::{AccountEvent, AccountStatus, EventManager, IdentityEvent, RepoEvent, SequencedEvent},
    sources::SourceRegistry,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CrawlWorker {
    sources: Arc<SourceRegistry>,
    identities: Arc<CachingDidResolver>,
    handles: Arc<dyn HandleResolver>,
    fetcher: Arc<dyn RepoFetch>,
    repos: Arc<dyn RepoStore>,
    events: Arc<EventManager>,
    rate_limiter: RepoRateLimiter,
    spidering: bool,
}

impl CrawlWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: Arc<SourceRegistry>,
        identities: Arc<CachingDidResolver>,
        handles: Arc<dyn HandleResolver>,
        fetcher: Arc<dyn RepoFetch>,
        repos: Arc<dyn RepoStore>,
        events: Arc<EventManager>,
        rate_limiter: RepoRateLimiter,
        spidering: bool,
    ) -> Self {
        Self {
            sources,
            identities,
            handles,
            fetcher,
            repos,
            events,
            rate_limiter,
            spidering,
        }
    }

    pub fn rate_limiter(&self) -> &RepoRateLimiter {
        &self.rate_limiter
    }

    /// Resolve `did` and check that `host` is its data host
    ///
    /// A mismatch may be a stale cache entry after a migration, so the
    /// document is re-resolved once before giving up.
    async fn verify_host(&self, did: &str, host: &str) -> Result<Arc<DidDocument>, CrawlError> {
        let doc = self.identities.resolve(did).await?;
        if doc.pds_host().as_deref() == Some(host) {
            return Ok(doc);
        }

        self.identities.invalidate(did);
        let doc = self.identities.resolve(did).await?;
        match doc.pds_host() {
            Some(pds) if pds == host => Ok(doc),
            Some(pds) => Err(CrawlError::Invalid(format!(
                "{} announced {} which is hosted on {}",
                host, did, pds
            ))),
            None => Err(CrawlError::Invalid(format!(
                "{} has no data host in its identity document",
                did
            ))),
        }
    }

    /// Hosts for referenced repositories the relay has not seen yet
    ///
    /// New hosts are registered; banned or unresolvable ones are skipped.
    pub async fn spider_targets(&self, references: &[String]) -> Vec<SpiderTarget> {
        let mut targets = Vec::new();
        for did in references {
            match self.repos.head(did).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    debug!("Skipping spider target {}: {}", did, e);
                    continue;
                }
            }

            let host = match self.identities.resolve(did).await {
                Ok(doc) => match doc.pds_host() {
                    Some(host) => host,
                    None => continue,
                },
                Err(e) => {
                    debug!("Could not resolve spider target {}: {}", did, e);
                    continue;
                }
            };

            if self.sources.is_banned(&host) {
                continue;
            }
            match self.sources.get_or_create(&host).await {
                Ok(source) if source.is_active() => targets.push(SpiderTarget {
                    host: source.host,
                    did: did.clone(),
                }),
                Ok(_) => {}
                Err(e) => debug!("Could not register spidered host {}: {}", host, e),
            }
        }
        targets
    }

    /// Sequence an identity change announced by `host`
    ///
    /// The cached document is dropped first. A handle is only carried when
    /// it resolves back to the same DID.
    pub async fn handle_identity(
        &self,
        host: &str,
        did: &str,
        handle: Option<String>,
    ) -> RelayResult<Option<SequencedEvent>> {
        self.identities.invalidate(did);
        let doc = match self.verify_host(did, host).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Ignoring identity event for {} from {}: {}", did, host, e);
                return Ok(None);
            }
        };

        let claimed = handle.or_else(|| doc.handle().map(str::to_string));
        let verified = match claimed {
            Some(handle) => match self.handles.resolve_handle(&handle).await {
                Ok(resolved) if resolved == did => Some(handle),
                Ok(resolved) => {
                    info!("Handle {} resolves to {}, not {}", handle, resolved, did);
                    None
                }
                Err(IdentityError::Temporary(e)) => {
                    debug!("Handle {} unverifiable right now: {}", handle, e);
                    None
                }
                Err(_) => None,
            },
            None => None,
        };

        let evt = self
            .events
            .add_event(RepoEvent::Identity(IdentityEvent::new(did.to_string(), verified)))
            .await?;
        Ok(Some(evt))
    }

    /// Sequence an account status change announced by `host`
    pub async fn handle_account(
        &self,
        host: &str,
        did: &str,
        active: bool,
        status: Option<AccountStatus>,
    ) -> RelayResult<Option<SequencedEvent>> {
        if let Err(e) = self.verify_host(did, host).await {
            warn!("Ignoring account event for {} from {}: {}", did, host, e);
            return Ok(None);
        }
        // A relay-level takedown overrides what the host reports
        if self.repos.is_taken_down(did).await.unwrap_or(false) {
            return Ok(None);
        }

        let evt = self
            .events
            .add_event(RepoEvent::Account(AccountEvent::new(did.to_string(), active, status)))
            .await?;
        Ok(Some(evt))
    }
}

/// Sequence staged events, then move the head to the staged revision
///
/// If any append fails the head stays put, so a retry stages and sequences
/// the same revision again.
async fn publish(
    events: Arc<EventManager>,
    repos: Arc<dyn RepoStore>,
    staged: Vec<RepoEvent>,
    head: Option<StagedHead>,
) -> Result<usize, CrawlError> {
    let mut sequenced = 0;
    for event in staged {
        events.add_event(event).await?;
        sequenced += 1;
    }
    if let Some(head) = head {
        if !repos.advance(&head).await? {
            debug!("{} moved past {} while sequencing", head.did, head.rev);
        }
    }
    Ok(sequenced)
}

#[async_trait]
impl CrawlProcessor for CrawlWorker {
    async fn process(&self, task: &CrawlTask) -> Result<CrawlOutcome, CrawlError> {
        let source = match self.sources.get(&task.host) {
            Some(source) if source.is_active() => source,
            _ => {
                debug!("Skipping crawl of {} from inactive host {}", task.did, task.host);
                return Ok(CrawlOutcome::default());
            }
        };

        self.verify_host(&task.did, &source.host).await?;

        let rev = match &task.rev {
            Some(rev) => rev.clone(),
            None => self.fetcher.latest_commit(&source, &task.did).await?,
        };

        if let Some(head) = self.repos.head(&task.did).await? {
            if head.rev >= rev {
                debug!("{} already at {} (announced {})", task.did, head.rev, rev);
                return Ok(CrawlOutcome::default());
            }
        }

        self.rate_limiter.until_ready(&task.did).await;
        let fetched = self.fetcher.fetch_repo(&source, &task.did, &rev).await?;
        let applied = self.repos.stage(fetched).await?;

        // Detached so cancelling the crawl cannot interrupt an append
        let sequencing = tokio::spawn(publish(
            self.events.clone(),
            self.repos.clone(),
            applied.events,
            applied.head,
        ));
        let sequenced = sequencing
            .await
            .map_err(|e| CrawlError::Transient(format!("sequencing task failed: {}", e)))??;

        let mut outcome = CrawlOutcome {
            sequenced,
            ..Default::default()
        };
        if self.spidering && !applied.references.is_empty() {
            outcome.discovered = self.spider_targets(&applied.references).await;
        }
        Ok(outcome)
    }
}
