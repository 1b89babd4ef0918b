/// Crawl scheduling and upstream ingestion
///
/// Announcements of new repository revisions become `CrawlTask`s on a
/// per-source queue. Each source has one pump that starts tasks up to its
/// concurrency limit; workers resolve identity, fetch the repository, stage
/// it, hand the resulting events to the event manager and then publish the
/// new head.

pub mod dispatcher;
pub mod fetcher;
pub mod queue;
pub mod slurper;
pub mod worker;

pub use dispatcher::{CrawlDispatcher, CrawlDispatcherConfig, CrawlState, SourceCrawlState};
pub use fetcher::{HttpRepoFetcher, PdsClientPolicy, RepoFetch};
pub use queue::{Enqueued, SourceQueue};
pub use slurper::{Slurper, SlurperConfig};
pub use worker::CrawlWorker;

use crate::{error::RelayError, identity::IdentityError, repo::RepoStoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A request to bring one repository up to date from one source
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlTask {
    pub host: String,
    pub did: String,
    /// Announced revision; `None` means whatever is latest
    pub rev: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl CrawlTask {
    pub fn new(host: impl Into<String>, did: impl Into<String>, rev: Option<String>) -> Self {
        Self {
            host: host.into(),
            did: did.into(),
            rev,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Why a crawl task failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrawlError {
    /// Worth retrying later
    #[error("transient failure: {0}")]
    Transient(String),

    /// The source sent something wrong; never retried
    #[error("invalid content: {0}")]
    Invalid(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<IdentityError> for CrawlError {
    fn from(err: IdentityError) -> Self {
        if err.is_temporary() {
            CrawlError::Transient(err.to_string())
        } else {
            CrawlError::Invalid(err.to_string())
        }
    }
}

impl From<RepoStoreError> for CrawlError {
    fn from(err: RepoStoreError) -> Self {
        match err {
            RepoStoreError::Invalid(msg) => CrawlError::Invalid(msg),
            RepoStoreError::Storage(msg) => CrawlError::Transient(msg),
        }
    }
}

impl From<RelayError> for CrawlError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::ShuttingDown => CrawlError::Cancelled,
            other => CrawlError::Transient(other.to_string()),
        }
    }
}

/// A repository found through spidering, to be crawled from `host`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiderTarget {
    pub host: String,
    pub did: String,
}

/// Result of a successful crawl task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlOutcome {
    /// Events handed to the event manager
    pub sequenced: usize,
    pub discovered: Vec<SpiderTarget>,
}

/// Executes crawl tasks on behalf of the dispatcher
#[async_trait]
pub trait CrawlProcessor: Send + Sync {
    async fn process(&self, task: &CrawlTask) -> Result<CrawlOutcome, CrawlError>;
}
