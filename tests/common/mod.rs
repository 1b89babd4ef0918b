//! Fixtures shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use aurora_relay::{
    config::RelayConfig,
    crawl::{CrawlError, RepoFetch, SlurperConfig},
    db,
    identity::{DidDocument, DidResolver, HandleResolver, IdentityError, Service},
    relay::{Relay, RelayComponents},
    repo::{FetchedRepo, SqliteRepoStore},
    sequencer::{
        DbPersistence, EventPersistence, PlaybackPage, RepoEvent, SequencedEvent, Subscription,
        TrimStats,
    },
    sources::Source,
    RelayError, RelayResult,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HOST: &str = "pds.test";

/// Resolves every DID to a document naming one data host
#[derive(Default)]
pub struct StaticResolver {
    hosts: Mutex<HashMap<String, String>>,
}

impl StaticResolver {
    pub fn host(&self, did: &str, host: &str) {
        self.hosts.lock().unwrap().insert(did.to_string(), host.to_string());
    }
}

#[async_trait]
impl DidResolver for StaticResolver {
    async fn resolve_did(&self, did: &str) -> Result<DidDocument, IdentityError> {
        let host = self
            .hosts
            .lock()
            .unwrap()
            .get(did)
            .cloned()
            .unwrap_or_else(|| HOST.to_string());
        Ok(DidDocument {
            id: did.to_string(),
            also_known_as: Vec::new(),
            verification_method: Vec::new(),
            service: vec![Service {
                id: "#atproto_pds".to_string(),
                kind: "AtprotoPersonalDataServer".to_string(),
                service_endpoint: format!("https://{}", host),
            }],
        })
    }
}

pub struct NoHandles;

#[async_trait]
impl HandleResolver for NoHandles {
    async fn resolve_handle(&self, handle: &str) -> Result<String, IdentityError> {
        Err(IdentityError::NotFound(handle.to_string()))
    }
}

/// Serves whatever revision was last published for each repository
#[derive(Default)]
pub struct FakeFetcher {
    latest: Mutex<HashMap<String, String>>,
    bodies: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl FakeFetcher {
    pub fn publish(&self, did: &str, rev: &str) {
        self.latest.lock().unwrap().insert(did.to_string(), rev.to_string());
    }

    /// Publish `rev` with specific content
    pub fn publish_body(&self, did: &str, rev: &str, body: &str) {
        self.publish(did, rev);
        self.bodies
            .lock()
            .unwrap()
            .insert((did.to_string(), rev.to_string()), body.as_bytes().to_vec());
    }
}

#[async_trait]
impl RepoFetch for FakeFetcher {
    async fn latest_commit(&self, _source: &Source, did: &str) -> Result<String, CrawlError> {
        self.latest
            .lock()
            .unwrap()
            .get(did)
            .cloned()
            .ok_or_else(|| CrawlError::Invalid(format!("no repo {}", did)))
    }

    async fn fetch_repo(&self, source: &Source, did: &str, rev: &str) -> Result<FetchedRepo, CrawlError> {
        Ok(FetchedRepo {
            did: did.to_string(),
            rev: rev.to_string(),
            host: source.host.clone(),
            body: self
                .bodies
                .lock()
                .unwrap()
                .get(&(did.to_string(), rev.to_string()))
                .cloned()
                .unwrap_or_else(|| format!("{} at {}", did, rev).into_bytes()),
        })
    }
}

/// Event log whose first few appends fail
pub struct FlakyLog {
    inner: DbPersistence,
    failures: AtomicUsize,
}

#[async_trait]
impl EventPersistence for FlakyLog {
    async fn persist(&self, event: RepoEvent) -> RelayResult<SequencedEvent> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RelayError::Internal("disk busy".to_string()));
        }
        self.inner.persist(event).await
    }

    async fn playback(&self, since: i64, limit: usize) -> RelayResult<PlaybackPage> {
        self.inner.playback(since, limit).await
    }

    async fn last_seq(&self) -> RelayResult<i64> {
        self.inner.last_seq().await
    }

    async fn trim(&self, before: DateTime<Utc>) -> RelayResult<TrimStats> {
        self.inner.trim(before).await
    }

    async fn take_down_repo(&self, did: &str) -> RelayResult<()> {
        self.inner.take_down_repo(did).await
    }

    fn retention(&self) -> Option<Duration> {
        self.inner.retention()
    }

    async fn flush(&self) -> RelayResult<()> {
        self.inner.flush().await
    }

    async fn shutdown(&self) -> RelayResult<()> {
        self.inner.shutdown().await
    }
}

pub struct Harness {
    pub relay: Arc<Relay>,
    pub resolver: Arc<StaticResolver>,
    pub fetcher: Arc<FakeFetcher>,
}

pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.service.admin_key = None;
    config.crawl.retry_backoff = Duration::from_millis(10);
    config.crawl.default_repo_limit = 0;
    config
}

pub async fn harness(config: RelayConfig) -> Harness {
    harness_with_failing_appends(config, 0).await
}

/// Harness whose event log rejects the first `failures` appends
pub async fn harness_with_failing_appends(config: RelayConfig, failures: usize) -> Harness {
    let pool = db::open_in_memory().await.unwrap();
    let persister = FlakyLog {
        inner: DbPersistence::open(pool.clone()).await.unwrap(),
        failures: AtomicUsize::new(failures),
    };
    let resolver = Arc::new(StaticResolver::default());
    let fetcher = Arc::new(FakeFetcher::default());

    let components = RelayComponents {
        repos: Arc::new(SqliteRepoStore::new(pool.clone())),
        db: pool,
        did_resolver: resolver.clone(),
        handle_resolver: Arc::new(NoHandles),
        fetcher: fetcher.clone(),
        persister: Arc::new(persister),
        slurper: SlurperConfig::default(),
    };
    let relay = Relay::from_components(config, components).await.unwrap();

    Harness {
        relay: Arc::new(relay),
        resolver,
        fetcher,
    }
}

/// Next event on `sub`, failing the test after a few seconds
pub async fn next_event(sub: &mut Subscription) -> SequencedEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription closed")
        .expect("subscription failed")
}

/// True if nothing arrives on `sub` within `wait`
pub async fn stays_quiet(sub: &mut Subscription, wait: Duration) -> bool {
    tokio::time::timeout(wait, sub.next()).await.is_err()
}
