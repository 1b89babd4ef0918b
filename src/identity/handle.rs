/// Handle to DID resolution
use crate::{
    identity::{cache::bounded_lru, IdentityError},
    metrics,
};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Header that exempts relay traffic from partner rate limits
pub const RATE_LIMIT_BYPASS_HEADER: &str = "x-ratelimit-bypass";

/// Resolves a handle to the DID it claims
#[async_trait]
pub trait HandleResolver: Send + Sync {
    async fn resolve_handle(&self, handle: &str) -> Result<String, IdentityError>;
}

/// Adds headers to outbound handle requests for a given handle
pub type RequestModifier =
    Arc<dyn Fn(reqwest::RequestBuilder, &str) -> reqwest::RequestBuilder + Send + Sync>;

/// Request modifier adding the bypass header for handles under `suffix`
pub fn bypass_modifier(suffix: String, token: String) -> RequestModifier {
    Arc::new(move |req, handle| {
        if handle.ends_with(&suffix) {
            req.header(RATE_LIMIT_BYPASS_HEADER, token.as_str())
        } else {
            req
        }
    })
}

/// Lowercased handle without a leading `@` or `at://`
pub fn normalize_handle(handle: &str) -> String {
    handle
        .trim()
        .trim_start_matches("at://")
        .trim_start_matches('@')
        .trim_end_matches('.')
        .to_lowercase()
}

/// Production resolver using the `/.well-known/atproto-did` HTTPS path
///
/// DNS TXT lookups are not performed here.
pub struct ProdHandleResolver {
    http: reqwest::Client,
    req_mod: Option<RequestModifier>,
    ttl: Duration,
    cache: Mutex<LruCache<String, (String, Instant)>>,
}

impl ProdHandleResolver {
    pub fn new(http: reqwest::Client, capacity: usize, ttl: Duration) -> Self {
        Self {
            http,
            req_mod: None,
            ttl,
            cache: Mutex::new(bounded_lru(capacity)),
        }
    }

    pub fn with_request_modifier(mut self, req_mod: RequestModifier) -> Self {
        self.req_mod = Some(req_mod);
        self
    }

    fn cached(&self, handle: &str) -> Option<String> {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        let found = cache
            .get(handle)
            .map(|(did, expires_at)| (*expires_at > now, did.clone()));
        match found {
            Some((true, did)) => Some(did),
            Some((false, _)) => {
                cache.pop(handle);
                None
            }
            None => None,
        }
    }

    async fn fetch(&self, handle: &str) -> Result<String, IdentityError> {
        let url = format!("https://{}/.well-known/atproto-did", handle);
        let mut req = self.http.get(&url);
        if let Some(req_mod) = &self.req_mod {
            req = req_mod(req, handle);
        }

        let response = req
            .send()
            .await
            .map_err(|e| IdentityError::Temporary(format!("{}: {}", handle, e)))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(IdentityError::NotFound(handle.to_string()))
            }
            status => {
                return Err(IdentityError::Temporary(format!(
                    "{}: well-known returned {}",
                    handle, status
                )))
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| IdentityError::Temporary(format!("{}: {}", handle, e)))?;
        let did = body.trim();
        if !did.starts_with("did:") {
            return Err(IdentityError::Malformed(format!(
                "{}: well-known body is not a DID",
                handle
            )));
        }
        Ok(did.to_string())
    }
}

#[async_trait]
impl HandleResolver for ProdHandleResolver {
    async fn resolve_handle(&self, handle: &str) -> Result<String, IdentityError> {
        let handle = normalize_handle(handle);
        if let Some(did) = self.cached(&handle) {
            metrics::record_cache_access("handle", true);
            return Ok(did);
        }
        metrics::record_cache_access("handle", false);

        let did = self.fetch(&handle).await?;
        self.cache
            .lock()
            .put(handle, (did.clone(), Instant::now() + self.ttl));
        Ok(did)
    }
}

#[derive(Debug, Deserialize)]
struct ResolveHandleOutput {
    did: String,
}

/// Resolver that only asks a fixed list of hosts, bypassing DNS
///
/// Used in test networks where handles live on known PDS hosts.
pub struct TrialHandleResolver {
    trial_hosts: Vec<String>,
    http: reqwest::Client,
}

impl TrialHandleResolver {
    pub fn new(trial_hosts: Vec<String>, http: reqwest::Client) -> Self {
        Self {
            trial_hosts: trial_hosts
                .into_iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .collect(),
            http,
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.trial_hosts
    }
}

#[async_trait]
impl HandleResolver for TrialHandleResolver {
    async fn resolve_handle(&self, handle: &str) -> Result<String, IdentityError> {
        let handle = normalize_handle(handle);
        let mut last_err = IdentityError::NotFound(handle.clone());

        for host in &self.trial_hosts {
            let url = format!("{}/xrpc/com.atproto.identity.resolveHandle", host);
            let response = match self
                .http
                .get(&url)
                .query(&[("handle", handle.as_str())])
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    debug!("Trial host {} failed for {}: {}", host, handle, e);
                    last_err = IdentityError::Temporary(format!("{}: {}", host, e));
                    continue;
                }
            };

            if !response.status().is_success() {
                continue;
            }

            match response.json::<ResolveHandleOutput>().await {
                Ok(out) => return Ok(out.did),
                Err(e) => {
                    last_err = IdentityError::Malformed(format!("{}: {}", host, e));
                }
            }
        }

        Err(last_err)
    }
}
