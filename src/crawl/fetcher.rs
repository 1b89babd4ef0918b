/// Repository download from upstream sources
use crate::{
    crawl::CrawlError,
    error::{RelayError, RelayResult},
    identity::RATE_LIMIT_BYPASS_HEADER,
    repo::FetchedRepo,
    sources::Source,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Fetches repository state from a source
#[async_trait]
pub trait RepoFetch: Send + Sync {
    /// Current revision of `did` on `source`
    async fn latest_commit(&self, source: &Source, did: &str) -> Result<String, CrawlError>;

    /// Full repository export, labelled with the revision it was requested for
    async fn fetch_repo(&self, source: &Source, did: &str, rev: &str) -> Result<FetchedRepo, CrawlError>;
}

/// Per-host HTTP client settings
///
/// Partner hosts are trusted infrastructure: they get long timeouts and,
/// when configured, the rate-limit bypass header.
#[derive(Debug, Clone)]
pub struct PdsClientPolicy {
    pub partner_suffix: String,
    pub bypass_token: Option<String>,
    pub partner_timeout: Duration,
    pub default_timeout: Duration,
}

impl Default for PdsClientPolicy {
    fn default() -> Self {
        Self {
            partner_suffix: ".bsky.network".to_string(),
            bypass_token: None,
            partner_timeout: Duration::from_secs(30 * 60),
            default_timeout: Duration::from_secs(60),
        }
    }
}

impl PdsClientPolicy {
    pub fn is_partner(&self, host: &str) -> bool {
        !self.partner_suffix.is_empty() && host.ends_with(&self.partner_suffix)
    }

    pub fn timeout_for(&self, host: &str) -> Duration {
        if self.is_partner(host) {
            self.partner_timeout
        } else {
            self.default_timeout
        }
    }

    /// Apply timeout and headers for `host` to a request
    pub fn apply(&self, req: reqwest::RequestBuilder, host: &str) -> reqwest::RequestBuilder {
        let req = req.timeout(self.timeout_for(host));
        match &self.bypass_token {
            Some(token) if self.is_partner(host) => {
                req.header(RATE_LIMIT_BYPASS_HEADER, token.as_str())
            }
            _ => req,
        }
    }
}

/// Map an upstream HTTP status to a crawl failure; `None` on success
pub fn classify_status(status: StatusCode, context: &str) -> Option<CrawlError> {
    if status.is_success() {
        return None;
    }
    let reason = format!("{} returned {}", context, status);
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => CrawlError::Transient(reason),
        s if s.is_server_error() => CrawlError::Transient(reason),
        _ => CrawlError::Invalid(reason),
    })
}

#[derive(Debug, Deserialize)]
struct LatestCommit {
    rev: String,
}

/// HTTP fetcher bounded by a global concurrency ceiling
pub struct HttpRepoFetcher {
    http: reqwest::Client,
    policy: PdsClientPolicy,
    fetch_limit: Arc<Semaphore>,
}

impl HttpRepoFetcher {
    pub fn new(max_concurrency: usize, policy: PdsClientPolicy) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("aurora-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            policy,
            fetch_limit: Arc::new(Semaphore::new(max_concurrency)),
        })
    }

    pub fn available_permits(&self) -> usize {
        self.fetch_limit.available_permits()
    }

    async fn get(&self, source: &Source, method: &str, did: &str) -> Result<reqwest::Response, CrawlError> {
        let url = format!("{}/xrpc/{}", source.http_base(), method);
        let req = self.policy.apply(self.http.get(&url).query(&[("did", did)]), &source.host);

        let response = req
            .send()
            .await
            .map_err(|e| CrawlError::Transient(format!("{} {}: {}", source.host, method, e)))?;

        match classify_status(response.status(), &format!("{} {}", source.host, method)) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }
}

#[async_trait]
impl RepoFetch for HttpRepoFetcher {
    async fn latest_commit(&self, source: &Source, did: &str) -> Result<String, CrawlError> {
        let _permit = self
            .fetch_limit
            .acquire()
            .await
            .map_err(|_| CrawlError::Cancelled)?;

        let latest: LatestCommit = self
            .get(source, "com.atproto.sync.getLatestCommit", did)
            .await?
            .json()
            .await
            .map_err(|e| CrawlError::Invalid(format!("{}: bad getLatestCommit body: {}", source.host, e)))?;
        Ok(latest.rev)
    }

    async fn fetch_repo(&self, source: &Source, did: &str, rev: &str) -> Result<FetchedRepo, CrawlError> {
        let _permit = self
            .fetch_limit
            .acquire()
            .await
            .map_err(|_| CrawlError::Cancelled)?;

        debug!("Fetching {} at {} from {}", did, rev, source.host);
        let body = self
            .get(source, "com.atproto.sync.getRepo", did)
            .await?
            .bytes()
            .await
            .map_err(|e| CrawlError::Transient(format!("{}: reading getRepo body: {}", source.host, e)))?;

        Ok(FetchedRepo {
            did: did.to_string(),
            rev: rev.to_string(),
            host: source.host.clone(),
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partner_policy() {
        let policy = PdsClientPolicy {
            bypass_token: Some("token".to_string()),
            ..Default::default()
        };
        assert!(policy.is_partner("morel.us-east.host.bsky.network"));
        assert!(!policy.is_partner("pds.example.com"));
        assert_eq!(
            policy.timeout_for("morel.us-east.host.bsky.network"),
            Duration::from_secs(1800)
        );
        assert_eq!(policy.timeout_for("pds.example.com"), Duration::from_secs(60));

        let client = reqwest::Client::new();
        let req = policy
            .apply(client.get("https://morel.us-east.host.bsky.network/"), "morel.us-east.host.bsky.network")
            .build()
            .unwrap();
        assert_eq!(req.headers().get(RATE_LIMIT_BYPASS_HEADER).unwrap(), "token");

        let req = policy
            .apply(client.get("https://pds.example.com/"), "pds.example.com")
            .build()
            .unwrap();
        assert!(req.headers().get(RATE_LIMIT_BYPASS_HEADER).is_none());
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::OK, "x").is_none());
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "x"),
            Some(CrawlError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "x"),
            Some(CrawlError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "x"),
            Some(CrawlError::Invalid(_))
        ));
    }
}
