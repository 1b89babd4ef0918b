/// Rate Limiting System
///
/// Two limiters: a keyed one bounding how often a single repository may be
/// fetched, and a direct one guarding the public crawl-request endpoint.
use crate::{
    context::AppContext,
    error::{RelayError, RelayResult},
    identity::RATE_LIMIT_BYPASS_HEADER,
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{keyed::DefaultKeyedStateStore, InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::{num::NonZeroU32, sync::Arc};

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;
type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-repository fetch limiter
#[derive(Clone)]
pub struct RepoRateLimiter {
    limiter: Option<Arc<KeyedLimiter>>,
}

impl RepoRateLimiter {
    /// At most `limit` fetches per repository per hour; 0 disables limiting
    pub fn per_hour(limit: u32) -> Self {
        Self {
            limiter: NonZeroU32::new(limit)
                .map(|n| Arc::new(GovernorLimiter::keyed(Quota::per_hour(n)))),
        }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    /// Wait until `did` may be fetched again
    pub async fn until_ready(&self, did: &str) {
        if let Some(limiter) = &self.limiter {
            limiter.until_key_ready(&did.to_string()).await;
        }
    }

    /// Consume a fetch for `did` if one is available right now
    pub fn check(&self, did: &str) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check_key(&did.to_string()).is_ok(),
            None => true,
        }
    }

    /// Forget repositories whose budget has fully recovered
    pub fn retain_recent(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// Number of repositories currently tracked
    pub fn len(&self) -> usize {
        self.limiter.as_ref().map_or(0, |l| l.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rate limiter configuration for public endpoints
#[derive(Debug, Clone)]
pub struct RequestRateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

impl Default for RequestRateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_size: 50,
        }
    }
}

/// Global limiter for unauthenticated requests
#[derive(Clone)]
pub struct RequestRateLimiter {
    limiter: Arc<DirectLimiter>,
    bypass_token: Option<String>,
}

impl RequestRateLimiter {
    pub fn new(config: RequestRateLimitConfig, bypass_token: Option<String>) -> Self {
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(rps);
        Self {
            limiter: Arc::new(GovernorLimiter::direct(
                Quota::per_second(rps).allow_burst(burst),
            )),
            bypass_token,
        }
    }

    pub fn check(&self) -> RelayResult<()> {
        self.limiter
            .check()
            .map_err(|_| RelayError::RateLimitExceeded)
    }

    fn is_bypass(&self, token: Option<&str>) -> bool {
        matches!((&self.bypass_token, token), (Some(expected), Some(given)) if expected == given)
    }
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    let bypass = request
        .headers()
        .get(RATE_LIMIT_BYPASS_HEADER)
        .and_then(|v| v.to_str().ok());

    if !ctx.request_limiter.is_bypass(bypass) {
        ctx.request_limiter.check()?;
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_limiter_is_per_repository() {
        let limiter = RepoRateLimiter::per_hour(2);
        assert!(limiter.check("did:plc:a"));
        assert!(limiter.check("did:plc:a"));
        assert!(!limiter.check("did:plc:a"));

        // Other repositories have their own budget
        assert!(limiter.check("did:plc:b"));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_zero_limit_disables() {
        let limiter = RepoRateLimiter::per_hour(0);
        for _ in 0..1000 {
            assert!(limiter.check("did:plc:a"));
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_request_limiter_burst_and_bypass() {
        let limiter = RequestRateLimiter::new(
            RequestRateLimitConfig {
                requests_per_second: 1,
                burst_size: 2,
            },
            Some("secret".to_string()),
        );
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(matches!(limiter.check(), Err(RelayError::RateLimitExceeded)));

        assert!(limiter.is_bypass(Some("secret")));
        assert!(!limiter.is_bypass(Some("wrong")));
        assert!(!limiter.is_bypass(None));
    }
}
