/// Application context shared by HTTP handlers
use crate::{
    auth::AdminToken,
    rate_limit::{RequestRateLimitConfig, RequestRateLimiter},
    relay::Relay,
};
use std::sync::Arc;

/// Application context holding the relay and request-level services
#[derive(Clone)]
pub struct AppContext {
    pub relay: Arc<Relay>,
    /// Admin API is disabled when unset
    pub admin_token: Option<AdminToken>,
    pub request_limiter: Arc<RequestRateLimiter>,
}

impl AppContext {
    pub fn new(relay: Arc<Relay>) -> Self {
        let service = &relay.config().service;
        let admin_token = service.admin_key.as_deref().map(AdminToken::new);
        let request_limiter = Arc::new(RequestRateLimiter::new(
            RequestRateLimitConfig::default(),
            relay.config().crawl.rate_limit_bypass.clone(),
        ));

        Self {
            relay,
            admin_token,
            request_limiter,
        }
    }

    pub fn with_request_limits(mut self, config: RequestRateLimitConfig) -> Self {
        let bypass = self.relay.config().crawl.rate_limit_bypass.clone();
        self.request_limiter = Arc::new(RequestRateLimiter::new(config, bypass));
        self
    }
}
