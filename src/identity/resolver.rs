/// DID resolvers and the per-method dispatch table
use crate::{
    error::{RelayError, RelayResult},
    identity::{did_method, DidDocument, IdentityError},
    metrics,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// User-Agent header for identity lookups
const USER_AGENT: &str = concat!("aurora-relay/", env!("CARGO_PKG_VERSION"));

/// Anything that can turn a DID into its document
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve_did(&self, did: &str) -> Result<DidDocument, IdentityError>;
}

/// Build the HTTP client shared by the registry resolvers
pub fn identity_http_client() -> RelayResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Resolves did:plc identities against a PLC directory
pub struct PlcResolver {
    host: String,
    http: reqwest::Client,
}

impl PlcResolver {
    pub fn new(host: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl DidResolver for PlcResolver {
    async fn resolve_did(&self, did: &str) -> Result<DidDocument, IdentityError> {
        let url = format!("{}/{}", self.host, did);
        let result = fetch_document(&self.http, &url, did).await;
        record_resolution("plc", &result);
        result
    }
}

/// Resolves did:web identities from the domain's well-known document
pub struct WebResolver {
    insecure: bool,
    http: reqwest::Client,
}

impl WebResolver {
    pub fn new(insecure: bool, http: reqwest::Client) -> Self {
        Self { insecure, http }
    }

    /// Document URL for a did:web identifier
    ///
    /// did:web:example.com -> https://example.com/.well-known/did.json
    /// did:web:example.com:user:alice -> https://example.com/user/alice/did.json
    pub fn document_url(&self, did: &str) -> Result<String, IdentityError> {
        let suffix = did
            .strip_prefix("did:web:")
            .ok_or_else(|| IdentityError::Malformed(did.to_string()))?;

        let parts: Vec<&str> = suffix.split(':').collect();
        let domain = parts
            .first()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| IdentityError::Malformed(did.to_string()))?
            .replace("%3A", ":")
            .replace("%3a", ":");

        let scheme = if self.insecure { "http" } else { "https" };
        Ok(if parts.len() == 1 {
            format!("{}://{}/.well-known/did.json", scheme, domain)
        } else {
            format!("{}://{}/{}/did.json", scheme, domain, parts[1..].join("/"))
        })
    }
}

#[async_trait]
impl DidResolver for WebResolver {
    async fn resolve_did(&self, did: &str) -> Result<DidDocument, IdentityError> {
        let url = self.document_url(did)?;
        let result = fetch_document(&self.http, &url, did).await;
        record_resolution("web", &result);
        result
    }
}

/// Fetch and classify a DID document response
async fn fetch_document(
    http: &reqwest::Client,
    url: &str,
    did: &str,
) -> Result<DidDocument, IdentityError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| IdentityError::Temporary(format!("{}: {}", did, e)))?;

    match response.status() {
        status if status.is_success() => {}
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            return Err(IdentityError::NotFound(did.to_string()))
        }
        status => {
            return Err(IdentityError::Temporary(format!(
                "{}: registry returned {}",
                did, status
            )))
        }
    }

    let doc: DidDocument = response
        .json()
        .await
        .map_err(|e| IdentityError::Malformed(format!("{}: {}", did, e)))?;

    if doc.id != did {
        return Err(IdentityError::Malformed(format!(
            "document id {} does not match {}",
            doc.id, did
        )));
    }

    Ok(doc)
}

fn record_resolution(method: &str, result: &Result<DidDocument, IdentityError>) {
    let status = match result {
        Ok(_) => "success",
        Err(IdentityError::NotFound(_)) => "not_found",
        Err(IdentityError::Temporary(_)) => "temporary",
        Err(_) => "invalid",
    };
    metrics::record_identity_resolution(method, status);
}

/// Dispatches DID resolution by method
///
/// New methods are supported by registering a handler; nothing else changes.
#[derive(Default, Clone)]
pub struct MultiResolver {
    handlers: HashMap<String, Arc<dyn DidResolver>>,
}

impl MultiResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the resolver for a DID method (`plc`, `web`, ...)
    pub fn add_handler(&mut self, method: impl Into<String>, resolver: Arc<dyn DidResolver>) {
        self.handlers.insert(method.into(), resolver);
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}

#[async_trait]
impl DidResolver for MultiResolver {
    async fn resolve_did(&self, did: &str) -> Result<DidDocument, IdentityError> {
        let method = did_method(did)?;
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| IdentityError::UnsupportedMethod(method.to_string()))?;
        handler.resolve_did(did).await
    }
}
