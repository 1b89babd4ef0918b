/// Admin authentication
use crate::{context::AppContext, error::RelayError};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use sha2::{Digest, Sha256};

/// Bearer token from the Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// The configured admin key, kept only as its SHA-256 digest
#[derive(Clone)]
pub struct AdminToken {
    digest: [u8; 32],
}

impl AdminToken {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    /// Compare digests without short-circuiting on the first differing byte
    pub fn verify(&self, presented: &str) -> bool {
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        self.digest
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminToken(..)")
    }
}

/// Extractor guarding admin routes
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppContext> for AdminAuth {
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppContext) -> Result<Self, Self::Rejection> {
        let expected = state
            .admin_token
            .as_ref()
            .ok_or_else(|| RelayError::NotFound("admin API is disabled".to_string()))?;

        let token = extract_bearer_token(&parts.headers)
            .ok_or_else(|| RelayError::Authentication("Missing authorization header".to_string()))?;

        if !expected.verify(token) {
            tracing::warn!("Rejected admin request with invalid token");
            return Err(RelayError::Authentication("Invalid admin token".to_string()));
        }
        Ok(AdminAuth)
    }
}
