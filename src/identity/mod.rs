/// Identity Resolution System
///
/// DID document resolution dispatched by DID method, handle resolution,
/// and the bounded time-limited caches in front of both.

pub mod cache;
pub mod handle;
pub mod resolver;

pub use cache::{CachingDidResolver, IdentityCacheConfig};
pub use handle::{
    bypass_modifier, HandleResolver, ProdHandleResolver, TrialHandleResolver, RATE_LIMIT_BYPASS_HEADER,
};
pub use resolver::{identity_http_client, DidResolver, MultiResolver, PlcResolver, WebResolver};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The identity does not exist (permanent)
    #[error("identity not found: {0}")]
    NotFound(String),

    /// Registry unreachable or erroring; worth retrying
    #[error("temporary resolution failure: {0}")]
    Temporary(String),

    /// No resolver registered for the DID method
    #[error("unsupported DID method: {0}")]
    UnsupportedMethod(String),

    /// Identifier or document could not be parsed
    #[error("malformed identity: {0}")]
    Malformed(String),
}

impl IdentityError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, IdentityError::Temporary(_))
    }
}

/// DID document (only the fields the relay reads)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default)]
    pub service: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub controller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub service_endpoint: String,
}

impl DidDocument {
    /// Endpoint of the `#atproto_pds` service entry
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|s| {
                s.id == "#atproto_pds"
                    || s.id == format!("{}#atproto_pds", self.id)
                    || s.kind == "AtprotoPersonalDataServer"
            })
            .map(|s| s.service_endpoint.as_str())
    }

    /// Normalized host (with non-default port) of the PDS endpoint
    pub fn pds_host(&self) -> Option<String> {
        let url = reqwest::Url::parse(self.pds_endpoint()?).ok()?;
        let host = url.host_str()?.to_lowercase();
        Some(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        })
    }

    /// Handle claimed through `at://` in alsoKnownAs
    pub fn handle(&self) -> Option<&str> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
    }
}

/// Method segment of a DID (`plc` for `did:plc:...`)
pub fn did_method(did: &str) -> Result<&str, IdentityError> {
    let mut parts = did.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("did"), Some(method), Some(id)) if !method.is_empty() && !id.is_empty() => {
            Ok(method)
        }
        _ => Err(IdentityError::Malformed(did.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(endpoint: &str) -> DidDocument {
        serde_json::from_value(serde_json::json!({
            "@context": ["https://www.w3.org/ns/did/v1"],
            "id": "did:plc:ewvi7nxzyoun6zhxrhs64oiz",
            "alsoKnownAs": ["at://alice.example.com"],
            "verificationMethod": [{
                "id": "did:plc:ewvi7nxzyoun6zhxrhs64oiz#atproto",
                "type": "Multikey",
                "controller": "did:plc:ewvi7nxzyoun6zhxrhs64oiz",
                "publicKeyMultibase": "zQ3shXjHeiBuRCKmM36cuYnm7YEMzhGnCmCyW92sRJ9pribSF"
            }],
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": endpoint
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_pds_host_normalized() {
        assert_eq!(
            doc("https://PDS.Example.com/").pds_host().as_deref(),
            Some("pds.example.com")
        );
        assert_eq!(
            doc("http://localhost:2583").pds_host().as_deref(),
            Some("localhost:2583")
        );
    }

    #[test]
    fn test_handle_from_also_known_as() {
        assert_eq!(doc("https://pds.example.com").handle(), Some("alice.example.com"));
    }

    #[test]
    fn test_did_method() {
        assert_eq!(did_method("did:plc:abc").unwrap(), "plc");
        assert_eq!(did_method("did:web:example.com").unwrap(), "web");
        assert!(did_method("did:plc").is_err());
        assert!(did_method("at://did:plc:abc").is_err());
    }
}
