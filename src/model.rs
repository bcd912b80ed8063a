// src/model.rs

use serde::Deserialize;

/// The JWKS envelope as published at `jwks_uri`.
///
/// Keys are kept as raw JSON so that a single unsupported or malformed key
/// does not make the whole set unusable; each entry is parsed individually
/// into a [`jsonwebtoken::jwk::Jwk`] by the key store.
#[derive(Debug, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<serde_json::Value>,
}

/// Represents the data structure of an OIDC provider's discovery document.
/// Found at the `.well-known/openid-configuration` endpoint.
///
/// Only `jwks_uri` is consumed; the remaining metadata is kept so callers can
/// inspect it when debugging a misconfigured issuer.
#[derive(Debug, Deserialize)]
pub struct OidcDiscoveryDocument {
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl OidcDiscoveryDocument {
    /// The raw `jwks_uri` value, if present.
    pub fn jwks_uri(&self) -> Option<&serde_json::Value> {
        self.metadata.get("jwks_uri")
    }

    /// The `issuer` the document claims to describe, if present.
    pub fn issuer(&self) -> Option<&str> {
        self.metadata.get("issuer").and_then(|v| v.as_str())
    }
}
