// src/discovery.rs

use crate::error::{AuthError, FetchError};
use crate::fetch::{self, HttpFetch};
use crate::model::OidcDiscoveryDocument;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Builds `<issuer>/.well-known/openid-configuration`.
///
/// The well-known segments are appended to the issuer's path rather than
/// resolved against it, so `https://idp.example/realms/a` and
/// `https://idp.example/realms/a/` yield the same URL.
pub fn discovery_url(issuer: &str) -> Result<Url, AuthError> {
    let mut url = Url::parse(issuer)
        .map_err(|e| AuthError::InvalidConfiguration(format!("invalid issuer URL '{}': {}", issuer, e)))?;

    url.path_segments_mut()
        .map_err(|_| AuthError::InvalidConfiguration(format!("issuer URL '{}' cannot be a base", issuer)))?
        .pop_if_empty()
        .extend([".well-known", "openid-configuration"]);

    Ok(url)
}

/// Resolves the issuer's JWKS endpoint via OIDC discovery.
///
/// Issues a single GET bounded by `timeout`. There is no retry and no caching
/// here; discovery runs once while the middleware is being set up.
///
/// # Errors
///
/// * [`AuthError::DiscoveryFailed`] if the document is unreachable or is not a JSON object.
/// * [`AuthError::JwksUriMissing`] if the document has no `jwks_uri` field, or it is `null`.
#[instrument(skip(fetcher), err)]
pub async fn resolve(
    fetcher: &dyn HttpFetch,
    issuer: &str,
    timeout: Duration,
) -> Result<Url, AuthError> {
    if issuer.is_empty() {
        return Err(AuthError::InvalidConfiguration("issuer must not be empty".to_string()));
    }

    let url = discovery_url(issuer)?;
    debug!("Performing OIDC discovery at: {}", url);

    let failed = |source: FetchError| AuthError::DiscoveryFailed {
        url: url.to_string(),
        source,
    };

    let document = fetch::with_timeout(timeout, fetcher.get(&url, timeout))
        .await
        .map_err(failed)?;

    let discovery_doc: OidcDiscoveryDocument =
        serde_json::from_slice(&document.body).map_err(|e| failed(e.into()))?;

    if let Some(published) = discovery_doc.issuer() {
        if published.trim_end_matches('/') != issuer.trim_end_matches('/') {
            debug!("Discovery document issuer '{}' differs from configured '{}'", published, issuer);
        }
    }

    // A null `jwks_uri` is treated the same as an absent one.
    let raw = discovery_doc.jwks_uri().filter(|v| !v.is_null()).ok_or_else(|| AuthError::JwksUriMissing {
        url: url.to_string(),
    })?;

    let jwks_uri = raw
        .as_str()
        .ok_or_else(|| failed(FetchError::InvalidDocument("jwks_uri is not a string".to_string())))?;

    let jwks_uri = Url::parse(jwks_uri)
        .map_err(|e| failed(FetchError::InvalidDocument(format!("invalid jwks_uri '{}': {}", jwks_uri, e))))?;

    debug!("Discovered JWKS URI: {}", jwks_uri);
    Ok(jwks_uri)
}
