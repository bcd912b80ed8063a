// src/error.rs

use jsonwebtoken::Algorithm;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while fetching a remote document (discovery or JWKS).
///
/// These are always wrapped by an [`AuthError`] that says *which* document
/// could not be obtained.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The HTTP request itself failed (DNS, connect, TLS, body read).
    #[error("HTTP request error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status code.
    #[error("unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The response body was not valid JSON for the expected document.
    #[error("invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),

    /// The document parsed but its content is unusable.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// The primary error type for the `nila-oidc-auth` library.
///
/// Setup-time variants (`DiscoveryFailed`, `JwksUriMissing`, `KeyFetchFailed`,
/// `InvalidConfiguration`) abort middleware construction. Every other variant
/// is a per-request classification and is turned into a uniform 401 response
/// by the middleware.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A configuration value is missing or invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The issuer's discovery document could not be fetched or parsed.
    #[error("OIDC discovery failed for {url}: {source}")]
    DiscoveryFailed {
        url: String,
        #[source]
        source: FetchError,
    },

    /// The issuer answered, but its discovery document has no `jwks_uri`.
    #[error("jwks_uri missing from oidc provider at {url}")]
    JwksUriMissing { url: String },

    /// The JWKS endpoint could not be fetched or parsed.
    #[error("JWKS fetch failed for {url}: {source}")]
    KeyFetchFailed {
        url: String,
        #[source]
        source: FetchError,
    },

    /// The token references a key ID that is absent, even after a refresh.
    #[error("Key not found for kid: {0}")]
    UnknownKey(String),

    /// The JWT header is missing the 'kid' (Key ID) field.
    #[error("The JWT header is missing the 'kid' (Key ID) field")]
    MissingKeyId,

    /// The token's declared algorithm differs from the one bound to its key.
    #[error("Algorithm mismatch: key expects {expected:?}, token declares {found:?}")]
    AlgorithmMismatch { expected: Algorithm, found: Algorithm },

    #[error("Token signature is invalid")]
    InvalidSignature,

    #[error("Token has expired")]
    Expired,

    #[error("Token is not yet valid")]
    NotYetValid,

    #[error("Token issuer is invalid")]
    InvalidIssuer,

    #[error("Token audience is invalid")]
    InvalidAudience,

    /// The token is not a structurally valid JWT (or lacks a required claim).
    #[error("Token is malformed: {0}")]
    MalformedToken(String),

    /// No credential was presented in any configured token location.
    #[error("missing or malformed jwt")]
    TokenMissing,

    /// Authentication could not be set up and the layer is configured to reject.
    #[error("Authentication is unavailable")]
    Unavailable,
}

/// A `Copy` classification of an [`AuthError`], suitable for metrics labels,
/// response extensions and test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorKind {
    InvalidConfiguration,
    DiscoveryFailed,
    JwksUriMissing,
    KeyFetchFailed,
    UnknownKey,
    MissingKeyId,
    AlgorithmMismatch,
    InvalidSignature,
    Expired,
    NotYetValid,
    InvalidIssuer,
    InvalidAudience,
    MalformedToken,
    TokenMissing,
    Unavailable,
}

impl AuthErrorKind {
    /// Stable, machine-readable code for this classification.
    pub fn error_code(self) -> &'static str {
        match self {
            AuthErrorKind::InvalidConfiguration => "invalid_configuration",
            AuthErrorKind::DiscoveryFailed => "discovery_failed",
            AuthErrorKind::JwksUriMissing => "jwks_uri_missing",
            AuthErrorKind::KeyFetchFailed => "key_fetch_failed",
            AuthErrorKind::UnknownKey => "unknown_key",
            AuthErrorKind::MissingKeyId => "missing_key_id",
            AuthErrorKind::AlgorithmMismatch => "algorithm_mismatch",
            AuthErrorKind::InvalidSignature => "invalid_signature",
            AuthErrorKind::Expired => "token_expired",
            AuthErrorKind::NotYetValid => "token_not_yet_valid",
            AuthErrorKind::InvalidIssuer => "invalid_issuer",
            AuthErrorKind::InvalidAudience => "invalid_audience",
            AuthErrorKind::MalformedToken => "malformed_token",
            AuthErrorKind::TokenMissing => "token_missing",
            AuthErrorKind::Unavailable => "auth_unavailable",
        }
    }
}

impl AuthError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::InvalidConfiguration(_) => AuthErrorKind::InvalidConfiguration,
            AuthError::DiscoveryFailed { .. } => AuthErrorKind::DiscoveryFailed,
            AuthError::JwksUriMissing { .. } => AuthErrorKind::JwksUriMissing,
            AuthError::KeyFetchFailed { .. } => AuthErrorKind::KeyFetchFailed,
            AuthError::UnknownKey(_) => AuthErrorKind::UnknownKey,
            AuthError::MissingKeyId => AuthErrorKind::MissingKeyId,
            AuthError::AlgorithmMismatch { .. } => AuthErrorKind::AlgorithmMismatch,
            AuthError::InvalidSignature => AuthErrorKind::InvalidSignature,
            AuthError::Expired => AuthErrorKind::Expired,
            AuthError::NotYetValid => AuthErrorKind::NotYetValid,
            AuthError::InvalidIssuer => AuthErrorKind::InvalidIssuer,
            AuthError::InvalidAudience => AuthErrorKind::InvalidAudience,
            AuthError::MalformedToken(_) => AuthErrorKind::MalformedToken,
            AuthError::TokenMissing => AuthErrorKind::TokenMissing,
            AuthError::Unavailable => AuthErrorKind::Unavailable,
        }
    }

    /// Stable, machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        self.kind().error_code()
    }

    /// Whether this error can only occur while building the middleware.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self.kind(),
            AuthErrorKind::InvalidConfiguration
                | AuthErrorKind::DiscoveryFailed
                | AuthErrorKind::JwksUriMissing
                | AuthErrorKind::KeyFetchFailed
        )
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::ImmatureSignature => AuthError::NotYetValid,
            ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
            ErrorKind::InvalidAudience => AuthError::InvalidAudience,
            // A key that cannot verify this token's algorithm family.
            ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey => AuthError::InvalidSignature,
            _ => AuthError::MalformedToken(e.to_string()),
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AuthError {
    fn into_response(self) -> axum::response::Response {
        crate::middleware::rejection_response(&self)
    }
}
