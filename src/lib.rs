// src/lib.rs

//! JWT bearer authentication for tower services, backed by OIDC discovery
//! and a cached, self-refreshing JWKS.
//!
//! ```rust,ignore
//! let auth = JwtAuth::new(AuthConfig::new("https://idp.example/", "myapp"), Vec::new()).await;
//! let app = Router::new()
//!     .route("/me", get(|actor: Actor| async move { actor.subject().to_string() }))
//!     .layer(JwtAuthLayer::from_setup(auth, OnSetupFailure::PassThrough));
//! ```

pub mod actor;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod jwks;
pub mod middleware;
pub mod model;
pub mod token;
pub mod validator;

/// The public prelude for the `nila-oidc-auth` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::actor::Actor;
    pub use crate::config::{
        with_clock, with_key_fetch_options, with_span, with_validation_options, AuthConfig, AuthOption,
        KeyFetchOptions, ValidationOptions,
    };
    pub use crate::error::{AuthError, AuthErrorKind};
    pub use crate::jwks::{KeyLookup, KeySet, KeyStore, VerificationKey};
    pub use crate::middleware::{AuthRejection, JwtAuth, JwtAuthLayer, OnSetupFailure};
    pub use crate::token::{TokenLookup, TokenSource};
    pub use crate::validator::{Claims, Clock, Validator};
    pub use jsonwebtoken::Algorithm;
}
