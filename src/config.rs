// src/config.rs

use crate::error::AuthError;
use crate::fetch::HttpFetch;
use crate::jwks::VerificationKey;
use crate::token::TokenLookup;
use crate::validator::{Clock, SystemClock};
use http::request::Parts;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// Default timeout for discovery and JWKS requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Decides, per request, whether authentication is bypassed entirely.
pub type Skipper = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

/// Options controlling how the signing keys are fetched and refreshed.
#[derive(Clone)]
pub struct KeyFetchOptions {
    /// Fixed interval for background refreshes. When `None`, the JWKS
    /// response's `Cache-Control: max-age` drives refreshes instead (if
    /// `respect_cache_control` is set), and otherwise there is no background refresh.
    pub refresh_interval: Option<Duration>,
    /// Perform one synchronous refresh when a token names an unknown `kid`.
    pub refresh_unknown_kid: bool,
    /// Minimum spacing between unknown-`kid` refreshes.
    pub refresh_rate_limit: Option<Duration>,
    /// Bound on every discovery and JWKS request.
    pub request_timeout: Duration,
    /// Whether `Cache-Control: max-age` may schedule background refreshes.
    pub respect_cache_control: bool,
    /// The HTTP capability to use. Defaults to a `reqwest::Client`.
    pub fetcher: Option<Arc<dyn HttpFetch>>,
    /// Explicit `kid` -> key map. When set, discovery and JWKS fetching are
    /// skipped entirely.
    pub static_keys: Option<HashMap<String, VerificationKey>>,
}

impl Default for KeyFetchOptions {
    fn default() -> Self {
        Self {
            refresh_interval: None,
            refresh_unknown_kid: true,
            refresh_rate_limit: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            respect_cache_control: true,
            fetcher: None,
            static_keys: None,
        }
    }
}

impl KeyFetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn with_refresh_unknown_kid(mut self, enabled: bool) -> Self {
        self.refresh_unknown_kid = enabled;
        self
    }

    pub fn with_refresh_rate_limit(mut self, limit: Duration) -> Self {
        self.refresh_rate_limit = Some(limit);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_cache_control(mut self, respect: bool) -> Self {
        self.respect_cache_control = respect;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn HttpFetch>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_static_keys(mut self, keys: HashMap<String, VerificationKey>) -> Self {
        self.static_keys = Some(keys);
        self
    }
}

impl fmt::Debug for KeyFetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFetchOptions")
            .field("refresh_interval", &self.refresh_interval)
            .field("refresh_unknown_kid", &self.refresh_unknown_kid)
            .field("refresh_rate_limit", &self.refresh_rate_limit)
            .field("request_timeout", &self.request_timeout)
            .field("respect_cache_control", &self.respect_cache_control)
            .field("custom_fetcher", &self.fetcher.is_some())
            .field("static_keys", &self.static_keys.as_ref().map(HashMap::len))
            .finish()
    }
}

/// Per-request validation settings.
#[derive(Clone, Default)]
pub struct ValidationOptions {
    /// Requests matching this predicate bypass authentication.
    pub skipper: Option<Skipper>,
    /// Where to look for the token.
    pub token_lookup: TokenLookup,
    /// The tolerance for clock skew when validating `exp` and `nbf`.
    /// Defaults to zero.
    pub leeway: Duration,
}

impl ValidationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skipper<F>(mut self, skipper: F) -> Self
    where
        F: Fn(&Parts) -> bool + Send + Sync + 'static,
    {
        self.skipper = Some(Arc::new(skipper));
        self
    }

    pub fn with_token_lookup(mut self, lookup: TokenLookup) -> Self {
        self.token_lookup = lookup;
        self
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }
}

impl fmt::Debug for ValidationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationOptions")
            .field("skipper", &self.skipper.is_some())
            .field("token_lookup", &self.token_lookup)
            .field("leeway", &self.leeway)
            .finish()
    }
}

/// The base configuration for the auth middleware.
///
/// `issuer` and `audience` are typically loaded from a config file. The
/// remaining fields are the all-in-one form of settings that can also be
/// supplied as [`AuthOption`]s; when both are given, the option wins.
#[derive(Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// The issuer URL of the OIDC provider. Used for discovery and to
    /// validate the `iss` claim.
    pub issuer: String,
    /// The audience every accepted token must carry in its `aud` claim.
    pub audience: String,
    /// Key fetch options. Superseded by [`with_key_fetch_options`].
    #[serde(skip)]
    pub key_fetch: Option<KeyFetchOptions>,
    /// Validation options. Superseded by [`with_validation_options`].
    #[serde(skip)]
    pub validation: Option<ValidationOptions>,
    /// Span under which the middleware logs. Superseded by [`with_span`].
    #[serde(skip)]
    pub span: Option<Span>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("key_fetch", &self.key_fetch)
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            ..Self::default()
        }
    }
}

/// Settings collected from the ordered [`AuthOption`]s.
#[derive(Default)]
pub struct Overrides {
    key_fetch: Option<KeyFetchOptions>,
    validation: Option<ValidationOptions>,
    span: Option<Span>,
    clock: Option<Arc<dyn Clock>>,
}

/// An override applied over an [`AuthConfig`]. Options run in order, so a
/// later option replaces an earlier one for the same setting.
pub type AuthOption = Box<dyn FnOnce(&mut Overrides) + Send>;

/// Sets the key fetch options, taking precedence over `AuthConfig::key_fetch`.
pub fn with_key_fetch_options(options: KeyFetchOptions) -> AuthOption {
    Box::new(move |o| o.key_fetch = Some(options))
}

/// Sets the validation options, taking precedence over `AuthConfig::validation`.
pub fn with_validation_options(options: ValidationOptions) -> AuthOption {
    Box::new(move |o| o.validation = Some(options))
}

/// Sets the span the middleware logs under, taking precedence over `AuthConfig::span`.
pub fn with_span(span: Span) -> AuthOption {
    Box::new(move |o| o.span = Some(span))
}

/// Sets the wall-clock source used for `exp`/`nbf` checks.
pub fn with_clock(clock: Arc<dyn Clock>) -> AuthOption {
    Box::new(move |o| o.clock = Some(clock))
}

/// The resolved, immutable configuration of a middleware instance.
#[derive(Clone)]
pub struct Settings {
    pub issuer: String,
    pub audience: String,
    pub key_fetch: KeyFetchOptions,
    pub validation: ValidationOptions,
    pub span: Span,
    pub clock: Arc<dyn Clock>,
}

impl Settings {
    /// Applies `options` in order over `config` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if `issuer` or `audience` is empty.
    pub fn resolve<I>(config: AuthConfig, options: I) -> Result<Self, AuthError>
    where
        I: IntoIterator<Item = AuthOption>,
    {
        let mut overrides = Overrides::default();
        for option in options {
            option(&mut overrides);
        }

        if config.issuer.is_empty() {
            return Err(AuthError::InvalidConfiguration("issuer must not be empty".to_string()));
        }
        if config.audience.is_empty() {
            return Err(AuthError::InvalidConfiguration("audience must not be empty".to_string()));
        }

        let span = overrides
            .span
            .or(config.span)
            .unwrap_or_else(|| tracing::info_span!("jwt_auth", issuer = %config.issuer));

        Ok(Self {
            key_fetch: overrides.key_fetch.or(config.key_fetch).unwrap_or_default(),
            validation: overrides.validation.or(config.validation).unwrap_or_default(),
            clock: overrides.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            span,
            issuer: config.issuer,
            audience: config.audience,
        })
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("key_fetch", &self.key_fetch)
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AuthConfig {
        AuthConfig::new("https://idp.example/", "myapp")
    }

    #[test]
    fn defaults_apply_without_config_or_options() {
        let settings = Settings::resolve(base(), Vec::new()).unwrap();
        assert!(settings.key_fetch.refresh_unknown_kid);
        assert_eq!(settings.key_fetch.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(settings.validation.leeway, Duration::ZERO);
    }

    #[test]
    fn legacy_fields_are_used_when_no_option_is_given() {
        let mut config = base();
        config.key_fetch = Some(KeyFetchOptions::new().with_refresh_unknown_kid(false));
        let settings = Settings::resolve(config, Vec::new()).unwrap();
        assert!(!settings.key_fetch.refresh_unknown_kid);
    }

    #[test]
    fn options_win_over_legacy_fields() {
        let mut config = base();
        config.key_fetch = Some(KeyFetchOptions::new().with_refresh_unknown_kid(false));
        config.validation = Some(ValidationOptions::new().with_leeway(Duration::from_secs(5)));

        let settings = Settings::resolve(
            config,
            vec![
                with_key_fetch_options(KeyFetchOptions::new().with_refresh_interval(Duration::from_secs(30))),
                with_validation_options(ValidationOptions::new().with_leeway(Duration::from_secs(1))),
            ],
        )
        .unwrap();

        // The option replaces the legacy struct wholesale.
        assert!(settings.key_fetch.refresh_unknown_kid);
        assert_eq!(settings.key_fetch.refresh_interval, Some(Duration::from_secs(30)));
        assert_eq!(settings.validation.leeway, Duration::from_secs(1));
    }

    #[test]
    fn later_options_win() {
        let settings = Settings::resolve(
            base(),
            vec![
                with_validation_options(ValidationOptions::new().with_leeway(Duration::from_secs(1))),
                with_validation_options(ValidationOptions::new().with_leeway(Duration::from_secs(2))),
            ],
        )
        .unwrap();
        assert_eq!(settings.validation.leeway, Duration::from_secs(2));
    }

    #[test]
    fn span_option_beats_config_beats_default() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let name = |settings: &Settings| -> Option<&'static str> { settings.span.metadata().map(|m| m.name()) };

            let settings = Settings::resolve(base(), Vec::new()).unwrap();
            assert_eq!(name(&settings), Some("jwt_auth"));

            let mut config = base();
            config.span = Some(tracing::info_span!("from_config"));
            let settings = Settings::resolve(config.clone(), Vec::new()).unwrap();
            assert_eq!(name(&settings), Some("from_config"));

            let settings = Settings::resolve(config, vec![with_span(tracing::info_span!("from_option"))]).unwrap();
            assert_eq!(name(&settings), Some("from_option"));
        });
    }

    #[test]
    fn issuer_and_audience_are_required() {
        let err = Settings::resolve(AuthConfig::new("", "myapp"), Vec::new()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidConfiguration(_)));
        let err = Settings::resolve(AuthConfig::new("https://idp.example/", ""), Vec::new()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidConfiguration(_)));
    }

    #[test]
    fn config_deserializes_issuer_and_audience() {
        let config: AuthConfig =
            serde_json::from_str(r#"{"issuer":"https://idp.example/","audience":"myapp"}"#).unwrap();
        assert_eq!(config.issuer, "https://idp.example/");
        assert_eq!(config.audience, "myapp");
        assert!(config.key_fetch.is_none());
    }
}
