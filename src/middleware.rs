// src/middleware.rs

use crate::actor::Actor;
use crate::config::{AuthConfig, AuthOption, KeyFetchOptions, Settings};
use crate::discovery;
use crate::error::{AuthError, AuthErrorKind};
use crate::fetch::{self, HttpFetch};
use crate::jwks::KeyStore;
use crate::validator::Validator;
use http::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, error, info, warn, Instrument};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An initialized authenticator: resolved settings, a live key store and a validator.
///
/// Cheap to clone; all clones share the same key store.
#[derive(Clone)]
pub struct JwtAuth {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    validator: Validator,
    keys: KeyStore,
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth")
            .field("settings", &self.inner.settings)
            .field("jwks_url", &self.inner.keys.jwks_url())
            .finish()
    }
}

impl JwtAuth {
    /// Resolves the configuration, discovers the issuer's JWKS endpoint and
    /// performs the initial key fetch.
    ///
    /// With static keys configured, neither discovery nor any other network
    /// access happens.
    ///
    /// # Errors
    ///
    /// Any setup failure is returned as-is (and logged at `error`); what to do
    /// about it is the caller's decision, see [`JwtAuthLayer::from_setup`].
    pub async fn new<I>(config: AuthConfig, options: I) -> Result<Self, AuthError>
    where
        I: IntoIterator<Item = AuthOption>,
    {
        let settings = Settings::resolve(config, options)?;
        let span = settings.span.clone();

        Self::setup(settings)
            .instrument(span)
            .await
            .inspect_err(|e| error!(error = %e, code = e.error_code(), "JWT authentication setup failed"))
    }

    async fn setup(settings: Settings) -> Result<Self, AuthError> {
        let keys = match &settings.key_fetch.static_keys {
            Some(static_keys) => {
                info!("Using {} static verification keys, skipping discovery", static_keys.len());
                KeyStore::from_keys(static_keys.clone())
            }
            None => {
                let timeout = settings.key_fetch.request_timeout;
                let fetcher: Arc<dyn HttpFetch> = match &settings.key_fetch.fetcher {
                    Some(fetcher) => fetcher.clone(),
                    None => Arc::new(fetch::default_client(timeout).map_err(|source| {
                        AuthError::DiscoveryFailed {
                            url: settings.issuer.clone(),
                            source,
                        }
                    })?),
                };

                let jwks_url = discovery::resolve(fetcher.as_ref(), &settings.issuer, timeout).await?;

                // Discovery and the key store share one client.
                let key_fetch = KeyFetchOptions {
                    fetcher: Some(fetcher),
                    ..settings.key_fetch.clone()
                };
                KeyStore::initialize(jwks_url, &key_fetch).await?
            }
        };

        let validator =
            Validator::new(&settings.issuer, &settings.audience).with_leeway(settings.validation.leeway);

        info!("JWT authentication ready for audience '{}'", settings.audience);
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                validator,
                keys,
            }),
        })
    }

    /// Extracts the token from the request and validates it.
    ///
    /// The skip predicate is not consulted here; this is the operation the
    /// middleware runs for every request it does not skip.
    pub async fn authenticate(&self, parts: &Parts) -> Result<Actor, AuthError> {
        let token = self
            .inner
            .settings
            .validation
            .token_lookup
            .extract(parts)
            .ok_or(AuthError::TokenMissing)?;

        let now = self.inner.settings.clock.now();
        self.inner.validator.validate(&token, &self.inner.keys, now).await
    }

    /// Whether the configured skip predicate exempts this request.
    pub fn skips(&self, parts: &Parts) -> bool {
        self.inner
            .settings
            .validation
            .skipper
            .as_ref()
            .is_some_and(|skipper| skipper(parts))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.inner.keys
    }

    /// A tower layer enforcing authentication with this authenticator.
    pub fn layer(&self) -> JwtAuthLayer {
        JwtAuthLayer::new(self.clone())
    }
}

/// What the layer does when [`JwtAuth::new`] failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnSetupFailure {
    /// Forward every request unauthenticated. Keeps an already-deployed
    /// service reachable while its identity provider is misconfigured.
    #[default]
    PassThrough,
    /// Answer every request with `503 Service Unavailable`.
    Reject,
}

#[derive(Clone)]
enum Mode {
    Active(JwtAuth),
    PassThrough,
    Reject,
}

/// Tower [`Layer`] that authenticates requests with a bearer JWT.
#[derive(Clone)]
pub struct JwtAuthLayer {
    mode: Mode,
}

impl fmt::Debug for JwtAuthLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.mode {
            Mode::Active(_) => "active",
            Mode::PassThrough => "pass-through",
            Mode::Reject => "reject",
        };
        f.debug_struct("JwtAuthLayer").field("mode", &mode).finish()
    }
}

impl JwtAuthLayer {
    pub fn new(auth: JwtAuth) -> Self {
        Self {
            mode: Mode::Active(auth),
        }
    }

    /// A layer that forwards every request without authenticating it.
    pub fn pass_through() -> Self {
        Self {
            mode: Mode::PassThrough,
        }
    }

    /// Builds the layer from the outcome of [`JwtAuth::new`].
    ///
    /// On failure the layer degrades according to `policy`. The default,
    /// [`OnSetupFailure::PassThrough`], leaves routes unauthenticated; it is
    /// logged at `error` so the condition is visible to operators.
    pub fn from_setup(result: Result<JwtAuth, AuthError>, policy: OnSetupFailure) -> Self {
        match result {
            Ok(auth) => Self::new(auth),
            Err(e) => match policy {
                OnSetupFailure::PassThrough => {
                    error!(error = %e, "JWT authentication disabled, requests will pass through unauthenticated");
                    Self::pass_through()
                }
                OnSetupFailure::Reject => {
                    error!(error = %e, "JWT authentication unavailable, all requests will be rejected");
                    Self {
                        mode: Mode::Reject,
                    }
                }
            },
        }
    }

    /// Whether requests are actually authenticated by this layer.
    pub fn is_active(&self) -> bool {
        matches!(self.mode, Mode::Active(_))
    }
}

impl<S> Layer<S> for JwtAuthLayer {
    type Service = JwtAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwtAuthService {
            inner,
            mode: self.mode.clone(),
        }
    }
}

/// The service produced by [`JwtAuthLayer`].
///
/// On success the [`Actor`] is inserted into the request extensions and is
/// also available through [`Actor::current`] while the inner service runs.
#[derive(Clone)]
pub struct JwtAuthService<S> {
    inner: S,
    mode: Mode,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for JwtAuthService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let auth = match &self.mode {
            Mode::Active(auth) => auth.clone(),
            Mode::PassThrough => return Box::pin(inner.call(req)),
            Mode::Reject => {
                warn!(path = req.uri().path(), "Rejecting request, authentication is unavailable");
                return Box::pin(async { Ok(rejection_response(&AuthError::Unavailable)) });
            }
        };

        let span = auth.settings().span.clone();
        Box::pin(
            async move {
                let (mut parts, body) = req.into_parts();

                if auth.skips(&parts) {
                    debug!(path = parts.uri.path(), "Authentication skipped");
                    return inner.call(Request::from_parts(parts, body)).await;
                }

                match auth.authenticate(&parts).await {
                    Ok(actor) => {
                        debug!(subject = actor.subject(), path = parts.uri.path(), "Request authenticated");
                        parts.extensions.insert(actor.clone());
                        actor.scope(inner.call(Request::from_parts(parts, body))).await
                    }
                    Err(e) => {
                        info!(
                            code = e.error_code(),
                            error = %e,
                            method = %parts.method,
                            path = parts.uri.path(),
                            "Request rejected"
                        );
                        Ok(rejection_response(&e))
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Attached to the extensions of every response the middleware rejects,
/// carrying the classified cause that the response body deliberately omits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRejection {
    pub kind: AuthErrorKind,
}

/// The client-visible response for a rejected request.
///
/// Every authentication failure yields the same `401` (apart from a missing
/// token, which says so); the specific cause only appears in the logs and in
/// the [`AuthRejection`] extension.
pub fn rejection_response<B: From<String>>(error: &AuthError) -> Response<B> {
    let (status, message) = match error {
        AuthError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "authentication unavailable"),
        AuthError::TokenMissing => (StatusCode::UNAUTHORIZED, "missing or malformed jwt"),
        _ => (StatusCode::UNAUTHORIZED, "invalid or expired jwt"),
    };
    let code = if status == StatusCode::UNAUTHORIZED {
        "invalid_token"
    } else {
        error.error_code()
    };

    let body = serde_json::json!({ "error": code, "message": message }).to_string();
    let mut response = Response::new(B::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static(r#"Bearer error="invalid_token""#));
    }
    response.extensions_mut().insert(AuthRejection { kind: error.kind() });
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{with_clock, with_key_fetch_options, with_validation_options, ValidationOptions};
    use crate::jwks::VerificationKey;
    use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
    use std::collections::HashMap;
    use std::convert::Infallible;
    use tower::ServiceExt;

    const SECRET: &[u8] = b"middleware-secret";
    const NOW: i64 = 1_700_000_000;

    fn token(sub: &str, aud: &str) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("static".to_string());
        let claims = serde_json::json!({
            "sub": sub,
            "iss": "https://idp.example/",
            "aud": aud,
            "exp": NOW + 60,
        });
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    async fn auth(validation: ValidationOptions) -> JwtAuth {
        let mut keys = HashMap::new();
        keys.insert(
            "static".to_string(),
            VerificationKey::new(Algorithm::HS256, DecodingKey::from_secret(SECRET)),
        );
        JwtAuth::new(
            AuthConfig::new("https://idp.example/", "myapp"),
            vec![
                with_key_fetch_options(KeyFetchOptions::new().with_static_keys(keys)),
                with_validation_options(validation),
                with_clock(Arc::new(|| NOW)),
            ],
        )
        .await
        .unwrap()
    }

    async fn call(layer: JwtAuthLayer, req: Request<String>) -> Response<String> {
        let svc = layer.layer(tower::service_fn(|req: Request<String>| async move {
            let from_ext = req.extensions().get::<Actor>().map(|a| a.subject().to_string());
            let from_task = Actor::current().map(|a| a.subject().to_string());
            assert_eq!(from_ext, from_task);
            Ok::<_, Infallible>(Response::new(from_ext.unwrap_or_else(|| "anonymous".to_string())))
        }));
        svc.oneshot(req).await.unwrap()
    }

    fn rejection(res: &Response<String>) -> Option<AuthErrorKind> {
        res.extensions().get::<AuthRejection>().map(|r| r.kind)
    }

    #[tokio::test]
    async fn valid_token_reaches_handler_with_actor() {
        let layer = auth(ValidationOptions::new()).await.layer();
        let req = Request::get("/")
            .header("Authorization", format!("Bearer {}", token("alice", "myapp")))
            .body(String::new())
            .unwrap();

        let res = call(layer, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "alice");
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let layer = auth(ValidationOptions::new()).await.layer();
        let res = call(layer, Request::get("/").body(String::new()).unwrap()).await;

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(rejection(&res), Some(AuthErrorKind::TokenMissing));
        assert_eq!(
            res.headers().get(WWW_AUTHENTICATE).unwrap(),
            r#"Bearer error="invalid_token""#
        );
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected_with_uniform_body() {
        let layer = auth(ValidationOptions::new()).await.layer();
        let req = Request::get("/")
            .header("Authorization", format!("Bearer {}", token("alice", "other-app")))
            .body(String::new())
            .unwrap();

        let res = call(layer, req).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(rejection(&res), Some(AuthErrorKind::InvalidAudience));
        let body: serde_json::Value = serde_json::from_str(res.body()).unwrap();
        assert_eq!(body["error"], "invalid_token");
        assert!(!res.body().contains("audience"));
    }

    #[tokio::test]
    async fn skipper_bypasses_validation() {
        let validation = ValidationOptions::new().with_skipper(|parts: &Parts| parts.uri.path() == "/healthz");
        let layer = auth(validation).await.layer();

        let res = call(layer.clone(), Request::get("/healthz").body(String::new()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "anonymous");

        let res = call(layer, Request::get("/private").body(String::new()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn setup_failure_policies() {
        let failed = || Err(AuthError::JwksUriMissing { url: "https://idp.example/".into() });

        let layer = JwtAuthLayer::from_setup(failed(), OnSetupFailure::default());
        assert!(!layer.is_active());
        let res = call(layer, Request::get("/").body(String::new()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "anonymous");

        let layer = JwtAuthLayer::from_setup(failed(), OnSetupFailure::Reject);
        let res = call(layer, Request::get("/").body(String::new()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(rejection(&res), Some(AuthErrorKind::Unavailable));
    }

    #[tokio::test]
    async fn authenticate_without_tower() {
        let auth = auth(ValidationOptions::new()).await;
        let (parts, _) = Request::get("/")
            .header("Authorization", format!("Bearer {}", token("bob", "myapp")))
            .body(())
            .unwrap()
            .into_parts();

        let actor = auth.authenticate(&parts).await.unwrap();
        assert_eq!(actor.subject(), "bob");
        assert!(auth.key_store().jwks_url().is_none());
    }
}
