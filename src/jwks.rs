// src/jwks.rs

use crate::config::KeyFetchOptions;
use crate::error::{AuthError, FetchError};
use crate::fetch::{self, HttpFetch};
use crate::model::JsonWebKeySet;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

const BASE_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Public verification key material bound to the one algorithm it may verify.
#[derive(Clone)]
pub struct VerificationKey {
    algorithm: Algorithm,
    key: DecodingKey,
}

impl VerificationKey {
    pub fn new(algorithm: Algorithm, key: DecodingKey) -> Self {
        Self { algorithm, key }
    }

    /// Converts a published JWK into a verification key.
    ///
    /// Keys whose `use` is anything other than `sig`, whose algorithm cannot be
    /// determined, or whose declared algorithm does not fit the key type are
    /// rejected with a human-readable reason.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, String> {
        match &jwk.common.public_key_use {
            None | Some(PublicKeyUse::Signature) => {}
            Some(other) => return Err(format!("key use {:?} is not 'sig'", other)),
        }

        let algorithm = key_algorithm(jwk).ok_or_else(|| "unsupported or missing algorithm".to_string())?;

        let family_matches = match (algorithm, &jwk.algorithm) {
            (
                Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512,
                AlgorithmParameters::RSA(_),
            ) => true,
            // ECDSA algorithms are tied to a single curve.
            (Algorithm::ES256, AlgorithmParameters::EllipticCurve(ec)) => ec.curve == EllipticCurve::P256,
            (Algorithm::ES384, AlgorithmParameters::EllipticCurve(ec)) => ec.curve == EllipticCurve::P384,
            (Algorithm::EdDSA, AlgorithmParameters::OctetKeyPair(okp)) => okp.curve == EllipticCurve::Ed25519,
            _ => false,
        };
        if !family_matches {
            return Err(format!("algorithm {:?} does not match the key type or curve", algorithm));
        }

        let key = DecodingKey::from_jwk(jwk).map_err(|e| e.to_string())?;
        Ok(Self { algorithm, key })
    }

    /// The only algorithm this key accepts.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Determines the algorithm for a JWK, inferring it from the key type when
/// the `alg` member is absent. Symmetric keys are never accepted from a JWKS.
fn key_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    if let Some(alg) = &jwk.common.key_algorithm {
        return match alg {
            KeyAlgorithm::RS256 => Some(Algorithm::RS256),
            KeyAlgorithm::RS384 => Some(Algorithm::RS384),
            KeyAlgorithm::RS512 => Some(Algorithm::RS512),
            KeyAlgorithm::PS256 => Some(Algorithm::PS256),
            KeyAlgorithm::PS384 => Some(Algorithm::PS384),
            KeyAlgorithm::PS512 => Some(Algorithm::PS512),
            KeyAlgorithm::ES256 => Some(Algorithm::ES256),
            KeyAlgorithm::ES384 => Some(Algorithm::ES384),
            KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
            _ => None,
        };
    }

    match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(ec) => match ec.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKeyPair(okp) if okp.curve == EllipticCurve::Ed25519 => {
            Some(Algorithm::EdDSA)
        }
        _ => None,
    }
}

/// An immutable snapshot of the issuer's signing keys.
///
/// A snapshot is never modified once published; refreshes build a new one and
/// swap it in whole, so a key handed out by a lookup stays valid for as long
/// as the caller holds it.
#[derive(Debug, Default)]
pub struct KeySet {
    keys: HashMap<String, Arc<VerificationKey>>,
    revision: u64,
    max_age: Option<Duration>,
}

impl KeySet {
    /// Builds a snapshot from explicit keys.
    pub fn from_keys(keys: HashMap<String, VerificationKey>) -> Self {
        Self {
            keys: keys.into_iter().map(|(kid, key)| (kid, Arc::new(key))).collect(),
            revision: 0,
            max_age: None,
        }
    }

    pub fn get(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.keys.get(kid).cloned()
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The key IDs in this snapshot, sorted.
    pub fn key_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Monotonic counter identifying the refresh that produced this snapshot.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The `Cache-Control: max-age` the JWKS endpoint sent with this snapshot.
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }
}

/// Resolves a key ID to a verification key.
#[async_trait]
pub trait KeyLookup: Send + Sync {
    async fn lookup(&self, kid: &str) -> Result<Arc<VerificationKey>, AuthError>;
}

#[async_trait]
impl KeyLookup for KeySet {
    async fn lookup(&self, kid: &str) -> Result<Arc<VerificationKey>, AuthError> {
        self.get(kid).ok_or_else(|| AuthError::UnknownKey(kid.to_string()))
    }
}

/// Fetches, caches and refreshes the issuer's JSON Web Key Set.
///
/// Lookups read the current [`KeySet`] snapshot without locking. Refreshes are
/// serialised among themselves, fetch the whole set, and then swap it in
/// atomically; readers never see a partially updated set.
#[derive(Clone)]
pub struct KeyStore {
    // The store is internally ref-counted to allow for cheap cloning.
    inner: Arc<Inner>,
}

struct Inner {
    jwks_url: Option<Url>,
    fetcher: Option<Arc<dyn HttpFetch>>,
    refresh_interval: Option<Duration>,
    refresh_unknown_kid: bool,
    refresh_rate_limit: Option<Duration>,
    request_timeout: Duration,
    respect_cache_control: bool,
    snapshot: ArcSwap<KeySet>,
    // Time of the last refresh attempt; the lock also single-flights refreshes.
    last_refresh: Mutex<Option<Instant>>,
    revision: AtomicU64,
    refresher: OnceLock<AbortHandle>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.refresher.get() {
            handle.abort();
        }
    }
}

impl KeyStore {
    /// Creates a store and performs the initial fetch.
    ///
    /// When `options.static_keys` is set the store serves exactly those keys
    /// and never touches the network. Otherwise the JWKS is fetched once here;
    /// failure to obtain it is fatal. If a refresh interval is configured (or
    /// the endpoint sends `Cache-Control: max-age`), a background task keeps the
    /// set fresh for as long as the store is alive.
    #[instrument(skip(jwks_url, options), fields(jwks_url = %jwks_url), err)]
    pub async fn initialize(jwks_url: Url, options: &KeyFetchOptions) -> Result<Self, AuthError> {
        if let Some(keys) = &options.static_keys {
            debug!("Using {} static keys, JWKS fetch disabled", keys.len());
            return Ok(Self::from_keys(keys.clone()));
        }

        let fetcher: Arc<dyn HttpFetch> = match &options.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(fetch::default_client(options.request_timeout).map_err(|source| {
                AuthError::KeyFetchFailed {
                    url: jwks_url.to_string(),
                    source,
                }
            })?),
        };

        let store = Self {
            inner: Arc::new(Inner {
                jwks_url: Some(jwks_url),
                fetcher: Some(fetcher),
                refresh_interval: options.refresh_interval,
                refresh_unknown_kid: options.refresh_unknown_kid,
                refresh_rate_limit: options.refresh_rate_limit,
                request_timeout: options.request_timeout,
                respect_cache_control: options.respect_cache_control,
                snapshot: ArcSwap::from_pointee(KeySet::default()),
                last_refresh: Mutex::new(None),
                revision: AtomicU64::new(0),
                refresher: OnceLock::new(),
            }),
        };

        let initial = store.refresh().await?;
        if initial.is_empty() {
            warn!("JWKS contains no usable signing keys");
        }

        if store.inner.next_refresh_delay().is_some() {
            store.spawn_refresher();
        }

        Ok(store)
    }

    /// Creates a store that serves a fixed set of keys and never refreshes.
    pub fn from_keys(keys: HashMap<String, VerificationKey>) -> Self {
        Self {
            inner: Arc::new(Inner {
                jwks_url: None,
                fetcher: None,
                refresh_interval: None,
                refresh_unknown_kid: false,
                refresh_rate_limit: None,
                request_timeout: Duration::ZERO,
                respect_cache_control: false,
                snapshot: ArcSwap::from_pointee(KeySet::from_keys(keys)),
                last_refresh: Mutex::new(None),
                revision: AtomicU64::new(0),
                refresher: OnceLock::new(),
            }),
        }
    }

    /// The JWKS endpoint, or `None` for a static store.
    pub fn jwks_url(&self) -> Option<&Url> {
        self.inner.jwks_url.as_ref()
    }

    /// The currently published key set.
    pub fn snapshot(&self) -> Arc<KeySet> {
        self.inner.snapshot.load_full()
    }

    /// Fetches the JWKS and atomically replaces the key set.
    ///
    /// On failure the previous set keeps serving. Concurrent callers are
    /// serialised; the last completed refresh wins.
    #[instrument(skip(self), err)]
    pub async fn refresh(&self) -> Result<Arc<KeySet>, AuthError> {
        let mut last_refresh = self.inner.last_refresh.lock().await;
        let result = self.inner.fetch_key_set().await;
        *last_refresh = Some(Instant::now());
        let key_set = Arc::new(result?);
        self.inner.snapshot.store(key_set.clone());
        Ok(key_set)
    }

    /// A single refresh attempt triggered by a key ID missing from the set.
    async fn refresh_for_unknown_kid(&self, kid: &str, seen_revision: u64) -> Result<Arc<VerificationKey>, AuthError> {
        let mut last_refresh = self.inner.last_refresh.lock().await;

        // Someone else refreshed while we waited for the lock.
        let current = self.inner.snapshot.load_full();
        if current.revision() != seen_revision {
            debug!("Key set changed while waiting to refresh, re-checking kid: {}", kid);
            return current.get(kid).ok_or_else(|| AuthError::UnknownKey(kid.to_string()));
        }

        if let (Some(limit), Some(at)) = (self.inner.refresh_rate_limit, *last_refresh) {
            if at.elapsed() < limit {
                debug!("Refresh for kid {} suppressed by rate limit of {:?}", kid, limit);
                return Err(AuthError::UnknownKey(kid.to_string()));
            }
        }

        info!("Unknown kid {}, refreshing JWKS", kid);
        let result = self.inner.fetch_key_set().await;
        *last_refresh = Some(Instant::now());

        match result {
            Ok(key_set) => {
                let key_set = Arc::new(key_set);
                self.inner.snapshot.store(key_set.clone());
                key_set.get(kid).ok_or_else(|| AuthError::UnknownKey(kid.to_string()))
            }
            Err(e) => {
                warn!("JWKS refresh for unknown kid {} failed, serving stale keys: {}", kid, e);
                Err(AuthError::UnknownKey(kid.to_string()))
            }
        }
    }

    fn spawn_refresher(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(refresh_loop(weak));
        let _ = self.inner.refresher.set(handle.abort_handle());
    }
}

#[async_trait]
impl KeyLookup for KeyStore {
    /// Retrieves the verification key for the given Key ID (`kid`).
    ///
    /// On a miss, and only if unknown-kid refresh is enabled, one synchronous
    /// refresh is attempted before the key is declared unknown.
    async fn lookup(&self, kid: &str) -> Result<Arc<VerificationKey>, AuthError> {
        let seen_revision = {
            let snapshot = self.inner.snapshot.load();
            if let Some(key) = snapshot.get(kid) {
                return Ok(key);
            }
            snapshot.revision()
        };

        if !self.inner.refresh_unknown_kid || self.inner.fetcher.is_none() {
            debug!("Unknown kid {} and refresh disabled", kid);
            return Err(AuthError::UnknownKey(kid.to_string()));
        }

        self.refresh_for_unknown_kid(kid, seen_revision).await
    }
}

impl Inner {
    /// Fetches and parses the JWKS into a fresh snapshot. Nothing is published here.
    async fn fetch_key_set(&self) -> Result<KeySet, AuthError> {
        let (Some(url), Some(fetcher)) = (&self.jwks_url, &self.fetcher) else {
            return Err(AuthError::InvalidConfiguration("key store has no JWKS source".to_string()));
        };

        let failed = |source: FetchError| AuthError::KeyFetchFailed {
            url: url.to_string(),
            source,
        };

        let document = fetch::with_timeout(self.request_timeout, fetcher.get(url, self.request_timeout))
            .await
            .map_err(failed)?;

        let jwks: JsonWebKeySet = serde_json::from_slice(&document.body).map_err(|e| failed(e.into()))?;

        let mut keys = HashMap::with_capacity(jwks.keys.len());
        for raw in jwks.keys {
            let jwk: Jwk = match serde_json::from_value(raw) {
                Ok(jwk) => jwk,
                Err(e) => {
                    warn!("Skipping unparseable JWK: {}", e);
                    continue;
                }
            };
            let Some(kid) = jwk.common.key_id.clone() else {
                warn!("Skipping JWK without 'kid'");
                continue;
            };
            match VerificationKey::from_jwk(&jwk) {
                Ok(key) => {
                    if keys.insert(kid.clone(), Arc::new(key)).is_some() {
                        warn!("Duplicate kid {} in JWKS, keeping the last one", kid);
                    }
                }
                Err(reason) => warn!("Skipping JWK {}: {}", kid, reason),
            }
        }

        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Fetched {} keys from {} (revision {})", keys.len(), url, revision);

        Ok(KeySet {
            keys,
            revision,
            max_age: document.max_age,
        })
    }

    /// How long to wait before the next background refresh, if any.
    fn next_refresh_delay(&self) -> Option<Duration> {
        let delay = self.refresh_interval.or_else(|| {
            if !self.respect_cache_control {
                return None;
            }
            // Proactively refresh at 80% of the advertised lifetime.
            self.snapshot.load().max_age().map(|ttl| ttl.mul_f64(0.8))
        })?;
        Some(delay.max(MIN_REFRESH_DELAY))
    }
}

/// The main loop for the background key refresh task.
///
/// Holds only a weak reference between iterations so the loop ends once the
/// last [`KeyStore`] handle is dropped.
async fn refresh_loop(weak: Weak<Inner>) {
    let mut retry_delay = BASE_RETRY_DELAY;
    let mut delay = match weak.upgrade().and_then(|inner| inner.next_refresh_delay()) {
        Some(delay) => delay,
        None => return,
    };

    loop {
        debug!("JWKS background refresh scheduled in {:?}", delay);
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let store = KeyStore { inner };

        match store.refresh().await {
            Ok(_) => {
                retry_delay = BASE_RETRY_DELAY;
                match store.inner.next_refresh_delay() {
                    Some(next) => delay = next,
                    None => return,
                }
            }
            Err(e) => {
                warn!("Failed to refresh JWKS in background: {}. Retrying in {:?}.", e, retry_delay);
                delay = retry_delay;
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
}
