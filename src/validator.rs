// src/validator.rs

use crate::actor::Actor;
use crate::error::AuthError;
use crate::jwks::KeyLookup;
use jsonwebtoken::{decode, decode_header, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

/// The "current wall-clock time" capability, in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

impl<F> Clock for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn now(&self) -> i64 {
        self()
    }
}

/// The `aud` claim, which may be a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    /// Membership check, for either form.
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == audience,
            Audience::Multiple(auds) => auds.iter().any(|aud| aud == audience),
        }
    }
}

/// A JWT NumericDate. Accepts integer or fractional seconds; fractions are truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NumericDateRepr")]
pub struct NumericDate(pub i64);

#[derive(Deserialize)]
#[serde(untagged)]
enum NumericDateRepr {
    Int(i64),
    Float(f64),
}

impl From<NumericDateRepr> for NumericDate {
    fn from(repr: NumericDateRepr) -> Self {
        match repr {
            NumericDateRepr::Int(secs) => NumericDate(secs),
            NumericDateRepr::Float(secs) => NumericDate(secs as i64),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisteredClaims {
    sub: Option<String>,
    iss: Option<String>,
    aud: Option<Audience>,
    exp: Option<NumericDate>,
    nbf: Option<NumericDate>,
    iat: Option<NumericDate>,
}

/// The registered claims of a verified token, plus the header fields used to verify it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Claims {
    pub subject: String,
    pub issuer: String,
    pub audience: Audience,
    pub expires_at: i64,
    pub not_before: Option<i64>,
    pub issued_at: Option<i64>,
    pub key_id: String,
    pub algorithm: Algorithm,
}

/// Validates bearer tokens for one issuer and audience.
///
/// This struct holds no key material; keys are resolved per call through a
/// [`KeyLookup`], so the same validator works against a live
/// [`KeyStore`](crate::jwks::KeyStore) or a fixed [`KeySet`](crate::jwks::KeySet).
#[derive(Debug, Clone)]
pub struct Validator {
    issuer: String,
    audience: String,
    leeway: Duration,
}

impl Validator {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway: Duration::ZERO,
        }
    }

    /// Sets the clock skew tolerance applied to `exp` and `nbf`.
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Validates a raw JWT and returns the authenticated [`Actor`].
    ///
    /// This method performs a full validation of the token, including:
    /// 1. Header decoding to obtain `alg` and `kid` (nothing else is trusted yet).
    /// 2. Key resolution through `keys`.
    /// 3. Algorithm pinning and signature verification.
    /// 4. Claim checks against `now`: `exp`, `nbf`, `iss`, `aud`, in that order.
    ///
    /// # Arguments
    ///
    /// * `token` - The raw JWT, without any `Bearer ` prefix.
    /// * `keys` - Resolves the token's `kid` to a verification key.
    /// * `now` - The current time in seconds since the Unix epoch.
    #[instrument(skip(self, token, keys), err(level = "debug"))]
    pub async fn validate(&self, token: &str, keys: &dyn KeyLookup, now: i64) -> Result<Actor, AuthError> {
        // 1. Decode header to get kid and alg without validation.
        let header = decode_header(token).map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        let kid = header.kid.clone().ok_or(AuthError::MissingKeyId)?;

        // 2. Resolve the verification key.
        let key = keys.lookup(&kid).await?;

        // 3. The token must use exactly the algorithm the key is bound to.
        if header.alg != key.algorithm() {
            return Err(AuthError::AlgorithmMismatch {
                expected: key.algorithm(),
                found: header.alg,
            });
        }

        // 4. Verify the signature only; claims are checked below against the supplied clock.
        let mut validation = Validation::new(key.algorithm());
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let token_data = decode::<serde_json::Map<String, serde_json::Value>>(token, key.decoding_key(), &validation)?;
        debug!("Signature verified for kid: {}", kid);

        // 5. Validate the claims of the now-trusted payload.
        let raw_claims = token_data.claims;
        let claims = self.check_claims(&header, kid, &raw_claims, now)?;

        Ok(Actor::new(claims, raw_claims))
    }

    fn check_claims(
        &self,
        header: &Header,
        key_id: String,
        raw_claims: &serde_json::Map<String, serde_json::Value>,
        now: i64,
    ) -> Result<Claims, AuthError> {
        let registered: RegisteredClaims = serde_json::from_value(serde_json::Value::Object(raw_claims.clone()))
            .map_err(|e| AuthError::MalformedToken(format!("invalid registered claims: {}", e)))?;

        let leeway = self.leeway.as_secs() as i64;

        let expires_at = registered
            .exp
            .ok_or_else(|| AuthError::MalformedToken("missing 'exp' claim".to_string()))?
            .0;
        if expires_at.saturating_add(leeway) <= now {
            return Err(AuthError::Expired);
        }

        if let Some(NumericDate(not_before)) = registered.nbf {
            if not_before.saturating_sub(leeway) > now {
                return Err(AuthError::NotYetValid);
            }
        }

        let issuer = registered.iss.ok_or(AuthError::InvalidIssuer)?;
        if issuer != self.issuer {
            debug!("Issuer mismatch. Expected: {}, Actual: {}", self.issuer, issuer);
            return Err(AuthError::InvalidIssuer);
        }

        let audience = registered.aud.ok_or(AuthError::InvalidAudience)?;
        if !audience.contains(&self.audience) {
            debug!("Audience mismatch. Expected: {}, Actual: {:?}", self.audience, audience);
            return Err(AuthError::InvalidAudience);
        }

        let subject = registered
            .sub
            .ok_or_else(|| AuthError::MalformedToken("missing 'sub' claim".to_string()))?;

        Ok(Claims {
            subject,
            issuer,
            audience,
            expires_at,
            not_before: registered.nbf.map(|d| d.0),
            issued_at: registered.iat.map(|d| d.0),
            key_id,
            algorithm: header.alg,
        })
    }
}

/// Validates `token` against an expected issuer and audience with no clock skew tolerance.
///
/// Convenience wrapper around [`Validator::validate`].
pub async fn validate(
    token: &str,
    keys: &dyn KeyLookup,
    expected_issuer: &str,
    expected_audience: &str,
    now: i64,
) -> Result<Actor, AuthError> {
    Validator::new(expected_issuer, expected_audience)
        .validate(token, keys, now)
        .await
}
