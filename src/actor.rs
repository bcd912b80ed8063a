// src/actor.rs

use crate::validator::Claims;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT_ACTOR: Actor;
}

/// The authenticated principal of a request.
///
/// Created by the validator for each accepted token and attached to that
/// request only. Cloning is cheap; the claim data is shared immutably.
///
/// Downstream code can reach it in three ways:
/// * from the request's [`http::Extensions`] (`req.extensions().get::<Actor>()`),
/// * through [`Actor::current`] while the wrapped service runs,
/// * with the axum extractor (`actor: Actor` as a handler argument).
#[derive(Debug, Clone)]
pub struct Actor {
    claims: Arc<Claims>,
    raw: Arc<Map<String, Value>>,
}

impl Actor {
    pub fn new(claims: Claims, raw: Map<String, Value>) -> Self {
        Self {
            claims: Arc::new(claims),
            raw: Arc::new(raw),
        }
    }

    /// The `sub` claim.
    pub fn subject(&self) -> &str {
        &self.claims.subject
    }

    /// The validated registered claims.
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Every claim of the token, as sent by the issuer.
    pub fn raw_claims(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// Deserializes a single claim, e.g. `actor.claim::<Vec<String>>("groups")`.
    ///
    /// Returns `None` if the claim is absent or does not have the requested shape.
    pub fn claim<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.raw
            .get(name)
            .and_then(|value| T::deserialize(value).ok())
    }

    /// The actor of the request currently being served, if any.
    ///
    /// Only set inside a service wrapped by the auth middleware, for the
    /// duration of that request's future.
    pub fn current() -> Option<Actor> {
        CURRENT_ACTOR.try_with(Actor::clone).ok()
    }

    /// Runs `fut` with `self` as the [`current`](Actor::current) actor.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_ACTOR.scope(self, fut).await
    }
}

#[cfg(feature = "axum")]
mod extract {
    use super::Actor;
    use crate::error::AuthError;
    use axum::extract::{FromRequestParts, OptionalFromRequestParts};
    use http::request::Parts;
    use std::convert::Infallible;

    impl<S> FromRequestParts<S> for Actor
    where
        S: Send + Sync,
    {
        type Rejection = AuthError;

        async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
            // The middleware must have run; the extractor never validates on its own.
            parts.extensions.get::<Actor>().cloned().ok_or(AuthError::TokenMissing)
        }
    }

    impl<S> OptionalFromRequestParts<S> for Actor
    where
        S: Send + Sync,
    {
        type Rejection = Infallible;

        async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
            Ok(parts.extensions.get::<Actor>().cloned())
        }
    }
}
