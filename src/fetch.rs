// src/fetch.rs

use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// A fetched remote document.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// The raw response body.
    pub body: Bytes,
    /// The `max-age` advertised by the response's `Cache-Control` header, if any.
    pub max_age: Option<Duration>,
}

impl FetchedDocument {
    /// Creates a document with no caching hint.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { body: body.into(), max_age: None }
    }
}

/// The "fetch bytes over HTTP" capability consumed by discovery and the key store.
///
/// Implemented for [`reqwest::Client`]. Tests and air-gapped deployments can
/// supply their own implementation.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Issues a single GET for `url`. Implementations should honour `timeout`;
    /// callers additionally bound the call with the same timeout.
    async fn get(&self, url: &Url, timeout: Duration) -> Result<FetchedDocument, FetchError>;
}

#[async_trait]
impl HttpFetch for reqwest::Client {
    async fn get(&self, url: &Url, timeout: Duration) -> Result<FetchedDocument, FetchError> {
        debug!("GET {}", url);
        let response = reqwest::Client::get(self, url.clone()).timeout(timeout).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let max_age = parse_cache_control(&response);
        let body = response.bytes().await?;
        Ok(FetchedDocument { body, max_age })
    }
}

/// Builds the default HTTP client used when no fetcher is configured.
pub fn default_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Runs a fetch future under a deadline. A timed-out fetch is dropped, so it
/// can never partially apply its result.
pub(crate) async fn with_timeout<F>(timeout: Duration, fut: F) -> Result<FetchedDocument, FetchError>
where
    F: Future<Output = Result<FetchedDocument, FetchError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| FetchError::Timeout(timeout))?
}

/// Parses the `Cache-Control` header to determine the TTL.
fn parse_cache_control(response: &reqwest::Response) -> Option<Duration> {
    let value = response
        .headers()
        .get(reqwest::header::CACHE_CONTROL)?
        .to_str()
        .ok()?;
    max_age(value)
}

fn max_age(cache_control: &str) -> Option<Duration> {
    cache_control.split(',').find_map(|part| {
        part.trim()
            .strip_prefix("max-age=")?
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_age_is_read_from_any_position() {
        assert_eq!(max_age("public, max-age=3600"), Some(Duration::from_secs(3600)));
        assert_eq!(max_age("max-age=60, must-revalidate"), Some(Duration::from_secs(60)));
        assert_eq!(max_age("no-cache"), None);
        assert_eq!(max_age("max-age=soon"), None);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(FetchedDocument::new("{}"))
        })
        .await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }
}
