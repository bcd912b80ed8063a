// src/token.rs

use crate::error::AuthError;
use cookie::Cookie;
use http::header::{HeaderName, AUTHORIZATION, COOKIE};
use http::request::Parts;
use std::fmt;
use std::str::FromStr;

/// One place a bearer token may be carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// A request header, with an optional scheme prefix such as `"Bearer "`.
    /// The prefix is matched case-insensitively.
    Header { name: HeaderName, prefix: String },
    /// A URL query parameter.
    Query(String),
    /// A cookie.
    Cookie(String),
}

impl TokenSource {
    fn extract(&self, parts: &Parts) -> Option<String> {
        match self {
            TokenSource::Header { name, prefix } => parts.headers.get_all(name).iter().find_map(|value| {
                let value = value.to_str().ok()?;
                strip_prefix_ignore_case(value, prefix)
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(str::to_string)
            }),
            TokenSource::Query(param) => {
                let query = parts.uri.query()?;
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, value)| key == param && !value.is_empty())
                    .map(|(_, value)| value.into_owned())
            }
            TokenSource::Cookie(name) => parts
                .headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| Cookie::split_parse(value))
                .filter_map(Result::ok)
                .find(|cookie| cookie.name() == name && !cookie.value_trimmed().is_empty())
                .map(|cookie| cookie.value_trimmed().to_string()),
        }
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() < prefix.len() || !value.is_char_boundary(prefix.len()) {
        return None;
    }
    let (head, rest) = value.split_at(prefix.len());
    head.eq_ignore_ascii_case(prefix).then_some(rest)
}

/// Where the middleware looks for the token, in order.
///
/// The default is the `Authorization` header with the `Bearer ` scheme. A
/// lookup can be parsed from the compact `source:name[:prefix]` form used by
/// many HTTP frameworks, e.g. `"header:Authorization:Bearer ,query:token,cookie:jwt"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLookup {
    sources: Vec<TokenSource>,
}

impl Default for TokenLookup {
    fn default() -> Self {
        Self::header(AUTHORIZATION, "Bearer ")
    }
}

impl TokenLookup {
    /// A lookup with a single header source.
    pub fn header(name: HeaderName, prefix: impl Into<String>) -> Self {
        Self {
            sources: vec![TokenSource::Header {
                name,
                prefix: prefix.into(),
            }],
        }
    }

    /// Adds another source, consulted after the existing ones.
    pub fn or(mut self, source: TokenSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sources(&self) -> &[TokenSource] {
        &self.sources
    }

    /// Returns the first non-empty token found.
    pub fn extract(&self, parts: &Parts) -> Option<String> {
        self.sources.iter().find_map(|source| source.extract(parts))
    }
}

impl FromStr for TokenLookup {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| AuthError::InvalidConfiguration(format!("invalid token lookup '{}': {}", s, reason));

        let mut sources = Vec::new();
        for entry in s.split(',').filter(|entry| !entry.trim().is_empty()) {
            // The prefix may itself contain spaces, so only leading whitespace is trimmed.
            let mut fields = entry.trim_start().splitn(3, ':');
            let kind = fields.next().unwrap_or_default();
            let name = fields
                .next()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| invalid(format!("entry '{}' has no name", entry)))?;
            let prefix = fields.next().unwrap_or_default();

            let source = match kind {
                "header" => TokenSource::Header {
                    name: HeaderName::from_str(name).map_err(|e| invalid(e.to_string()))?,
                    prefix: prefix.to_string(),
                },
                "query" => TokenSource::Query(name.to_string()),
                "cookie" => TokenSource::Cookie(name.to_string()),
                other => return Err(invalid(format!("unknown source '{}'", other))),
            };
            sources.push(source);
        }

        if sources.is_empty() {
            return Err(invalid("no sources".to_string()));
        }
        Ok(Self { sources })
    }
}

impl fmt::Display for TokenLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, source) in self.sources.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match source {
                TokenSource::Header { name, prefix } if prefix.is_empty() => write!(f, "header:{}", name)?,
                TokenSource::Header { name, prefix } => write!(f, "header:{}:{}", name, prefix)?,
                TokenSource::Query(name) => write!(f, "query:{}", name)?,
                TokenSource::Cookie(name) => write!(f, "cookie:{}", name)?,
            }
        }
        Ok(())
    }
}
