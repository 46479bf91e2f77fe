//! Endpoint factories.
//!
//! A [`Component`] owns a URI scheme and creates [`Endpoint`]s for it. An
//! endpoint hands out producers (processors that deliver exchanges) and,
//! when it can receive, consumers that feed a route.

pub mod direct;
pub mod file;
pub mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::ExchangeError;

use crate::engine::SharedProcessor;

pub use direct::{DirectComponent, DirectRouter};
pub use file::{FileComponent, FileExist};
pub use mock::{MockAssertionError, MockComponent, MockEndpoint};

// ---------------------------------------------------------------------------
// EndpointUri
// ---------------------------------------------------------------------------

/// A parsed `scheme:path?key=value&...` endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    raw: String,
    scheme: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl EndpointUri {
    /// Parses an endpoint address. A `//` after the scheme is ignored.
    ///
    /// # Errors
    ///
    /// Returns `IllegalArgument` when the scheme is missing.
    pub fn parse(uri: &str) -> Result<Self, ExchangeError> {
        let raw = uri.trim();
        let (scheme, rest) = raw
            .split_once(':')
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| ExchangeError::IllegalArgument(format!("invalid endpoint uri: {uri}")))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

        let params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (key.to_string(), value.to_string())
            })
            .collect();

        Ok(Self {
            raw: raw.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            path: path.to_string(),
            params,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Creates endpoints for one URI scheme.
pub trait Component: Send + Sync {
    /// # Errors
    ///
    /// Returns `IllegalArgument` for malformed paths or options.
    fn create_endpoint(&self, uri: &EndpointUri) -> Result<Arc<dyn Endpoint>, ExchangeError>;
}

/// An addressable source or destination of exchanges.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    /// A processor delivering exchanges to this endpoint.
    ///
    /// # Errors
    ///
    /// Returns the failure if the endpoint cannot produce.
    fn create_producer(&self) -> Result<SharedProcessor, ExchangeError>;

    /// Starts feeding exchanges received on this endpoint into `processor`.
    ///
    /// # Errors
    ///
    /// Endpoints that cannot receive reject the call with `IllegalState`.
    async fn create_consumer(
        &self,
        processor: SharedProcessor,
    ) -> Result<Box<dyn Consumer>, ExchangeError> {
        let _ = processor;
        Err(ExchangeError::IllegalState(format!(
            "endpoint {} does not support consumers",
            self.uri()
        )))
    }
}

/// Running handle of a bound consumer.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Unbinds the consumer. No new exchanges are delivered afterwards.
    async fn stop(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_path_and_params() {
        let uri = EndpointUri::parse("file://out/dir?fileExist=Append&appendChars=@@@").unwrap();
        assert_eq!(uri.scheme(), "file");
        assert_eq!(uri.path(), "out/dir");
        assert_eq!(uri.param("fileExist"), Some("Append"));
        assert_eq!(uri.param("appendChars"), Some("@@@"));
        assert_eq!(uri.param("missing"), None);
    }

    #[test]
    fn path_without_params() {
        let uri = EndpointUri::parse("direct:start").unwrap();
        assert_eq!(uri.scheme(), "direct");
        assert_eq!(uri.path(), "start");
        assert!(uri.params().is_empty());
        assert_eq!(uri.to_string(), "direct:start");
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(EndpointUri::parse("no-scheme").is_err());
        assert!(EndpointUri::parse(":path").is_err());
    }
}
