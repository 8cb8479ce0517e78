//! HTTP fetch utilities and the NDJSON batch sink for chesslake.

use async_trait::async_trait;
use chesslake_core::Platform;
use serde_json::Value as JsonValue;
use thiserror::Error;

mod fixture;
mod http;
mod sink;

pub use fixture::{FixtureResponse, FixtureSource};
pub use http::{retry_after, HttpClientConfig, HttpFetcher, RateLimit, RequestPacer, RetryPolicy};
pub use sink::{read_rows, MonthlyBatch, NdjsonSink, SinkError};

pub const CRATE_NAME: &str = "chesslake-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Json,
    Ndjson,
}

impl Accept {
    pub fn mime(&self) -> &'static str {
        match self {
            Accept::Json => "application/json",
            Accept::Ndjson => "application/x-ndjson",
        }
    }
}

/// One read-only GET against a platform API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub platform: Platform,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub accept: Accept,
}

impl ApiRequest {
    pub fn json(platform: Platform, url: impl Into<String>) -> Self {
        Self {
            platform,
            url: url.into(),
            query: Vec::new(),
            bearer: None,
            accept: Accept::Json,
        }
    }

    pub fn ndjson(platform: Platform, url: impl Into<String>) -> Self {
        Self {
            accept: Accept::Ndjson,
            ..Self::json(platform, url)
        }
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_bearer(mut self, token: Option<&str>) -> Self {
        self.bearer = token.filter(|t| !t.is_empty()).map(ToString::to_string);
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Seam between adapters and the network; the HTTP fetcher and the fixture
/// source both implement it.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn get_json(&self, request: &ApiRequest) -> Result<JsonValue, FetchError>;

    /// Newline-delimited JSON body, one value per non-blank line.
    async fn get_ndjson(&self, request: &ApiRequest) -> Result<Vec<JsonValue>, FetchError>;
}

pub fn parse_ndjson(url: &str, body: &[u8]) -> Result<Vec<JsonValue>, FetchError> {
    body.split(|b| *b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .map(|line| {
            serde_json::from_slice(line).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_bodies_skip_blank_lines() {
        let body = b"{\"id\":\"a\"}\n\n{\"id\":\"b\"}\r\n";
        let values = parse_ndjson("https://lichess.org/api/games/user/x", body).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["id"], "b");
    }

    #[test]
    fn ndjson_reports_malformed_lines() {
        let err = parse_ndjson("u", b"{\"id\":1}\n{oops\n").unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn request_builder_drops_empty_tokens() {
        let req = ApiRequest::ndjson(Platform::Lichess, "https://lichess.org/api/games/user/x")
            .with_query("since", 10)
            .with_bearer(Some(""));
        assert_eq!(req.bearer, None);
        assert_eq!(req.query_value("since"), Some("10"));
        assert_eq!(req.accept.mime(), "application/x-ndjson");
    }
}
