//! Outbound HTTP fetches on behalf of the remote peer
//!
//! One long-lived `reqwest::Client` serves every request for the lifetime of
//! the process so connections to the local web server are pooled.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP method {0} not implemented")]
    UnsupportedMethod(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetch failed: {0}")]
    Failed(String),
}

/// Methods the tunnel can proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Put,
}

impl FromStr for HttpMethod {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("GET") {
            Ok(HttpMethod::Get)
        } else if s.eq_ignore_ascii_case("PUT") {
            Ok(HttpMethod::Put)
        } else {
            Err(FetchError::UnsupportedMethod(s.to_string()))
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Put => write!(f, "PUT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HashMap::new(),
        }
    }
}

/// Result of a completed fetch. Any status, including 4xx/5xx, is a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// Performs the HTTP call requested through the tunnel
#[async_trait]
pub trait FetchExecutor: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// `reqwest` backed fetch executor
#[derive(Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl FetchExecutor for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&request.url),
            HttpMethod::Put => self.http.put(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        debug!(
            "{} {} -> {} ({} bytes)",
            request.method,
            request.url,
            status,
            body.len()
        );

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!("GET".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("put".parse::<HttpMethod>().unwrap(), HttpMethod::Put);
        for method in ["DELETE", "POST", "PATCH", ""] {
            assert!(matches!(
                method.parse::<HttpMethod>(),
                Err(FetchError::UnsupportedMethod(m)) if m == method
            ));
        }
    }

    #[test]
    fn test_response_content_type() {
        let response = FetchResponse::new(200, "{}").with_header("Content-Type", "application/json");
        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(FetchResponse::new(204, Bytes::new()).content_type(), None);
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_error() {
        // Port 9 (discard) on localhost is closed on any sane test host
        let fetcher = HttpFetcher::new().unwrap();
        let result = fetcher
            .fetch(FetchRequest::new("http://127.0.0.1:9/", HttpMethod::Get))
            .await;
        assert!(matches!(result, Err(FetchError::Http(_))));
    }
}
