//! # ChatKit Net
//!
//! Typed fetch requests/responses and the network seam used by the cache worker.
//!
//! ## Design Goals
//!
//! 1. **Tagged request descriptor**: url, method, destination, navigation flag
//! 2. **Tagged response result**: an HTTP response or a distinguishable network error
//! 3. **Pluggable network**: everything fetches through the [`Fetcher`] trait
//! 4. **Real and stub fetchers**: `reqwest`-backed [`HttpFetcher`], canned [`StubFetcher`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod http_fetcher;
pub mod stub;

pub use http_fetcher::{HttpFetcher, LoaderConfig};
pub use stub::StubFetcher;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Network unreachable")]
    Offline,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the fetched resource will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// A top-level or nested document.
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    Worker,
    /// `fetch()`/XHR and anything else without a destination.
    #[default]
    Empty,
}

/// Request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Page navigation.
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

/// Fetch request descriptor.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub destination: Destination,
    pub mode: RequestMode,
    pub headers: HeaderMap,
}

impl Request {
    /// Create a GET request with no destination.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            destination: Destination::Empty,
            mode: RequestMode::Cors,
            headers: HeaderMap::new(),
        }
    }

    /// Create a navigation request for a document.
    pub fn navigate(url: Url) -> Self {
        Self {
            destination: Destination::Document,
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Whether this request is a page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Key under which the response is cached: method + URL.
    pub fn cache_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Built-in response produced without cache or network.
    Builtin,
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl HttpResponse {
    /// Create a network response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether this response was served from a cache partition.
    pub fn from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// The result handed back to the page for an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchResponse {
    /// An HTTP response, whatever its status.
    Http(HttpResponse),
    /// A network error, distinct from any HTTP error status.
    NetworkError,
}

impl FetchResponse {
    pub fn is_network_error(&self) -> bool {
        matches!(self, FetchResponse::NetworkError)
    }

    pub fn http(&self) -> Option<&HttpResponse> {
        match self {
            FetchResponse::Http(response) => Some(response),
            FetchResponse::NetworkError => None,
        }
    }
}

/// Something that can perform a network fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `request` from the network.
    ///
    /// `Err` means the network could not produce a response at all. An HTTP error
    /// status is an `Ok` response.
    async fn fetch(&self, request: &Request) -> Result<HttpResponse, NetError>;
}
