//! Canned-response fetcher.
//!
//! Serves fixed responses by URL, can be switched offline, and counts calls. Used for
//! offline fixtures and throughout the test suites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::trace;

use crate::{Fetcher, HttpResponse, NetError, Request, ResponseSource};

#[derive(Debug, Clone)]
struct StubRoute {
    status: StatusCode,
    body: Bytes,
    content_type: Option<&'static str>,
    delay: Option<Duration>,
}

/// A [`Fetcher`] answering from a table of canned responses.
///
/// Unknown URLs answer `404`. While offline every fetch fails with [`NetError::Offline`].
#[derive(Debug)]
pub struct StubFetcher {
    routes: RwLock<HashMap<String, StubRoute>>,
    calls: RwLock<HashMap<String, usize>>,
    online: AtomicBool,
}

impl StubFetcher {
    /// Create an online fetcher with no routes.
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Answer `url` with `status` and `body`.
    pub fn insert(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        self.insert_route(url, status, body.into(), None, None);
    }

    /// Answer `url` with a JSON body.
    pub fn insert_json(&self, url: &str, body: impl Into<Bytes>) {
        self.insert_route(url, 200, body.into(), Some("application/json"), None);
    }

    /// Answer `url` only after `delay` has elapsed.
    pub fn insert_delayed(&self, url: &str, status: u16, body: impl Into<Bytes>, delay: Duration) {
        self.insert_route(url, status, body.into(), None, Some(delay));
    }

    fn insert_route(
        &self,
        url: &str,
        status: u16,
        body: Bytes,
        content_type: Option<&'static str>,
        delay: Option<Duration>,
    ) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(
                url.to_string(),
                StubRoute {
                    status,
                    body,
                    content_type,
                    delay,
                },
            );
        }
    }

    /// Switch the simulated network on or off.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of fetches attempted for `url`, including failed ones.
    pub fn call_count(&self, url: &str) -> usize {
        self.calls
            .read()
            .ok()
            .and_then(|calls| calls.get(url).copied())
            .unwrap_or(0)
    }

    /// Total number of fetches attempted.
    pub fn total_calls(&self) -> usize {
        self.calls
            .read()
            .map(|calls| calls.values().sum())
            .unwrap_or(0)
    }
}

impl Default for StubFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: &Request) -> Result<HttpResponse, NetError> {
        let url = request.url.to_string();
        if let Ok(mut calls) = self.calls.write() {
            *calls.entry(url.clone()).or_insert(0) += 1;
        }

        if !self.online.load(Ordering::SeqCst) {
            trace!(url = %url, "Stub fetch while offline");
            return Err(NetError::Offline);
        }

        let route = self
            .routes
            .read()
            .map_err(|_| NetError::RequestFailed("stub routes poisoned".to_string()))?
            .get(&url)
            .cloned();

        let Some(route) = route else {
            return Ok(HttpResponse::new(request.url.clone(), StatusCode::NOT_FOUND, ""));
        };

        if let Some(delay) = route.delay {
            tokio::time::sleep(delay).await;
            if !self.online.load(Ordering::SeqCst) {
                return Err(NetError::Offline);
            }
        }

        let mut headers = HeaderMap::new();
        if let Some(content_type) = route.content_type {
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        Ok(HttpResponse {
            url: request.url.clone(),
            status: route.status,
            headers,
            body: route.body,
            source: ResponseSource::Network,
        })
    }
}
