//! Caching strategies.
//!
//! Three ways of answering a request from a partition and/or the network:
//!
//! - **cache-first**: fresh cached entry, else network (written back when cacheable)
//! - **network-first**: network bounded by a timeout, else fresh cached entry
//! - **stale-while-revalidate**: any cached entry immediately plus a background refresh,
//!   else network
//!
//! When neither the partition nor the network produces a response the strategy
//! returns [`StrategyError::Exhausted`] and the caller falls back.

use std::sync::Arc;
use std::time::Duration;

use chatkit_common::{with_cancel, with_timeout, Clock};
use chatkit_net::{Fetcher, HttpResponse, NetError, Request};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheStorage, PartitionLimits};
use crate::classify::Route;
use crate::config::{RouteConfig, StrategyKind};

/// Both the partition and the network failed.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("no usable cache entry for {key} and network failed: {source}")]
    Exhausted {
        key: String,
        #[source]
        source: NetError,
    },
}

/// A route bound to its partition.
#[derive(Debug, Clone)]
pub struct RouteHandler {
    pub route: Route,
    pub partition: String,
    pub config: RouteConfig,
}

impl RouteHandler {
    pub fn limits(&self) -> PartitionLimits {
        PartitionLimits {
            max_entries: self.config.max_entries,
            max_age: self.config.max_age(),
        }
    }

    fn is_cacheable(&self, response: &HttpResponse) -> bool {
        self.config
            .cacheable_statuses
            .contains(&response.status.as_u16())
    }
}

/// A strategy's answer.
#[derive(Debug)]
pub struct Served {
    pub response: HttpResponse,
    /// Background refresh still writing to the partition, if any.
    pub revalidation: Option<JoinHandle<()>>,
}

impl Served {
    fn now(response: HttpResponse) -> Self {
        Self {
            response,
            revalidation: None,
        }
    }
}

/// Runs caching strategies against shared cache storage.
#[derive(Clone)]
pub struct CacheStrategyEngine {
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    network_timeout: Duration,
}

impl CacheStrategyEngine {
    pub fn new(
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
        network_timeout: Duration,
    ) -> Self {
        Self {
            caches,
            fetcher,
            clock,
            network_timeout,
        }
    }

    /// Answer `request` with the strategy bound to `handler`.
    ///
    /// Network attempts are abandoned as soon as `cancel` fires.
    pub async fn serve(
        &self,
        handler: &RouteHandler,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Served, StrategyError> {
        match handler.config.strategy {
            StrategyKind::CacheFirst => self.cache_first(handler, request, cancel).await,
            StrategyKind::NetworkFirst => self.network_first(handler, request, cancel).await,
            StrategyKind::StaleWhileRevalidate => {
                self.stale_while_revalidate(handler, request, cancel).await
            }
        }
    }

    async fn cache_first(
        &self,
        handler: &RouteHandler,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Served, StrategyError> {
        let key = request.cache_key();
        if let Some(entry) = self.lookup(handler, &key, true).await {
            debug!(route = %handler.route, key = %key, "Cache hit");
            return Ok(Served::now(entry.to_response()));
        }

        match self.fetch_network(request, cancel).await {
            Ok(response) => {
                self.store(handler, &key, &response).await;
                Ok(Served::now(response))
            }
            Err(source) => Err(StrategyError::Exhausted { key, source }),
        }
    }

    async fn network_first(
        &self,
        handler: &RouteHandler,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Served, StrategyError> {
        let key = request.cache_key();
        let attempt = with_timeout(self.network_timeout, || self.fetch_network(request, cancel)).await;

        let source = match attempt {
            Ok(Ok(response)) => {
                self.store(handler, &key, &response).await;
                return Ok(Served::now(response));
            }
            Ok(Err(e)) => e,
            Err(_) => NetError::Timeout(self.network_timeout),
        };

        debug!(route = %handler.route, key = %key, error = %source, "Network failed, trying cache");
        match self.lookup(handler, &key, true).await {
            Some(entry) => Ok(Served::now(entry.to_response())),
            None => Err(StrategyError::Exhausted { key, source }),
        }
    }

    async fn stale_while_revalidate(
        &self,
        handler: &RouteHandler,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Served, StrategyError> {
        let key = request.cache_key();

        // Age is ignored here: a stale entry is still served.
        if let Some(entry) = self.lookup(handler, &key, false).await {
            debug!(route = %handler.route, key = %key, "Serving cached entry, revalidating");
            let engine = self.clone();
            let handler = handler.clone();
            let request = request.clone();
            let cancel = cancel.clone();
            let revalidation = tokio::spawn(async move {
                engine.revalidate(&handler, &request, &cancel).await;
            });
            return Ok(Served {
                response: entry.to_response(),
                revalidation: Some(revalidation),
            });
        }

        match self.fetch_network(request, cancel).await {
            Ok(response) => {
                self.store(handler, &key, &response).await;
                Ok(Served::now(response))
            }
            Err(source) => Err(StrategyError::Exhausted { key, source }),
        }
    }

    async fn revalidate(&self, handler: &RouteHandler, request: &Request, cancel: &CancellationToken) {
        match self.fetch_network(request, cancel).await {
            Ok(response) => {
                self.store(handler, &request.cache_key(), &response).await;
            }
            Err(e) => {
                debug!(route = %handler.route, url = %request.url, error = %e, "Revalidation failed");
            }
        }
    }

    async fn fetch_network(&self, request: &Request, cancel: &CancellationToken) -> Result<HttpResponse, NetError> {
        with_cancel(cancel, self.fetcher.fetch(request))
            .await
            .unwrap_or(Err(NetError::Cancelled))
    }

    async fn lookup(&self, handler: &RouteHandler, key: &str, respect_age: bool) -> Option<Arc<CacheEntry>> {
        let caches = self.caches.read().await;
        let entry = caches.get(&handler.partition)?.get(key)?;
        // The route's own ceiling applies, also to partitions loaded from disk.
        if respect_age && entry.is_expired(handler.config.max_age(), self.clock.now_millis()) {
            return None;
        }
        Some(entry)
    }

    /// Write `response` to the handler's partition if its status is cacheable.
    ///
    /// Returns whether it was written. A failed write is logged; the response is still
    /// good to serve.
    pub async fn store(&self, handler: &RouteHandler, key: &str, response: &HttpResponse) -> bool {
        if !handler.is_cacheable(response) {
            trace!(route = %handler.route, key, status = %response.status, "Response not cacheable");
            return false;
        }
        let entry = CacheEntry::from_response(key, response, self.clock.now_millis());
        let mut caches = self.caches.write().await;
        match caches.insert(&handler.partition, handler.limits(), entry).await {
            Ok(_) => true,
            Err(e) => {
                warn!(route = %handler.route, partition = %handler.partition, key, error = %e, "Failed to write cache entry");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatkit_common::ManualClock;
    use chatkit_net::{Destination, ResponseSource, StubFetcher};
    use url::Url;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Harness {
        engine: CacheStrategyEngine,
        fetcher: Arc<StubFetcher>,
        clock: ManualClock,
        caches: Arc<RwLock<CacheStorage>>,
    }

    fn harness() -> Harness {
        let fetcher = Arc::new(StubFetcher::new());
        let clock = ManualClock::new(1_700_000_000_000);
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let engine = CacheStrategyEngine::new(
            caches.clone(),
            fetcher.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(3),
        );
        Harness {
            engine,
            fetcher,
            clock,
            caches,
        }
    }

    fn handler(route: Route, config: RouteConfig) -> RouteHandler {
        RouteHandler {
            route,
            partition: format!("test-{route}"),
            config,
        }
    }

    fn script(url: &str) -> Request {
        Request::parse(url).unwrap().destination(Destination::Script)
    }

    #[tokio::test]
    async fn test_cache_first_populates_then_serves_offline() {
        let h = harness();
        let url = "https://chat.example/static/js/main.js";
        h.fetcher.insert(url, 200, "js");
        let handler = handler(Route::Static, RouteConfig::new(StrategyKind::CacheFirst).cacheable(&[200]));
        let cancel = CancellationToken::new();

        let first = h.engine.serve(&handler, &script(url), &cancel).await.unwrap();
        assert_eq!(first.response.source, ResponseSource::Network);

        h.fetcher.set_online(false);
        let second = h.engine.serve(&handler, &script(url), &cancel).await.unwrap();
        assert!(second.response.from_cache());
        assert_eq!(second.response.body, "js");
        assert_eq!(h.fetcher.call_count(url), 1);
    }

    #[tokio::test]
    async fn test_cache_first_skips_uncacheable_status() {
        let h = harness();
        let url = "https://chat.example/static/js/missing.js";
        h.fetcher.insert(url, 404, "nope");
        let handler = handler(Route::Static, RouteConfig::new(StrategyKind::CacheFirst).cacheable(&[200]));
        let cancel = CancellationToken::new();

        let served = h.engine.serve(&handler, &script(url), &cancel).await.unwrap();
        assert_eq!(served.response.status.as_u16(), 404);
        assert!(h.caches.read().await.get("test-static").is_none());
    }

    #[tokio::test]
    async fn test_cache_first_expired_entry_is_a_miss() {
        let h = harness();
        let url = "https://chat.example/static/css/app.css";
        h.fetcher.insert(url, 200, "v1");
        let handler = handler(
            Route::Static,
            RouteConfig::new(StrategyKind::CacheFirst).max_age_secs(60),
        );
        let cancel = CancellationToken::new();

        h.engine.serve(&handler, &script(url), &cancel).await.unwrap();
        h.clock.advance(Duration::from_secs(61));
        h.fetcher.insert(url, 200, "v2");

        let served = h.engine.serve(&handler, &script(url), &cancel).await.unwrap();
        assert_eq!(served.response.source, ResponseSource::Network);
        assert_eq!(served.response.body, "v2");
    }

    #[tokio::test]
    async fn test_cache_first_double_failure() {
        let h = harness();
        h.fetcher.set_online(false);
        let handler = handler(Route::Image, RouteConfig::new(StrategyKind::CacheFirst));
        let request = Request::parse("https://chat.example/avatar.png").unwrap();

        let result = h.engine.serve(&handler, &request, &CancellationToken::new()).await;
        assert!(matches!(result, Err(StrategyError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn test_eviction_keeps_max_entries() {
        let h = harness();
        let handler = handler(
            Route::Image,
            RouteConfig::new(StrategyKind::CacheFirst).max_entries(3),
        );
        let cancel = CancellationToken::new();

        for i in 0..4 {
            let url = format!("https://chat.example/img/{i}.png");
            h.fetcher.insert(&url, 200, "png");
            let request = Request::parse(&url).unwrap();
            h.engine.serve(&handler, &request, &cancel).await.unwrap();
            h.clock.advance(Duration::from_millis(1));
        }

        let caches = h.caches.read().await;
        let partition = caches.get("test-image").unwrap();
        assert_eq!(partition.len(), 3);
        assert!(partition.get("GET https://chat.example/img/0.png").is_none());
        assert!(partition.get("GET https://chat.example/img/3.png").is_some());
    }

    #[tokio::test]
    async fn test_network_first_prefers_network_then_cache() {
        let h = harness();
        let url = "https://chat.example/api/rooms";
        h.fetcher.insert(url, 200, "fresh");
        let handler = handler(Route::Api, RouteConfig::new(StrategyKind::NetworkFirst).max_age_secs(300));
        let request = Request::parse(url).unwrap();
        let cancel = CancellationToken::new();

        let online = h.engine.serve(&handler, &request, &cancel).await.unwrap();
        assert_eq!(online.response.source, ResponseSource::Network);

        h.fetcher.set_online(false);
        let offline = h.engine.serve(&handler, &request, &cancel).await.unwrap();
        assert!(offline.response.from_cache());
        assert_eq!(offline.response.body, "fresh");

        // Past the age ceiling the cached copy no longer counts.
        h.clock.advance(Duration::from_secs(301));
        let expired = h.engine.serve(&handler, &request, &cancel).await;
        assert!(expired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_timeout_falls_back_to_cache() {
        let h = harness();
        let url = "https://chat.example/api/messages";
        h.fetcher.insert(url, 200, "cached");
        let handler = handler(Route::Api, RouteConfig::new(StrategyKind::NetworkFirst));
        let request = Request::parse(url).unwrap();
        let cancel = CancellationToken::new();

        h.engine.serve(&handler, &request, &cancel).await.unwrap();

        h.fetcher.insert_delayed(url, 200, "slow", Duration::from_secs(60));
        let served = h.engine.serve(&handler, &request, &cancel).await.unwrap();
        assert!(served.response.from_cache());
        assert_eq!(served.response.body, "cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_timeout_without_cache_is_exhausted() {
        let h = harness();
        let url = "https://chat.example/api/slow";
        h.fetcher.insert_delayed(url, 200, "slow", Duration::from_secs(60));
        let handler = handler(Route::Api, RouteConfig::new(StrategyKind::NetworkFirst));
        let request = Request::parse(url).unwrap();

        let result = h.engine.serve(&handler, &request, &CancellationToken::new()).await;
        match result {
            Err(StrategyError::Exhausted { source, .. }) => {
                assert!(matches!(source, NetError::Timeout(_)));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_serves_stale_and_refreshes() {
        let h = harness();
        let url = "https://chat.example/manifest.json";
        h.fetcher.insert(url, 200, "v1");
        let handler = handler(
            Route::Manifest,
            RouteConfig::new(StrategyKind::StaleWhileRevalidate)
                .max_entries(1)
                .max_age_secs(30 * DAY.as_secs()),
        );
        let request = Request::parse(url).unwrap();
        let cancel = CancellationToken::new();

        let first = h.engine.serve(&handler, &request, &cancel).await.unwrap();
        assert!(first.revalidation.is_none());

        h.clock.advance(31 * DAY);
        h.fetcher.insert(url, 200, "v2");

        let stale = h.engine.serve(&handler, &request, &cancel).await.unwrap();
        assert!(stale.response.from_cache());
        assert_eq!(stale.response.body, "v1");

        stale.revalidation.unwrap().await.unwrap();
        let caches = h.caches.read().await;
        let entry = caches
            .get("test-manifest")
            .unwrap()
            .get(&request.cache_key())
            .unwrap();
        assert_eq!(entry.body, "v2");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_miss_waits_for_network() {
        let h = harness();
        let url = "https://chat.example/about";
        h.fetcher.insert(url, 200, "page");
        let handler = handler(Route::Default, RouteConfig::new(StrategyKind::StaleWhileRevalidate));
        let request = Request::parse(url).unwrap();

        let served = h
            .engine
            .serve(&handler, &request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(served.response.source, ResponseSource::Network);
        assert!(served.revalidation.is_none());
        assert_eq!(h.caches.read().await.get("test-default").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_is_a_network_failure() {
        let h = harness();
        let url = "https://chat.example/static/js/chunk.js";
        h.fetcher.insert(url, 200, "js");
        let handler = handler(Route::Static, RouteConfig::new(StrategyKind::CacheFirst));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.engine.serve(&handler, &script(url), &cancel).await;
        match result {
            Err(StrategyError::Exhausted { source, .. }) => assert!(matches!(source, NetError::Cancelled)),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_request_stops_revalidation() {
        let h = harness();
        let url = "https://chat.example/rooms";
        h.fetcher.insert(url, 200, "v1");
        let handler = handler(Route::Default, RouteConfig::new(StrategyKind::StaleWhileRevalidate));
        let request = Request::parse(url).unwrap();
        h.engine
            .serve(&handler, &request, &CancellationToken::new())
            .await
            .unwrap();

        h.fetcher.insert(url, 200, "v2");
        let cancel = CancellationToken::new();
        let stale = h.engine.serve(&handler, &request, &cancel).await.unwrap();
        assert_eq!(stale.response.body, "v1");

        // The page goes away before the refresh gets to run.
        cancel.cancel();
        stale.revalidation.unwrap().await.unwrap();

        let caches = h.caches.read().await;
        let entry = caches
            .get("test-default")
            .unwrap()
            .get(&request.cache_key())
            .unwrap();
        assert_eq!(entry.body, "v1");
    }

    #[tokio::test]
    async fn test_expiry_follows_route_config_after_reload() {
        let h = harness();
        let url = "https://chat.example/static/js/app.js";
        let request = script(url);
        let response = HttpResponse::new(Url::parse(url).unwrap(), http::StatusCode::OK, "old");
        {
            // A partition loaded from disk carries no limits of its own.
            let mut caches = h.caches.write().await;
            caches
                .open("test-static", crate::cache::PartitionLimits::default())
                .put(CacheEntry::from_response(&request.cache_key(), &response, 0));
        }
        h.fetcher.insert(url, 200, "new");
        let handler = handler(Route::Static, RouteConfig::new(StrategyKind::CacheFirst).max_age_secs(60));

        let served = h.engine.serve(&handler, &request, &CancellationToken::new()).await.unwrap();
        assert_eq!(served.response.body, "new");
    }
}
