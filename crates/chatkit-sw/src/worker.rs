//! The cache worker and its hook points.
//!
//! [`CacheWorker`] is one generation of worker code. The registration calls its three
//! hooks: [`on_install`](CacheWorker::on_install), [`on_activate`](CacheWorker::on_activate)
//! and [`on_fetch`](CacheWorker::on_fetch).

use std::sync::Arc;

use http::Method;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use chatkit_common::Clock;
use chatkit_net::{FetchResponse, Fetcher, HttpResponse, Request};
use chatkit_store::{LocalStore, StoreOptions};

use crate::cache::CacheStorage;
use crate::classify::{RequestClassifier, Route};
use crate::config::WorkerConfig;
use crate::fallback::OfflineFallback;
use crate::generation::GenerationManager;
use crate::precache::{PrecacheReport, Precacher};
use crate::strategy::{CacheStrategyEngine, RouteHandler};
use crate::WorkerError;

/// Role name of the install-time partition.
pub const SHELL_ROLE: &str = "shell";

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    /// Cancelled when the page that issued the request goes away.
    pub cancel: CancellationToken,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(request: Request, cancel: CancellationToken) -> Self {
        Self { request, cancel }
    }
}

/// Result of handling a fetch event.
#[derive(Debug)]
pub struct FetchOutcome {
    pub route: Route,
    pub response: FetchResponse,
    /// Stale-while-revalidate refresh still running after the response was returned.
    pub revalidation: Option<JoinHandle<()>>,
}

/// One generation of the cache worker.
pub struct CacheWorker {
    config: WorkerConfig,
    scope: Url,
    classifier: RequestClassifier,
    handlers: [RouteHandler; 5],
    engine: CacheStrategyEngine,
    fallback: OfflineFallback,
    generations: GenerationManager,
    precacher: Precacher,
    caches: Arc<RwLock<CacheStorage>>,
}

impl CacheWorker {
    /// Create a worker with its own empty cache storage.
    pub fn new(config: WorkerConfig, fetcher: Arc<dyn Fetcher>, clock: Arc<dyn Clock>) -> Result<Self, WorkerError> {
        Self::with_storage(config, fetcher, clock, Arc::new(RwLock::new(CacheStorage::new())))
    }

    /// Create a worker whose partitions persist under `config.data_dir`, reloading what an
    /// earlier process stored there. Without a data directory this is [`CacheWorker::new`].
    pub async fn open(config: WorkerConfig, fetcher: Arc<dyn Fetcher>, clock: Arc<dyn Clock>) -> Result<Self, WorkerError> {
        let storage = match config.data_dir {
            Some(ref dir) => {
                let store = LocalStore::open(&config.cache_prefix, dir, StoreOptions::default()).await?;
                let storage = CacheStorage::load(Arc::new(store)).await?;
                info!(dir = %dir.display(), partitions = storage.keys().len(), "Opened cache storage");
                storage
            }
            None => CacheStorage::new(),
        };
        Self::with_storage(config, fetcher, clock, Arc::new(RwLock::new(storage)))
    }

    /// Create a worker over existing cache storage, typically shared with the
    /// generation it replaces.
    pub fn with_storage(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
        caches: Arc<RwLock<CacheStorage>>,
    ) -> Result<Self, WorkerError> {
        let scope = Url::parse(&config.scope)
            .map_err(|e| WorkerError::Config(format!("invalid scope {:?}: {e}", config.scope)))?;
        let shell_url = scope
            .join(&config.shell_url)
            .map_err(|e| WorkerError::Config(format!("invalid shell url {:?}: {e}", config.shell_url)))?;

        let handlers = Route::ALL.map(|route| RouteHandler {
            route,
            partition: config.partition_name(route.as_str()),
            config: config.routes.get(route).clone(),
        });

        let shell_partition = config.partition_name(SHELL_ROLE);
        let expected = handlers
            .iter()
            .map(|handler| handler.partition.clone())
            .chain(std::iter::once(shell_partition.clone()))
            .collect::<Vec<_>>();

        Ok(Self {
            classifier: RequestClassifier::new(&config.manifest_filename, &config.api_prefix),
            engine: CacheStrategyEngine::new(caches.clone(), fetcher.clone(), clock.clone(), config.network_timeout()),
            fallback: OfflineFallback::new(shell_partition.clone(), &shell_url),
            generations: GenerationManager::new(config.generation.clone(), expected),
            precacher: Precacher::new(fetcher, clock, caches.clone(), shell_partition),
            handlers,
            caches,
            scope,
            config,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn generation(&self) -> &str {
        &self.config.generation
    }

    pub fn caches(&self) -> &Arc<RwLock<CacheStorage>> {
        &self.caches
    }

    /// Partition names belonging to this generation, sorted.
    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .map(|handler| handler.partition.clone())
            .chain(std::iter::once(self.config.partition_name(SHELL_ROLE)))
            .collect();
        names.sort();
        names
    }

    /// Resolve a scope-relative path.
    pub fn resolve(&self, path: &str) -> Result<Url, WorkerError> {
        self.scope
            .join(path)
            .map_err(|e| WorkerError::Config(format!("invalid url {path:?}: {e}")))
    }

    /// Install hook: precache the shell documents and build assets.
    pub async fn on_install(&self, cancel: &CancellationToken) -> Result<PrecacheReport, WorkerError> {
        info!(generation = %self.generation(), "Installing cache worker");
        let documents = self
            .config
            .precache_urls
            .iter()
            .map(|path| self.resolve(path))
            .collect::<Result<Vec<_>, _>>()?;
        let asset_manifest = self
            .config
            .asset_manifest_url
            .as_deref()
            .map(|path| self.resolve(path))
            .transpose()?;

        self.precacher.run(&documents, asset_manifest.as_ref(), cancel).await
    }

    /// Activate hook: delete partitions of other generations.
    pub async fn on_activate(&self) -> Vec<String> {
        info!(generation = %self.generation(), "Activating cache worker");
        let mut caches = self.caches.write().await;
        self.generations.cleanup(&mut caches).await
    }

    /// Fetch hook.
    ///
    /// Returns `None` for requests the worker does not intercept (anything but GET); the
    /// page then goes to the network directly. URLs cached at install time are answered
    /// from the shell partition ahead of any route strategy.
    pub async fn on_fetch(&self, event: &FetchEvent) -> Option<FetchOutcome> {
        let request = &event.request;
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Not intercepting");
            return None;
        }

        let route = self.classifier.classify(request);
        if let Some(response) = self.precached(request).await {
            debug!(url = %request.url, route = %route, "Serving precached response");
            return Some(FetchOutcome {
                route,
                response: FetchResponse::Http(response),
                revalidation: None,
            });
        }

        let handler = &self.handlers[route as usize];

        let outcome = match self.engine.serve(handler, request, &event.cancel).await {
            Ok(served) => FetchOutcome {
                route,
                response: FetchResponse::Http(served.response),
                revalidation: served.revalidation,
            },
            Err(e) => {
                debug!(url = %request.url, route = %route, error = %e, "Falling back");
                FetchOutcome {
                    route,
                    response: self.fallback.resolve(request, &self.caches).await,
                    revalidation: None,
                }
            }
        };
        Some(outcome)
    }

    async fn precached(&self, request: &Request) -> Option<HttpResponse> {
        let caches = self.caches.read().await;
        caches
            .get(&self.config.partition_name(SHELL_ROLE))?
            .get(&request.cache_key())
            .map(|entry| entry.to_response())
    }
}

impl std::fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWorker")
            .field("generation", &self.config.generation)
            .field("scope", &self.scope.as_str())
            .finish_non_exhaustive()
    }
}
