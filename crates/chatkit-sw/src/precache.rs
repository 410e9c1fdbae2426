//! Install-time precaching.
//!
//! The install step fetches the application shell documents and the hashed build assets
//! named by the asset manifest, and writes them into the shell partition.

use std::sync::Arc;

use hashbrown::HashMap;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use chatkit_common::{with_cancel, Clock};
use chatkit_net::{Fetcher, HttpResponse, NetError, Request};
use chatkit_store::StoreResult;

use crate::cache::{CacheEntry, CacheStorage, PartitionLimits};
use crate::WorkerError;

/// Build asset manifest: `{"files": {"main.js": "/static/js/main.1a2b.js", ...}}`.
#[derive(Debug, Default, Deserialize)]
pub struct AssetManifest {
    #[serde(default)]
    pub files: HashMap<String, String>,
}

impl AssetManifest {
    pub fn parse(body: &[u8]) -> Result<Self, WorkerError> {
        serde_json::from_slice(body).map_err(|e| WorkerError::AssetManifest(e.to_string()))
    }

    /// Paths of the `.js` and `.css` files, sorted and deduplicated.
    pub fn asset_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .files
            .values()
            .filter(|path| is_precached_asset(path))
            .cloned()
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

fn is_precached_asset(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.ends_with(".js") || path.ends_with(".css")
}

/// What an install step cached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrecacheReport {
    /// Required documents cached.
    pub documents: usize,
    /// Build assets cached.
    pub assets: usize,
    /// Build assets that could not be fetched.
    pub skipped: Vec<String>,
}

/// Fills the shell partition.
pub struct Precacher {
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    caches: Arc<RwLock<CacheStorage>>,
    partition: String,
}

impl Precacher {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
        caches: Arc<RwLock<CacheStorage>>,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            clock,
            caches,
            partition: partition.into(),
        }
    }

    /// Cache every document in `documents`, then the assets listed by `asset_manifest`.
    ///
    /// A document that cannot be fetched, or answers with a non-2xx status, fails the
    /// whole step. Asset manifest problems are logged and skipped.
    pub async fn run(
        &self,
        documents: &[Url],
        asset_manifest: Option<&Url>,
        cancel: &CancellationToken,
    ) -> Result<PrecacheReport, WorkerError> {
        let mut report = PrecacheReport::default();

        for url in documents {
            let response = self
                .fetch_ok(url, cancel)
                .await
                .map_err(|e| WorkerError::InstallFailed(format!("{url}: {e}")))?;
            self.store(url, &response)
                .await
                .map_err(|e| WorkerError::InstallFailed(format!("{url}: {e}")))?;
            report.documents += 1;
        }

        if let Some(manifest_url) = asset_manifest {
            match self.load_asset_manifest(manifest_url, cancel).await {
                Ok(paths) => {
                    for path in paths {
                        let Ok(url) = manifest_url.join(&path) else {
                            warn!(path = %path, "Skipping asset with invalid path");
                            report.skipped.push(path);
                            continue;
                        };
                        let stored = match self.fetch_ok(&url, cancel).await {
                            Ok(response) => self.store(&url, &response).await.map_err(|e| e.to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        match stored {
                            Ok(()) => report.assets += 1,
                            Err(e) => {
                                warn!(url = %url, error = %e, "Failed to precache asset");
                                report.skipped.push(path);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %manifest_url, error = %e, "Failed to load asset manifest");
                }
            }
        }

        info!(
            partition = %self.partition,
            documents = report.documents,
            assets = report.assets,
            skipped = report.skipped.len(),
            "Precache complete"
        );
        Ok(report)
    }

    async fn load_asset_manifest(&self, url: &Url, cancel: &CancellationToken) -> Result<Vec<String>, WorkerError> {
        let response = self
            .fetch_ok(url, cancel)
            .await
            .map_err(|e| WorkerError::AssetManifest(e.to_string()))?;
        let paths = AssetManifest::parse(&response.body)?.asset_paths();
        debug!(url = %url, count = paths.len(), "Loaded asset manifest");
        Ok(paths)
    }

    async fn fetch_ok(&self, url: &Url, cancel: &CancellationToken) -> Result<HttpResponse, NetError> {
        let request = Request::get(url.clone());
        let response = with_cancel(cancel, self.fetcher.fetch(&request))
            .await
            .unwrap_or(Err(NetError::Cancelled))?;
        if !response.ok() {
            return Err(NetError::RequestFailed(format!("status {}", response.status)));
        }
        Ok(response)
    }

    async fn store(&self, url: &Url, response: &HttpResponse) -> StoreResult<()> {
        let key = Request::get(url.clone()).cache_key();
        let entry = CacheEntry::from_response(&key, response, self.clock.now_millis());
        let mut caches = self.caches.write().await;
        caches
            .insert(&self.partition, PartitionLimits::default(), entry)
            .await
            .map(|_| ())
    }
}
