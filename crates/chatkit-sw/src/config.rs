//! Cache worker configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chatkit_common::load_json_config;

use crate::classify::Route;
use crate::WorkerError;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Caching strategy bound to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

/// Strategy and partition ceilings for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub strategy: StrategyKind,
    /// Entry-count ceiling; `None` is unbounded.
    pub max_entries: Option<usize>,
    /// Age ceiling in seconds; `None` never expires.
    pub max_age_secs: Option<u64>,
    /// Response statuses that may be written to the partition. `0` is an opaque response.
    pub cacheable_statuses: Vec<u16>,
}

impl RouteConfig {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            max_entries: None,
            max_age_secs: None,
            cacheable_statuses: vec![0, 200],
        }
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn max_age_secs(mut self, secs: u64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }

    pub fn cacheable(mut self, statuses: &[u16]) -> Self {
        self.cacheable_statuses = statuses.to_vec();
        self
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

/// Per-route strategy bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteTable {
    pub manifest: RouteConfig,
    pub static_assets: RouteConfig,
    pub image: RouteConfig,
    pub api: RouteConfig,
    pub default: RouteConfig,
}

impl RouteTable {
    pub fn get(&self, route: Route) -> &RouteConfig {
        match route {
            Route::Manifest => &self.manifest,
            Route::Static => &self.static_assets,
            Route::Image => &self.image,
            Route::Api => &self.api,
            Route::Default => &self.default,
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            manifest: RouteConfig::new(StrategyKind::StaleWhileRevalidate)
                .max_entries(1)
                .max_age_secs(30 * DAY_SECS),
            static_assets: RouteConfig::new(StrategyKind::CacheFirst)
                .max_entries(30)
                .max_age_secs(30 * DAY_SECS)
                .cacheable(&[200]),
            image: RouteConfig::new(StrategyKind::CacheFirst)
                .max_entries(60)
                .max_age_secs(30 * DAY_SECS)
                .cacheable(&[200]),
            api: RouteConfig::new(StrategyKind::NetworkFirst)
                .max_entries(50)
                .max_age_secs(5 * 60),
            default: RouteConfig::new(StrategyKind::StaleWhileRevalidate),
        }
    }
}

/// Cache worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker controls; relative URLs below resolve against it.
    pub scope: String,
    /// Prefix of every partition name.
    pub cache_prefix: String,
    /// Generation identifier of this worker build.
    pub generation: String,
    /// Filename whose requests are routed to the manifest partition.
    pub manifest_filename: String,
    /// Path prefix of API requests.
    pub api_prefix: String,
    /// Application shell document served to offline navigations.
    pub shell_url: String,
    /// Documents cached at install time.
    pub precache_urls: Vec<String>,
    /// Build asset manifest listing hashed `.js`/`.css` files to precache.
    pub asset_manifest_url: Option<String>,
    /// Bound on the network attempt of network-first routes.
    pub network_timeout_ms: u64,
    /// Activate as soon as installation finishes, even while pages are open.
    pub skip_waiting_on_install: bool,
    /// Directory for persistent cache partitions. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    pub routes: RouteTable,
}

impl WorkerConfig {
    /// Load from a JSON file, `$CHATKIT_CONFIG`, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, WorkerError> {
        load_json_config(path).map_err(|e| WorkerError::Config(e.to_string()))
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Partition name for a role in this generation.
    pub fn partition_name(&self, role: &str) -> String {
        format!("{}-{}-{}", self.cache_prefix, role, self.generation)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scope: "http://localhost/".to_string(),
            cache_prefix: "chatkit".to_string(),
            generation: "v1".to_string(),
            manifest_filename: "manifest.json".to_string(),
            api_prefix: "/api/".to_string(),
            shell_url: "/index.html".to_string(),
            precache_urls: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/favicon.ico".to_string(),
                "/chatapp.png".to_string(),
            ],
            asset_manifest_url: Some("/asset-manifest.json".to_string()),
            network_timeout_ms: 5_000,
            skip_waiting_on_install: true,
            data_dir: None,
            routes: RouteTable::default(),
        }
    }
}
