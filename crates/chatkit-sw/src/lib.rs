//! # ChatKit Cache Worker
//!
//! Request interception for the ChatKit installable app: decides per request whether to
//! answer from a cache partition or the network, and what to answer when neither works.
//!
//! ## Features
//!
//! - **Classification**: ordered rules map each request to one route
//! - **Strategies**: cache-first, network-first (with timeout), stale-while-revalidate
//! - **Partitions**: per-route entry-count and age ceilings, FIFO eviction, lazy expiry
//! - **Offline fallback**: cached shell for navigations, network error otherwise
//! - **Lifecycle**: install-time precache, generation cleanup on activation, skip-waiting
//!
//! ## Architecture
//!
//! ```text
//! WorkerRegistration
//!     ├── installing / waiting / active (CacheWorker per generation)
//!     └── clients (open pages)
//!
//! CacheWorker
//!     ├── on_install  ── Precacher ──► shell partition
//!     ├── on_activate ── GenerationManager ──► delete stale partitions
//!     └── on_fetch    ── RequestClassifier ──► CacheStrategyEngine ──► OfflineFallback
//!
//! CacheStorage
//!     ├── Partition "{prefix}-{role}-{generation}"
//!     │       └── request key → Arc<CacheEntry>
//!     └── LocalStore (optional, one store partition per cache partition)
//! ```

use thiserror::Error;

pub mod cache;
pub mod classify;
pub mod config;
pub mod fallback;
pub mod generation;
pub mod precache;
pub mod registration;
pub mod strategy;
pub mod worker;

pub use cache::{CacheEntry, CacheStorage, Partition, PartitionLimits};
pub use classify::{RequestClassifier, Route, RoutePredicate, RouteRule};
pub use config::{RouteConfig, RouteTable, StrategyKind, WorkerConfig};
pub use fallback::{offline_page, OfflineFallback};
pub use generation::GenerationManager;
pub use precache::{AssetManifest, PrecacheReport, Precacher};
pub use registration::{ClientId, ControlMessage, WorkerEvent, WorkerId, WorkerRegistration, WorkerState};
pub use strategy::{CacheStrategyEngine, RouteHandler, Served, StrategyError};
pub use worker::{CacheWorker, FetchEvent, FetchOutcome, SHELL_ROLE};

/// Errors that can occur in cache worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Invalid asset manifest: {0}")]
    AssetManifest(String),

    #[error("Cache store error: {0}")]
    Store(#[from] chatkit_store::StoreError),

    #[error("Invalid control message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}
