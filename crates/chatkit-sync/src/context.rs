//! The sync context.
//!
//! Everything the sync components share, constructed once at startup and handed to each
//! component. [`SyncContext::shutdown`] tears it down: background tasks watching the
//! shutdown token stop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use chatkit_common::{Clock, SystemClock};
use chatkit_store::{LocalStore, StoreOptions};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::log::AuthoritativeLog;
use crate::SyncResult;

/// Shared state of the sync layer.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<SyncConfig>,
    pub store: Arc<LocalStore>,
    pub log: Arc<dyn AuthoritativeLog>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        store: Arc<LocalStore>,
        log: Arc<dyn AuthoritativeLog>,
        connectivity: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            log,
            connectivity,
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a context from configuration: a durable store under `data_dir` (in memory
    /// when unset) and the system clock.
    pub async fn open(config: SyncConfig, log: Arc<dyn AuthoritativeLog>, initially_online: bool) -> SyncResult<Self> {
        let options = StoreOptions {
            quota_bytes: config.quota_bytes,
        };
        let store = match &config.data_dir {
            Some(dir) => LocalStore::open(&config.store_name, dir, options).await?,
            None => LocalStore::in_memory_with_options(&config.store_name, options),
        };
        info!(
            store = %config.store_name,
            persistent = store.is_persistent(),
            online = initially_online,
            "Opened sync context"
        );
        Ok(Self::new(
            config,
            Arc::new(store),
            log,
            Arc::new(ConnectivityMonitor::new(initially_online)),
            Arc::new(SystemClock),
        ))
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down sync context");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .field("online", &self.connectivity.is_online())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
