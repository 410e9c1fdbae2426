//! Worker registration lifecycle.
//!
//! ```text
//! install() ──► installing ──► waiting ──► active
//!                  │              │           │
//!                  └─ failed ─────┴───────────┴──► redundant
//! ```
//!
//! A waiting worker activates when no page is controlled by the current active worker,
//! or immediately once skip-waiting is requested (by its configuration or by a
//! `{"type": "SKIP_WAITING"}` control message). Activation cleans up stale partitions
//! and claims every open page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::worker::{CacheWorker, FetchEvent, FetchOutcome};
use crate::WorkerError;

/// Unique identifier for an installed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique identifier for an open page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Installing,
    /// Installed and waiting for activation.
    Installed,
    Activating,
    Activated,
    /// Replaced, or installation failed.
    Redundant,
}

/// Messages a controlled page may post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    pub fn parse(raw: &str) -> Result<Self, WorkerError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    UpdateFound {
        generation: String,
    },
    StateChange {
        worker_id: WorkerId,
        generation: String,
        state: WorkerState,
    },
    InstallFailed {
        generation: String,
        error: String,
    },
    /// A page is now controlled by the active worker.
    ControllerChange {
        client_id: ClientId,
        worker_id: WorkerId,
    },
}

struct WorkerSlot {
    id: WorkerId,
    state: WorkerState,
    skip_waiting: bool,
    worker: Arc<CacheWorker>,
}

impl WorkerSlot {
    fn generation(&self) -> String {
        self.worker.generation().to_string()
    }
}

#[derive(Default)]
struct RegistrationState {
    installing: Option<WorkerSlot>,
    waiting: Option<WorkerSlot>,
    active: Option<WorkerSlot>,
    /// Open pages and the worker controlling each.
    clients: HashMap<ClientId, Option<WorkerId>>,
}

/// The registration of the cache worker for one scope.
pub struct WorkerRegistration {
    scope: Url,
    state: RwLock<RegistrationState>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: CancellationToken,
}

impl WorkerRegistration {
    /// Create a registration and the receiver for its lifecycle events.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                scope,
                state: RwLock::new(RegistrationState::default()),
                event_tx,
                shutdown: CancellationToken::new(),
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, slot: &mut WorkerSlot, state: WorkerState) {
        slot.state = state;
        debug!(generation = %slot.worker.generation(), state = ?state, "Worker state change");
        self.emit(WorkerEvent::StateChange {
            worker_id: slot.id,
            generation: slot.generation(),
            state,
        });
    }

    fn retire(&self, slot: Option<WorkerSlot>) {
        if let Some(mut slot) = slot {
            self.set_state(&mut slot, WorkerState::Redundant);
        }
    }

    /// Install a new worker generation.
    ///
    /// On success the worker is waiting or, if nothing holds it back, already active.
    pub async fn install(&self, worker: CacheWorker) -> Result<WorkerId, WorkerError> {
        let worker = Arc::new(worker);
        let id = WorkerId::new();
        let generation = worker.generation().to_string();
        self.emit(WorkerEvent::UpdateFound {
            generation: generation.clone(),
        });

        {
            let mut state = self.state.write().await;
            let mut slot = WorkerSlot {
                id,
                state: WorkerState::Installing,
                skip_waiting: worker.config().skip_waiting_on_install,
                worker: worker.clone(),
            };
            self.set_state(&mut slot, WorkerState::Installing);
            let replaced = state.installing.replace(slot);
            self.retire(replaced);
        }

        // The network part of installing runs without holding the registration lock.
        let result = worker.on_install(&self.shutdown.child_token()).await;

        let mut state = self.state.write().await;
        let mut slot = match state.installing.take() {
            Some(slot) if slot.id == id => slot,
            other => {
                state.installing = other;
                warn!(generation = %generation, "Installing worker was replaced before it finished");
                return Err(WorkerError::InstallFailed(format!("{generation} was superseded")));
            }
        };

        if let Err(e) = result {
            warn!(generation = %generation, error = %e, "Worker installation failed");
            self.set_state(&mut slot, WorkerState::Redundant);
            self.emit(WorkerEvent::InstallFailed {
                generation,
                error: e.to_string(),
            });
            return Err(e);
        }

        self.set_state(&mut slot, WorkerState::Installed);
        let replaced = state.waiting.replace(slot);
        self.retire(replaced);

        self.try_activate(&mut state).await;
        Ok(id)
    }

    /// Activate the waiting worker now, even if pages are still controlled by the
    /// active one. Idempotent; returns whether a worker was activated.
    pub async fn skip_waiting(&self) -> bool {
        let mut state = self.state.write().await;
        match state.waiting.as_mut() {
            Some(slot) => slot.skip_waiting = true,
            None => {
                debug!("Skip waiting requested with no waiting worker");
                return false;
            }
        }
        self.try_activate(&mut state).await
    }

    /// Handle a raw control message posted by a page.
    ///
    /// Unknown message types are ignored. Malformed messages are an error.
    pub async fn post_message(&self, raw: &str) -> Result<(), WorkerError> {
        let message = ControlMessage::parse(raw).inspect_err(|e| {
            warn!(error = %e, "Malformed control message");
        })?;
        self.handle_message(message).await;
        Ok(())
    }

    pub async fn handle_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::SkipWaiting => {
                info!("Skip waiting requested by page");
                self.skip_waiting().await;
            }
            ControlMessage::Unknown => debug!("Ignoring unknown control message"),
        }
    }

    /// Register an open page. It is controlled by the active worker, if any.
    pub async fn add_client(&self) -> ClientId {
        let mut state = self.state.write().await;
        let id = ClientId::new();
        let controller = state.active.as_ref().map(|slot| slot.id);
        state.clients.insert(id, controller);
        id
    }

    /// A page closed. The waiting worker may now be able to activate.
    pub async fn remove_client(&self, id: ClientId) {
        let mut state = self.state.write().await;
        state.clients.remove(&id);
        self.try_activate(&mut state).await;
    }

    /// The worker controlling a page.
    pub async fn controller(&self, id: ClientId) -> Option<WorkerId> {
        self.state.read().await.clients.get(&id).copied().flatten()
    }

    pub async fn active_generation(&self) -> Option<String> {
        self.state.read().await.active.as_ref().map(WorkerSlot::generation)
    }

    pub async fn waiting_generation(&self) -> Option<String> {
        self.state.read().await.waiting.as_ref().map(WorkerSlot::generation)
    }

    /// State of a worker that is still installing, waiting or active.
    pub async fn worker_state(&self, id: WorkerId) -> Option<WorkerState> {
        let state = self.state.read().await;
        let found = [&state.installing, &state.waiting, &state.active]
            .into_iter()
            .flatten()
            .find(|slot| slot.id == id)
            .map(|slot| slot.state);
        found
    }

    /// Route a fetch event to the active worker. `None` means the request goes to the
    /// network without interception.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> Option<FetchOutcome> {
        let worker = self.state.read().await.active.as_ref()?.worker.clone();
        worker.on_fetch(event).await
    }

    /// Drop every worker and stop any installation in progress.
    pub async fn unregister(&self) {
        self.shutdown.cancel();
        let mut state = self.state.write().await;
        let installing = state.installing.take();
        let waiting = state.waiting.take();
        let active = state.active.take();
        self.retire(installing);
        self.retire(waiting);
        self.retire(active);
        for controller in state.clients.values_mut() {
            *controller = None;
        }
        info!(scope = %self.scope, "Unregistered");
    }

    async fn try_activate(&self, state: &mut RegistrationState) -> bool {
        let Some(waiting) = state.waiting.as_ref() else {
            return false;
        };
        let active_id = state.active.as_ref().map(|slot| slot.id);
        let pages_held = active_id.is_some()
            && state
                .clients
                .values()
                .any(|controller| *controller == active_id);
        if pages_held && !waiting.skip_waiting {
            debug!(generation = %waiting.worker.generation(), "Waiting for controlled pages to close");
            return false;
        }

        let Some(mut slot) = state.waiting.take() else {
            return false;
        };
        self.set_state(&mut slot, WorkerState::Activating);
        let replaced = state.active.take();
        self.retire(replaced);

        let deleted = slot.worker.on_activate().await;
        self.set_state(&mut slot, WorkerState::Activated);
        info!(generation = %slot.worker.generation(), deleted = deleted.len(), "Worker activated");

        // Claim every open page.
        for (client_id, controller) in state.clients.iter_mut() {
            if *controller != Some(slot.id) {
                *controller = Some(slot.id);
                self.emit(WorkerEvent::ControllerChange {
                    client_id: *client_id,
                    worker_id: slot.id,
                });
            }
        }

        state.active = Some(slot);
        true
    }
}
