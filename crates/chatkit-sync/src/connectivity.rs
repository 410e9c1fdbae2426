//! Connectivity monitor.
//!
//! Holds the current online/offline state and broadcasts an event on every edge. There is
//! no debouncing: flapping produces one event per transition.

use tokio::sync::{broadcast, watch};
use tracing::info;

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    WentOffline,
}

const EVENT_CAPACITY: usize = 64;

/// Tracks whether the network is reachable.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state, events }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the platform's reachability signal. Returns whether this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            let event = if online {
                ConnectivityEvent::BecameOnline
            } else {
                ConnectivityEvent::WentOffline
            };
            info!(?event, "Connectivity changed");
            let _ = self.events.send(event);
        }
        changed
    }

    /// Receive every future transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Follow the current state.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
