//! # ChatKit Sync
//!
//! Offline-resilient message sync for ChatKit.
//!
//! ## Features
//!
//! - **Send**: straight to the authoritative log while online, into a durable outbox while offline
//! - **Drain**: every reconnect replays the outbox in enqueue order, one drain at a time
//! - **Live feed**: full ordered snapshots of a conversation on every insert
//! - **Identity**: sign-in pass-through with the current user tracked
//!
//! ## Architecture
//!
//! ```text
//! ChatClient
//!     ├── AuthSession ──────────── IdentityProvider
//!     ├── MessageSyncEngine
//!     │       ├── Outbox ────────── LocalStore ("offlineMessages")
//!     │       └── listener ◄─────── ConnectivityMonitor (BecameOnline)
//!     └── LiveMessageFeed ───────── AuthoritativeLog::watch
//!
//! all of the above share one SyncContext
//! ```

use thiserror::Error;

use chatkit_common::ChatKitError;
use chatkit_store::StoreError;

pub mod client;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod engine;
pub mod feed;
pub mod identity;
pub mod log;
pub mod message;
pub mod outbox;

pub use client::ChatClient;
pub use config::{OnlineFailurePolicy, SyncConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use context::SyncContext;
pub use engine::{DrainReport, MessageSyncEngine, SendOutcome};
pub use feed::{LiveMessageFeed, Subscription};
pub use identity::{AuthSession, IdentityError, IdentityProvider, StaticIdentityProvider};
pub use log::{AuthoritativeLog, InMemoryLog, LogError, LogWatch, Snapshot};
pub use message::{Author, ConversationId, Message, MessageDraft, MessageId};
pub use outbox::{Outbox, OutboxEntry, OutboxKey};

/// Sync layer errors.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Authoritative log error: {0}")]
    Log(#[from] LogError),

    #[error("Configuration error: {0}")]
    Config(#[from] ChatKitError),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Sync context has shut down")]
    ShutDown,
}

pub type SyncResult<T> = Result<T, SyncError>;
