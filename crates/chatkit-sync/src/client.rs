//! Client facade.
//!
//! [`ChatClient`] ties the sync components to one [`SyncContext`]: the engine and its
//! connectivity listener, the live feed and the auth session.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::context::SyncContext;
use crate::engine::{MessageSyncEngine, SendOutcome};
use crate::feed::{LiveMessageFeed, Subscription};
use crate::identity::{AuthSession, IdentityProvider};
use crate::message::{Author, ConversationId, Message};
use crate::{SyncError, SyncResult};

pub struct ChatClient {
    ctx: SyncContext,
    engine: Arc<MessageSyncEngine>,
    feed: LiveMessageFeed,
    auth: AuthSession,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Start the client: the connectivity listener, plus a drain when the context starts
    /// online so entries left from an earlier session go out.
    pub fn start(ctx: SyncContext, identity: Arc<dyn IdentityProvider>) -> Self {
        let engine = Arc::new(MessageSyncEngine::new(ctx.clone()));
        let listener = engine.spawn();
        if ctx.connectivity.is_online() {
            engine.spawn_drain();
        }
        let feed = LiveMessageFeed::new(ctx.log.clone(), ctx.shutdown_token().clone());

        info!(online = ctx.connectivity.is_online(), "Chat client started");
        Self {
            ctx,
            engine,
            feed,
            auth: AuthSession::new(identity),
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Send as the signed-in user.
    pub async fn send(&self, conversation: &ConversationId, text: &str) -> SyncResult<SendOutcome> {
        let author = self.auth.current_user().ok_or(SyncError::NotSignedIn)?;
        self.send_as(conversation, &author, text).await
    }

    pub async fn send_as(&self, conversation: &ConversationId, author: &Author, text: &str) -> SyncResult<SendOutcome> {
        if self.ctx.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        self.engine.send(conversation, author, text).await
    }

    pub async fn subscribe<F>(&self, conversation: &ConversationId, callback: F) -> SyncResult<Subscription>
    where
        F: FnMut(&[Message]) + Send + 'static,
    {
        if self.ctx.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        self.feed.subscribe(conversation, callback).await
    }

    pub async fn login(&self) -> Option<Author> {
        self.auth.login().await
    }

    pub async fn logout(&self) {
        self.auth.logout().await
    }

    pub fn current_user(&self) -> Option<Author> {
        self.auth.current_user()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.ctx.connectivity
    }

    pub fn engine(&self) -> &Arc<MessageSyncEngine> {
        &self.engine
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Tear the context down and wait for the connectivity listener to stop.
    ///
    /// Queued messages stay in the outbox for the next session.
    pub async fn shutdown(&self) {
        self.ctx.shutdown();
        let listener = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(error = %e, "Connectivity listener ended abnormally");
            }
        }
        debug!("Chat client stopped");
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("ctx", &self.ctx)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}
