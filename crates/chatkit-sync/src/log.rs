//! The authoritative message log.
//!
//! The remote, append-only, server-ordered store of confirmed messages. The client only
//! appends to it and watches it; [`InMemoryLog`] is a complete in-process implementation
//! used for offline development and tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use chatkit_common::Clock;

use crate::message::{ConversationId, Message, MessageDraft, MessageId};

/// Authoritative log errors. Causes are opaque to the sync layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Log unavailable")]
    Unavailable,

    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// An ordered snapshot of one conversation.
pub type Snapshot = Arc<[Message]>;

/// A standing watch on a conversation.
///
/// Yields the full ordered message list, first immediately and then after every insert.
/// Dropping the watch releases it.
#[derive(Debug)]
pub struct LogWatch {
    rx: mpsc::UnboundedReceiver<Snapshot>,
}

impl LogWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<Snapshot>) -> Self {
        Self { rx }
    }

    /// Next snapshot, or `None` once the log has closed the watch.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }
}

/// The remote message log.
#[async_trait]
pub trait AuthoritativeLog: Send + Sync {
    /// Append a message. The log assigns its id and server timestamp.
    async fn append(&self, draft: &MessageDraft) -> Result<Message, LogError>;

    /// Watch a conversation, ordered ascending by server timestamp.
    async fn watch(&self, conversation: &ConversationId) -> Result<LogWatch, LogError>;
}

#[derive(Default)]
struct LogState {
    conversations: HashMap<ConversationId, Vec<Message>>,
    watchers: HashMap<ConversationId, Vec<mpsc::UnboundedSender<Snapshot>>>,
    next_id: u64,
    last_timestamp: u64,
}

impl LogState {
    fn snapshot(&self, conversation: &ConversationId) -> Snapshot {
        self.conversations
            .get(conversation)
            .map(|messages| Arc::from(messages.as_slice()))
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    fn notify(&mut self, conversation: &ConversationId) {
        let snapshot = self.snapshot(conversation);
        if let Some(watchers) = self.watchers.get_mut(conversation) {
            watchers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }
}

/// In-process authoritative log.
///
/// Server timestamps come from the injected clock and never go backwards. Writes can be
/// made to fail, either all of them while unavailable or a fixed number of upcoming ones.
pub struct InMemoryLog {
    clock: Arc<dyn Clock>,
    state: Mutex<LogState>,
    available: AtomicBool,
    fail_next: AtomicUsize,
    appends: AtomicUsize,
}

impl InMemoryLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(LogState::default()),
            available: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
        }
    }

    /// Make every append fail until set back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` appends fail.
    pub fn fail_next_appends(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of successful appends.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Confirmed messages of a conversation, in order.
    pub async fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.state.lock().await.snapshot(conversation).to_vec()
    }

    /// Number of live watches on a conversation.
    pub async fn watcher_count(&self, conversation: &ConversationId) -> usize {
        let mut state = self.state.lock().await;
        match state.watchers.get_mut(conversation) {
            Some(watchers) => {
                watchers.retain(|tx| !tx.is_closed());
                watchers.len()
            }
            None => 0,
        }
    }

    fn should_fail(&self) -> bool {
        if !self.available.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl std::fmt::Debug for InMemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLog")
            .field("available", &self.available.load(Ordering::SeqCst))
            .field("appends", &self.append_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthoritativeLog for InMemoryLog {
    async fn append(&self, draft: &MessageDraft) -> Result<Message, LogError> {
        if self.should_fail() {
            debug!(conversation = %draft.conversation_id, "Rejecting append");
            return Err(LogError::Unavailable);
        }

        let mut state = self.state.lock().await;
        let timestamp = self.clock.now_millis().max(state.last_timestamp);
        state.last_timestamp = timestamp;
        state.next_id += 1;
        let id = MessageId::new(format!("msg-{:08}", state.next_id));

        let message = Message::confirmed(draft.clone(), id, timestamp);
        let messages = state
            .conversations
            .entry(draft.conversation_id.clone())
            .or_default();
        // Equal timestamps keep insertion order.
        let at = messages.partition_point(|m| m.server_timestamp <= Some(timestamp));
        messages.insert(at, message.clone());

        self.appends.fetch_add(1, Ordering::SeqCst);
        trace!(conversation = %draft.conversation_id, id = ?message.id, timestamp, "Appended message");
        state.notify(&draft.conversation_id);
        Ok(message)
    }

    async fn watch(&self, conversation: &ConversationId) -> Result<LogWatch, LogError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        // A new watch starts with the current snapshot.
        let _ = tx.send(state.snapshot(conversation));
        state.watchers.entry(conversation.clone()).or_default().push(tx);
        debug!(conversation = %conversation, "Watch registered");
        Ok(LogWatch::new(rx))
    }
}
