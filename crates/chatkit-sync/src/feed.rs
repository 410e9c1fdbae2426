//! Live message feed.
//!
//! Each subscription owns a watch on the authoritative log and a task forwarding every
//! snapshot to the subscriber's callback. Subscriptions are independent of each other.

use std::sync::{Arc, Mutex, TryLockError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::log::AuthoritativeLog;
use crate::message::{ConversationId, Message};
use crate::SyncResult;

type Callback = Box<dyn FnMut(&[Message]) + Send>;

/// Delivers ordered conversation snapshots to callbacks.
#[derive(Clone)]
pub struct LiveMessageFeed {
    log: Arc<dyn AuthoritativeLog>,
    shutdown: CancellationToken,
}

impl LiveMessageFeed {
    /// Subscriptions end when `shutdown` is cancelled.
    pub fn new(log: Arc<dyn AuthoritativeLog>, shutdown: CancellationToken) -> Self {
        Self { log, shutdown }
    }

    /// Call `callback` with the full ordered message list of `conversation`, now and after
    /// every new message, until the returned subscription is dropped or unsubscribed.
    pub async fn subscribe<F>(&self, conversation: &ConversationId, callback: F) -> SyncResult<Subscription>
    where
        F: FnMut(&[Message]) + Send + 'static,
    {
        let mut watch = self.log.watch(conversation).await?;
        let callback: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(Some(Box::new(callback))));
        let cancel = self.shutdown.child_token();

        let task = {
            let callback = callback.clone();
            let cancel = cancel.clone();
            let conversation = conversation.clone();
            tokio::spawn(async move {
                loop {
                    let snapshot = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        snapshot = watch.next() => match snapshot {
                            Some(snapshot) => snapshot,
                            None => break,
                        },
                    };
                    let Ok(mut slot) = callback.lock() else { break };
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(callback) = slot.as_mut() else { break };
                    trace!(conversation = %conversation, messages = snapshot.len(), "Delivering snapshot");
                    callback(&snapshot);
                }
                if let Ok(mut slot) = callback.lock() {
                    slot.take();
                }
                debug!(conversation = %conversation, "Feed closed");
            })
        };

        debug!(conversation = %conversation, "Subscribed");
        Ok(Subscription {
            conversation: conversation.clone(),
            callback,
            cancel,
            task: Some(task),
        })
    }
}

impl std::fmt::Debug for LiveMessageFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMessageFeed").finish_non_exhaustive()
    }
}

/// Handle to a feed subscription. Dropping it unsubscribes.
pub struct Subscription {
    conversation: ConversationId,
    callback: Arc<Mutex<Option<Callback>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Stop delivery and release the watch.
    ///
    /// The callback is not called after this returns. Dropping the subscription instead
    /// also stops delivery, but a callback already running on another thread may still
    /// finish. Dropping it from inside its own callback is allowed.
    pub async fn unsubscribe(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn close(&mut self) {
        self.cancel.cancel();
        // A held lock means the callback is running, possibly the one dropping us. The
        // task sees the cancellation once it returns and drops the callback itself.
        match self.callback.try_lock() {
            Ok(mut slot) => {
                slot.take();
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
            }
            Err(TryLockError::WouldBlock) => {}
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("conversation", &self.conversation)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;
    use crate::message::{Author, MessageDraft};
    use chatkit_common::ManualClock;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn draft(conversation: &str, text: &str) -> MessageDraft {
        MessageDraft::new(conversation.into(), &Author::new("u1", "Ada"), text)
    }

    fn collector() -> (impl FnMut(&[Message]) + Send + 'static, mpsc::UnboundedReceiver<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = move |messages: &[Message]| {
            let _ = tx.send(messages.iter().map(|m| m.text.clone()).collect());
        };
        (callback, rx)
    }

    #[tokio::test]
    async fn test_snapshots_in_order() {
        let clock = ManualClock::new(0);
        let log = Arc::new(InMemoryLog::new(Arc::new(clock.clone())));
        let feed = LiveMessageFeed::new(log.clone(), CancellationToken::new());
        let (callback, mut snapshots) = collector();

        let _subscription = feed.subscribe(&"general".into(), callback).await.unwrap();
        assert_eq!(snapshots.recv().await.unwrap(), Vec::<String>::new());

        log.append(&draft("general", "a")).await.unwrap();
        clock.advance(Duration::from_millis(1));
        log.append(&draft("general", "b")).await.unwrap();

        assert_eq!(snapshots.recv().await.unwrap(), vec!["a"]);
        assert_eq!(snapshots.recv().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_subscriptions_are_independent() {
        let log = Arc::new(InMemoryLog::new(Arc::new(ManualClock::new(0))));
        let feed = LiveMessageFeed::new(log.clone(), CancellationToken::new());
        let (first_cb, mut first) = collector();
        let (second_cb, mut second) = collector();

        let first_sub = feed.subscribe(&"general".into(), first_cb).await.unwrap();
        let _second_sub = feed.subscribe(&"general".into(), second_cb).await.unwrap();
        first.recv().await.unwrap();
        second.recv().await.unwrap();

        first_sub.unsubscribe().await;
        log.append(&draft("general", "hello")).await.unwrap();

        assert_eq!(second.recv().await.unwrap(), vec!["hello"]);
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_watch() {
        let log = Arc::new(InMemoryLog::new(Arc::new(ManualClock::new(0))));
        let feed = LiveMessageFeed::new(log.clone(), CancellationToken::new());
        let conversation: ConversationId = "general".into();
        let (callback, _snapshots) = collector();

        let subscription = feed.subscribe(&conversation, callback).await.unwrap();
        assert_eq!(log.watcher_count(&conversation).await, 1);

        subscription.unsubscribe().await;
        assert_eq!(log.watcher_count(&conversation).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let log = Arc::new(InMemoryLog::new(Arc::new(ManualClock::new(0))));
        let shutdown = CancellationToken::new();
        let feed = LiveMessageFeed::new(log.clone(), shutdown.clone());
        let (callback, mut snapshots) = collector();

        let _subscription = feed.subscribe(&"general".into(), callback).await.unwrap();
        snapshots.recv().await.unwrap();

        shutdown.cancel();
        // The task exits and drops the callback, closing the channel.
        assert!(snapshots.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_inside_own_callback() {
        let log = Arc::new(InMemoryLog::new(Arc::new(ManualClock::new(0))));
        let feed = LiveMessageFeed::new(log.clone(), CancellationToken::new());
        let (tx, mut lengths) = mpsc::unbounded_channel();
        let handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = handle.clone();
        let subscription = feed
            .subscribe(&"general".into(), move |messages: &[Message]| {
                let _ = tx.send(messages.len());
                if !messages.is_empty() {
                    let own = slot.lock().unwrap().take();
                    drop(own);
                }
            })
            .await
            .unwrap();
        assert_eq!(lengths.recv().await, Some(0));
        *handle.lock().unwrap() = Some(subscription);

        log.append(&draft("general", "a")).await.unwrap();
        assert_eq!(lengths.recv().await, Some(1));
        log.append(&draft("general", "b")).await.unwrap();

        // No further snapshot; the callback and its sender are dropped.
        assert_eq!(lengths.recv().await, None);
        assert!(handle.lock().unwrap().is_none());
    }
}
