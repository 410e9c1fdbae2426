//! Message sync engine.
//!
//! Sends go straight to the authoritative log while online and into the outbox while
//! offline. Every offline→online transition drains the outbox into the log, oldest entry
//! first, with the log stamping each message at drain time.
//!
//! At most one drain runs at a time. A drain requested while another is in flight sets a
//! rerun flag; the running drain picks it up before it returns, so no trigger is lost and no
//! entry is appended twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::OnlineFailurePolicy;
use crate::connectivity::ConnectivityEvent;
use crate::context::SyncContext;
use crate::message::{Author, ConversationId, Message, MessageDraft};
use crate::outbox::{Outbox, OutboxKey};
use crate::SyncResult;

/// What happened to a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank text; nothing was done.
    Ignored,
    /// Appended to the authoritative log.
    Delivered(Message),
    /// Persisted to the outbox.
    Queued(OutboxKey),
    /// The online append failed and the message was discarded.
    Dropped,
}

/// Summary of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Passes over the outbox.
    pub passes: usize,
    /// Entries appended and removed.
    pub delivered: usize,
    /// Entries whose append failed.
    pub failed: usize,
    /// Entries held back behind an earlier failure in the same conversation.
    pub deferred: usize,
}

impl DrainReport {
    fn merge(self, other: DrainReport) -> Self {
        Self {
            passes: self.passes + other.passes,
            delivered: self.delivered + other.delivered,
            failed: self.failed + other.failed,
            deferred: self.deferred + other.deferred,
        }
    }
}

/// Decides per message between the log and the outbox, and drains the outbox.
pub struct MessageSyncEngine {
    ctx: SyncContext,
    outbox: Outbox,
    drain_lock: Mutex<()>,
    rerun: AtomicBool,
}

impl MessageSyncEngine {
    pub fn new(ctx: SyncContext) -> Self {
        let outbox = Outbox::new(ctx.store.clone(), ctx.config.outbox_partition.clone(), ctx.clock.clone());
        Self {
            ctx,
            outbox,
            drain_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Send a message.
    ///
    /// Blank text is ignored. While online the message is appended to the log; a failed
    /// append is handled per [`OnlineFailurePolicy`]. While offline it is queued without
    /// any network attempt. Only a failure to persist to the outbox is an error.
    pub async fn send(&self, conversation: &ConversationId, author: &Author, text: &str) -> SyncResult<SendOutcome> {
        if text.trim().is_empty() {
            trace!(conversation = %conversation, "Ignoring blank message");
            return Ok(SendOutcome::Ignored);
        }

        let draft = MessageDraft::new(conversation.clone(), author, text);
        if !self.ctx.connectivity.is_online() {
            return self.enqueue(draft).await;
        }

        match self.ctx.log.append(&draft).await {
            Ok(message) => {
                debug!(conversation = %conversation, id = ?message.id, "Message delivered");
                Ok(SendOutcome::Delivered(message))
            }
            Err(e) => match self.ctx.config.online_failure_policy {
                OnlineFailurePolicy::Drop => {
                    error!(conversation = %conversation, error = %e, "Failed to send message, message lost");
                    Ok(SendOutcome::Dropped)
                }
                OnlineFailurePolicy::QueueOnFailure => {
                    warn!(conversation = %conversation, error = %e, "Failed to send message, queueing");
                    self.enqueue(draft).await
                }
            },
        }
    }

    async fn enqueue(&self, draft: MessageDraft) -> SyncResult<SendOutcome> {
        let conversation = draft.conversation_id.clone();
        match self.outbox.enqueue(draft).await {
            Ok(entry) => Ok(SendOutcome::Queued(entry.key)),
            Err(e) => {
                error!(conversation = %conversation, error = %e, "Failed to queue message");
                Err(e.into())
            }
        }
    }

    /// Drain the outbox into the authoritative log.
    ///
    /// Returns `None` when another drain is already running; that drain will make another
    /// pass before it finishes.
    pub async fn drain(&self) -> SyncResult<Option<DrainReport>> {
        let mut total: Option<DrainReport> = None;
        loop {
            let Ok(guard) = self.drain_lock.try_lock() else {
                self.rerun.store(true, Ordering::SeqCst);
                debug!("Drain already in progress");
                return Ok(total);
            };
            let result = self.drain_locked().await;
            drop(guard);

            let report = result?;
            total = Some(total.map_or(report, |t| t.merge(report)));

            // A trigger may have arrived after the last check but before the guard dropped.
            if !(self.rerun.load(Ordering::SeqCst) && self.ctx.connectivity.is_online()) {
                return Ok(total);
            }
        }
    }

    async fn drain_locked(&self) -> SyncResult<DrainReport> {
        self.rerun.store(false, Ordering::SeqCst);
        let mut report = DrainReport::default();
        // Keys already tried by this drain. Failed entries wait for the next trigger.
        let mut attempted: HashSet<OutboxKey> = HashSet::new();
        // Conversations with a failed entry; their later entries wait too, keeping order.
        let mut blocked: HashSet<ConversationId> = HashSet::new();

        loop {
            if !self.ctx.connectivity.is_online() {
                debug!("Offline, stopping drain");
                break;
            }

            let pending: Vec<OutboxKey> = self
                .outbox
                .keys()
                .await
                .inspect_err(|e| error!(error = %e, "Failed to list outbox"))?
                .into_iter()
                .filter(|key| !attempted.contains(key))
                .collect();

            if pending.is_empty() {
                if self.rerun.swap(false, Ordering::SeqCst) {
                    attempted.clear();
                    blocked.clear();
                    continue;
                }
                break;
            }

            report.passes += 1;
            self.drain_pass(&pending, &mut blocked, &mut report).await?;
            attempted.extend(pending);
        }

        if report.passes > 0 {
            info!(
                passes = report.passes,
                delivered = report.delivered,
                failed = report.failed,
                deferred = report.deferred,
                "Outbox drained"
            );
        }
        Ok(report)
    }

    async fn drain_pass(
        &self,
        keys: &[OutboxKey],
        blocked: &mut HashSet<ConversationId>,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        for &key in keys {
            if !self.ctx.connectivity.is_online() {
                break;
            }

            let entry = match self.outbox.get(key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    error!(key = %key, error = %e, "Unreadable outbox entry, leaving it in place");
                    report.failed += 1;
                    continue;
                }
            };

            if blocked.contains(&entry.conversation_id) {
                report.deferred += 1;
                continue;
            }

            match self.ctx.log.append(&entry.draft).await {
                Ok(message) => {
                    self.outbox
                        .remove(key)
                        .await
                        .inspect_err(|e| error!(key = %key, error = %e, "Failed to remove drained entry"))?;
                    trace!(key = %key, id = ?message.id, "Drained entry");
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!(key = %key, conversation = %entry.conversation_id, error = %e, "Failed to sync offline message");
                    report.failed += 1;
                    blocked.insert(entry.conversation_id);
                }
            }
        }
        Ok(())
    }

    /// Start draining on every offline→online transition until the context shuts down.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.ctx.connectivity.subscribe();
        let engine = self.clone();
        tokio::spawn(engine.listen(events))
    }

    async fn listen(self: Arc<Self>, mut events: broadcast::Receiver<ConnectivityEvent>) {
        let shutdown = self.ctx.shutdown_token().clone();
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ConnectivityEvent::BecameOnline) => {
                    self.spawn_drain();
                }
                Ok(ConnectivityEvent::WentOffline) => trace!("Went offline"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed connectivity events");
                    if self.ctx.connectivity.is_online() {
                        self.spawn_drain();
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Connectivity listener stopped");
    }

    /// Run a drain in the background.
    pub fn spawn_drain(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.drain().await {
                error!(error = %e, "Outbox drain failed");
            }
        })
    }
}

impl std::fmt::Debug for MessageSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSyncEngine")
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::connectivity::ConnectivityMonitor;
    use crate::log::InMemoryLog;
    use chatkit_common::ManualClock;
    use chatkit_store::{LocalStore, StoreOptions};
    use std::time::Duration;

    struct Harness {
        engine: Arc<MessageSyncEngine>,
        log: Arc<InMemoryLog>,
        connectivity: Arc<ConnectivityMonitor>,
        clock: ManualClock,
    }

    fn harness_with(config: SyncConfig, online: bool, store: LocalStore) -> Harness {
        let clock = ManualClock::new(1_700_000_000_000);
        let log = Arc::new(InMemoryLog::new(Arc::new(clock.clone())));
        let connectivity = Arc::new(ConnectivityMonitor::new(online));
        let ctx = SyncContext::new(
            config,
            Arc::new(store),
            log.clone(),
            connectivity.clone(),
            Arc::new(clock.clone()),
        );
        Harness {
            engine: Arc::new(MessageSyncEngine::new(ctx)),
            log,
            connectivity,
            clock,
        }
    }

    fn harness(online: bool) -> Harness {
        harness_with(SyncConfig::default(), online, LocalStore::in_memory("chat-app"))
    }

    fn ada() -> Author {
        Author::new("u1", "Ada")
    }

    fn texts(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[tokio::test]
    async fn test_blank_text_is_a_no_op() {
        for online in [true, false] {
            let h = harness(online);
            for text in ["", "   ", "\n\t "] {
                let outcome = h.engine.send(&"general".into(), &ada(), text).await.unwrap();
                assert_eq!(outcome, SendOutcome::Ignored);
            }
            assert!(h.engine.outbox().is_empty().await);
            assert_eq!(h.log.append_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_online_send_goes_to_log() {
        let h = harness(true);
        let outcome = h.engine.send(&"general".into(), &ada(), "hi").await.unwrap();
        match outcome {
            SendOutcome::Delivered(message) => assert_eq!(message.server_timestamp, Some(1_700_000_000_000)),
            other => panic!("expected delivery, got {other:?}"),
        }
        assert!(h.engine.outbox().is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_send_is_queued_without_network() {
        let h = harness(false);
        let outcome = h.engine.send(&"general".into(), &ada(), "later").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Queued(_)));
        assert_eq!(h.engine.outbox().len().await, 1);
        assert_eq!(h.log.append_count(), 0);
    }

    #[tokio::test]
    async fn test_online_failure_drop_policy_loses_message() {
        let config = SyncConfig {
            online_failure_policy: OnlineFailurePolicy::Drop,
            ..Default::default()
        };
        let h = harness_with(config, true, LocalStore::in_memory("chat-app"));
        h.log.fail_next_appends(1);

        let outcome = h.engine.send(&"general".into(), &ada(), "lost").await.unwrap();
        assert_eq!(outcome, SendOutcome::Dropped);
        assert!(h.engine.outbox().is_empty().await);
    }

    #[tokio::test]
    async fn test_online_failure_queue_policy_keeps_message() {
        let h = harness(true);
        h.log.fail_next_appends(1);

        let outcome = h.engine.send(&"general".into(), &ada(), "kept").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Queued(_)));

        let report = h.engine.drain().await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(texts(&h.log.messages(&"general".into()).await), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let store = LocalStore::in_memory_with_options("chat-app", StoreOptions { quota_bytes: Some(16) });
        let h = harness_with(SyncConfig::default(), false, store);

        let result = h.engine.send(&"general".into(), &ada(), "does not fit").await;
        assert!(matches!(result, Err(crate::SyncError::Store(_))));
    }

    #[tokio::test]
    async fn test_drain_preserves_enqueue_order_and_restamps() {
        let h = harness(false);
        let general: ConversationId = "general".into();
        for text in ["one", "two", "three"] {
            h.engine.send(&general, &ada(), text).await.unwrap();
            h.clock.advance(Duration::from_millis(1));
        }

        h.clock.advance(Duration::from_secs(60));
        h.connectivity.set_online(true);
        let report = h.engine.drain().await.unwrap().unwrap();

        assert_eq!(report.delivered, 3);
        assert!(h.engine.outbox().is_empty().await);
        let messages = h.log.messages(&general).await;
        assert_eq!(texts(&messages), vec!["one", "two", "three"]);
        // Stamped at drain time, not enqueue time.
        assert!(messages
            .iter()
            .all(|m| m.server_timestamp == Some(1_700_000_060_003)));
    }

    #[tokio::test]
    async fn test_failed_entry_stays_and_blocks_its_conversation() {
        let h = harness(false);
        let general: ConversationId = "general".into();
        let random: ConversationId = "random".into();
        h.engine.send(&general, &ada(), "g1").await.unwrap();
        h.engine.send(&random, &ada(), "r1").await.unwrap();
        h.engine.send(&general, &ada(), "g2").await.unwrap();

        h.connectivity.set_online(true);
        h.log.fail_next_appends(1);
        let report = h.engine.drain().await.unwrap().unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(texts(&h.log.messages(&random).await), vec!["r1"]);
        assert!(h.log.messages(&general).await.is_empty());
        assert_eq!(h.engine.outbox().len().await, 2);

        // Next reconnect retries in order.
        h.engine.drain().await.unwrap();
        assert_eq!(texts(&h.log.messages(&general).await), vec!["g1", "g2"]);
        assert!(h.engine.outbox().is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_stops_when_offline() {
        let h = harness(false);
        h.engine.send(&"general".into(), &ada(), "queued").await.unwrap();

        let report = h.engine.drain().await.unwrap().unwrap();
        assert_eq!(report.passes, 0);
        assert_eq!(h.engine.outbox().len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_drains_never_duplicate() {
        let h = harness(false);
        let general: ConversationId = "general".into();
        for i in 0..20 {
            h.engine.send(&general, &ada(), &format!("m{i}")).await.unwrap();
        }
        h.connectivity.set_online(true);

        let (a, b) = tokio::join!(h.engine.drain(), h.engine.drain());
        let ran = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert!(ran >= 1);

        assert_eq!(h.log.append_count(), 20);
        assert!(h.engine.outbox().is_empty().await);
        let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        let actual: Vec<String> = h.log.messages(&general).await.into_iter().map(|m| m.text).collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_listener_drains_on_reconnect() {
        let h = harness(false);
        let listener = h.engine.spawn();
        h.engine.send(&"general".into(), &ada(), "queued").await.unwrap();

        h.connectivity.set_online(true);
        for _ in 0..100 {
            if h.engine.outbox().is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.log.append_count(), 1);

        h.engine.context().shutdown();
        listener.await.unwrap();
    }
}
