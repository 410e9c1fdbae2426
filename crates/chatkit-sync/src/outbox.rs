//! Durable outbox.
//!
//! Messages waiting for the authoritative log, stored in one partition of the local store.
//! Keys are enqueue times in milliseconds, made unique by bumping past the last key, and
//! zero-padded so the store's key order is enqueue order.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use chatkit_common::Clock;
use chatkit_store::{LocalStore, StoreResult};

use crate::message::{ConversationId, Message, MessageDraft};

/// Outbox key: enqueue time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxKey(u64);

impl OutboxKey {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn millis(&self) -> u64 {
        self.0
    }

    /// The store key.
    pub fn encode(&self) -> String {
        format!("{:020}", self.0)
    }

    pub fn decode(key: &str) -> Option<Self> {
        key.parse().ok().map(Self)
    }
}

impl fmt::Display for OutboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub key: OutboxKey,
    pub conversation_id: ConversationId,
    pub draft: MessageDraft,
    pub local_enqueue_timestamp: u64,
}

impl OutboxEntry {
    /// The provisional message this entry represents.
    pub fn to_message(&self) -> Message {
        Message::provisional(self.draft.clone(), self.local_enqueue_timestamp)
    }
}

/// The outbox.
pub struct Outbox {
    store: Arc<LocalStore>,
    partition: String,
    clock: Arc<dyn Clock>,
    /// Highest key handed out; loaded from the store on first use.
    last_key: Mutex<Option<u64>>,
}

impl Outbox {
    pub fn new(store: Arc<LocalStore>, partition: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            partition: partition.into(),
            clock,
            last_key: Mutex::new(None),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Persist a draft under a fresh key.
    pub async fn enqueue(&self, draft: MessageDraft) -> StoreResult<OutboxEntry> {
        // Held across the write so keys reach the store in the order they were issued.
        let mut last_key = self.last_key.lock().await;
        let last = match *last_key {
            Some(last) => last,
            None => self.stored_max_key().await?,
        };

        let now = self.clock.now_millis();
        let key = OutboxKey(now.max(last.saturating_add(1)));
        let entry = OutboxEntry {
            key,
            conversation_id: draft.conversation_id.clone(),
            draft,
            local_enqueue_timestamp: now,
        };

        self.store.set_as(&self.partition, &key.encode(), &entry).await?;
        *last_key = Some(key.0);
        debug!(key = %key, conversation = %entry.conversation_id, "Queued message");
        Ok(entry)
    }

    async fn stored_max_key(&self) -> StoreResult<u64> {
        Ok(self.keys().await?.last().map(OutboxKey::millis).unwrap_or(0))
    }

    /// All keys in ascending order.
    pub async fn keys(&self) -> StoreResult<Vec<OutboxKey>> {
        let raw = self.store.keys(&self.partition).await?;
        let mut keys: Vec<OutboxKey> = raw
            .iter()
            .filter_map(|key| {
                let decoded = OutboxKey::decode(key);
                if decoded.is_none() {
                    warn!(partition = %self.partition, key = %key, "Ignoring foreign outbox key");
                }
                decoded
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub async fn get(&self, key: OutboxKey) -> StoreResult<Option<OutboxEntry>> {
        self.store.get_as(&self.partition, &key.encode()).await
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn remove(&self, key: OutboxKey) -> StoreResult<bool> {
        self.store.delete(&self.partition, &key.encode()).await
    }

    /// All entries in key order. Unreadable entries are skipped.
    pub async fn entries(&self) -> StoreResult<Vec<OutboxEntry>> {
        let mut entries = Vec::new();
        for key in self.keys().await? {
            match self.get(key).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable outbox entry"),
            }
        }
        Ok(entries)
    }

    pub async fn len(&self) -> usize {
        self.store.count(&self.partition).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("store", &self.store.name())
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}
