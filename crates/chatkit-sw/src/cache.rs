//! Cache partitions.
//!
//! A partition holds immutable [`CacheEntry`] values behind `Arc`s: writers insert or
//! remove whole entries, readers keep whatever `Arc` they looked up.
//!
//! [`CacheStorage`] can write through to a [`LocalStore`], one store partition per cache
//! partition, so cached responses survive a restart.

use bytes::Bytes;
use hashbrown::HashMap;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use url::Url;

use chatkit_net::{HttpResponse, ResponseSource};
use chatkit_store::{LocalStore, StoreResult};

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Method + URL.
    pub request_key: String,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Milliseconds since the Unix epoch.
    pub stored_at: u64,
    /// Insertion order within the partition.
    seq: u64,
}

impl CacheEntry {
    /// Build an entry from a response.
    pub fn from_response(request_key: &str, response: &HttpResponse, stored_at: u64) -> Self {
        Self {
            request_key: request_key.to_string(),
            url: response.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at,
            seq: 0,
        }
    }

    /// Turn the entry back into a response marked as coming from cache.
    pub fn to_response(&self) -> HttpResponse {
        HttpResponse {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            source: ResponseSource::Cache,
        }
    }

    /// Whether the entry is older than `max_age` at time `now`.
    pub fn is_expired(&self, max_age: Option<Duration>, now: u64) -> bool {
        match max_age {
            Some(max_age) => now.saturating_sub(self.stored_at) > max_age.as_millis() as u64,
            None => false,
        }
    }
}

/// Eviction ceilings of a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionLimits {
    pub max_entries: Option<usize>,
    pub max_age: Option<Duration>,
}

/// A named set of cached responses.
#[derive(Debug, Default)]
pub struct Partition {
    pub name: String,
    pub limits: PartitionLimits,
    entries: HashMap<String, Arc<CacheEntry>>,
    next_seq: u64,
}

impl Partition {
    pub fn new(name: &str, limits: PartitionLimits) -> Self {
        Self {
            name: name.to_string(),
            limits,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Look up an entry regardless of age.
    pub fn get(&self, request_key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(request_key).cloned()
    }

    /// Look up an entry, treating expired entries as absent.
    pub fn get_fresh(&self, request_key: &str, now: u64) -> Option<Arc<CacheEntry>> {
        self.entries
            .get(request_key)
            .filter(|entry| !entry.is_expired(self.limits.max_age, now))
            .cloned()
    }

    /// Insert (or replace) an entry, then enforce the count ceiling.
    ///
    /// Returns the keys evicted to get back under the ceiling.
    pub fn put(&mut self, mut entry: CacheEntry) -> Vec<String> {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        trace!(partition = %self.name, key = %entry.request_key, "Cache put");
        self.entries.insert(entry.request_key.clone(), Arc::new(entry));
        self.enforce_max_entries()
    }

    fn enforce_max_entries(&mut self) -> Vec<String> {
        let Some(max) = self.limits.max_entries else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        while self.entries.len() > max {
            let oldest = self
                .entries
                .values()
                .min_by_key(|entry| (entry.stored_at, entry.seq))
                .map(|entry| entry.request_key.clone());
            let Some(key) = oldest else { break };
            self.entries.remove(&key);
            debug!(partition = %self.name, key = %key, "Evicted oldest cache entry");
            evicted.push(key);
        }
        evicted
    }

    /// Put back a persisted entry, keeping its insertion order.
    fn restore(&mut self, entry: CacheEntry) {
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.entries.insert(entry.request_key.clone(), Arc::new(entry));
    }

    pub fn delete(&mut self, request_key: &str) -> bool {
        self.entries.remove(request_key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|entry| (entry.stored_at, entry.seq));
        entries.into_iter().map(|e| e.request_key.clone()).collect()
    }
}

/// On-disk form of a [`CacheEntry`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    request_key: String,
    url: Url,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    stored_at: u64,
    seq: u64,
}

impl From<&CacheEntry> for StoredEntry {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            request_key: entry.request_key.clone(),
            url: entry.url.clone(),
            status: entry.status.as_u16(),
            headers: entry
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect(),
            body: entry.body.to_vec(),
            stored_at: entry.stored_at,
            seq: entry.seq,
        }
    }
}

impl StoredEntry {
    fn into_entry(self) -> Option<CacheEntry> {
        let status = StatusCode::from_u16(self.status).ok()?;
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                headers.append(name, value);
            }
        }
        Some(CacheEntry {
            request_key: self.request_key,
            url: self.url,
            status,
            headers,
            body: Bytes::from(self.body),
            stored_at: self.stored_at,
            seq: self.seq,
        })
    }
}

/// All partitions of an origin.
#[derive(Debug, Default)]
pub struct CacheStorage {
    partitions: HashMap<String, Partition>,
    backing: Option<Arc<LocalStore>>,
}

impl CacheStorage {
    /// Storage that lives only in memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every partition of `store` and write all later changes through to it.
    ///
    /// Loaded partitions have no limits until they are opened again. Unreadable entries
    /// are skipped.
    pub async fn load(store: Arc<LocalStore>) -> StoreResult<Self> {
        let mut partitions = HashMap::new();
        for name in store.partitions().await {
            let mut partition = Partition::new(&name, PartitionLimits::default());
            for key in store.keys(&name).await? {
                match store.get_as::<StoredEntry>(&name, &key).await {
                    Ok(Some(stored)) => match stored.into_entry() {
                        Some(entry) => partition.restore(entry),
                        None => warn!(partition = %name, key = %key, "Skipping cache entry with invalid status"),
                    },
                    Ok(None) => {}
                    Err(e) => warn!(partition = %name, key = %key, error = %e, "Skipping unreadable cache entry"),
                }
            }
            debug!(partition = %name, entries = partition.len(), "Loaded cache partition");
            partitions.insert(name, partition);
        }
        Ok(Self {
            partitions,
            backing: Some(store),
        })
    }

    /// Whether changes are written to a store.
    pub fn is_persistent(&self) -> bool {
        self.backing.is_some()
    }

    /// Open a partition in memory, creating it if needed. Limits of an existing partition
    /// are updated.
    ///
    /// Entries put through the returned handle are not persisted; use
    /// [`insert`](Self::insert) for that.
    pub fn open(&mut self, name: &str, limits: PartitionLimits) -> &mut Partition {
        let partition = self
            .partitions
            .entry(name.to_string())
            .or_insert_with(|| Partition::new(name, limits));
        partition.limits = limits;
        partition
    }

    /// Insert an entry into a partition, enforce its limits and persist the change.
    ///
    /// Returns the evicted keys. When the entry cannot be persisted it is removed from
    /// memory again and the error is returned.
    pub async fn insert(&mut self, name: &str, limits: PartitionLimits, entry: CacheEntry) -> StoreResult<Vec<String>> {
        let key = entry.request_key.clone();
        let partition = self.open(name, limits);
        let evicted = partition.put(entry);
        let stored = partition.get(&key).map(|entry| StoredEntry::from(entry.as_ref()));

        let Some(store) = self.backing.clone() else {
            return Ok(evicted);
        };
        if let Some(stored) = stored {
            if let Err(e) = store.set_as(name, &key, &stored).await {
                if let Some(partition) = self.partitions.get_mut(name) {
                    partition.delete(&key);
                }
                return Err(e);
            }
        }
        for evicted_key in &evicted {
            if let Err(e) = store.delete(name, evicted_key).await {
                warn!(partition = name, key = %evicted_key, error = %e, "Failed to delete evicted entry");
            }
        }
        Ok(evicted)
    }

    pub fn get(&self, name: &str) -> Option<&Partition> {
        self.partitions.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.partitions.contains_key(name)
    }

    /// Delete a whole partition.
    pub async fn delete(&mut self, name: &str) -> StoreResult<bool> {
        let existed = self.partitions.remove(name).is_some();
        if let Some(store) = &self.backing {
            store.delete_partition(name).await?;
        }
        Ok(existed)
    }

    /// Partition names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.keys().cloned().collect();
        names.sort();
        names
    }
}
