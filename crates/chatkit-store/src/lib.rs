//! # ChatKit Store
//!
//! Persistent local key-value store backing the message outbox and the cache worker's
//! partitions.
//!
//! ## Features
//!
//! - **Partitions**: named, isolated key spaces (`offlineMessages`, ...)
//! - **Ordered keys**: `keys()` returns keys in ascending lexical order
//! - **Per-key atomicity**: every `set`/`delete` is applied and flushed as one unit
//! - **Durability**: optional file backing, one JSON document per partition
//! - **Quota**: optional ceiling on the total encoded size of all records
//!
//! ## Architecture
//!
//! ```text
//! LocalStore ("chat-app")
//!     │
//!     ├── Partition ("offlineMessages")
//!     │       └── key → JSON value
//!     │
//!     └── <root>/chat-app/offlineMessages.json   (when file-backed)
//! ```

use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, trace};

// ==================== Errors ====================

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid partition name: {0}")]
    InvalidPartition(String),

    #[error("Quota exceeded: {used} + {requested} bytes > {quota} bytes")]
    QuotaExceeded {
        used: usize,
        requested: usize,
        quota: usize,
    },

    #[error("Corrupt partition {partition}: {source}")]
    Corrupt {
        partition: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ==================== Options ====================

/// Store options.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Maximum total encoded size of all records, in bytes.
    pub quota_bytes: Option<usize>,
}

// ==================== Partition ====================

#[derive(Debug, Default)]
struct Partition {
    records: BTreeMap<String, JsonValue>,
    bytes: usize,
}

impl Partition {
    fn from_records(records: BTreeMap<String, JsonValue>) -> Self {
        let bytes = records
            .iter()
            .map(|(k, v)| record_size(k, v))
            .sum();
        Self { records, bytes }
    }
}

fn record_size(key: &str, value: &JsonValue) -> usize {
    key.len() + value.to_string().len()
}

fn validate_partition_name(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPartition(name.to_string()))
    }
}

// ==================== LocalStore ====================

/// A named local store made of partitions.
#[derive(Debug)]
pub struct LocalStore {
    name: String,
    dir: Option<PathBuf>,
    options: StoreOptions,
    partitions: RwLock<HashMap<String, Partition>>,
}

impl LocalStore {
    /// Create a store that lives only in memory.
    pub fn in_memory(name: &str) -> Self {
        Self::in_memory_with_options(name, StoreOptions::default())
    }

    /// Create an in-memory store with options.
    pub fn in_memory_with_options(name: &str, options: StoreOptions) -> Self {
        Self {
            name: name.to_string(),
            dir: None,
            options,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a file-backed store under `root/<name>/`.
    ///
    /// Every `*.json` file in that directory is loaded as a partition.
    pub async fn open(name: &str, root: impl AsRef<Path>, options: StoreOptions) -> StoreResult<Self> {
        validate_partition_name(name)?;
        let dir = root.as_ref().join(name);
        tokio::fs::create_dir_all(&dir).await?;

        let mut partitions = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(partition) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            let data = tokio::fs::read(&path).await?;
            let records: BTreeMap<String, JsonValue> =
                serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
                    partition: partition.clone(),
                    source,
                })?;
            debug!(store = name, partition = %partition, records = records.len(), "Loaded partition");
            partitions.insert(partition, Partition::from_records(records));
        }

        Ok(Self {
            name: name.to_string(),
            dir: Some(dir),
            options,
            partitions: RwLock::new(partitions),
        })
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether writes are flushed to disk.
    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Get a value.
    pub async fn get(&self, partition: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .and_then(|p| p.records.get(key))
            .cloned())
    }

    /// Get a value and decode it.
    pub async fn get_as<T: DeserializeOwned>(&self, partition: &str, key: &str) -> StoreResult<Option<T>> {
        match self.get(partition, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Set a value, replacing any previous value under `key`.
    pub async fn set(&self, partition: &str, key: &str, value: JsonValue) -> StoreResult<()> {
        validate_partition_name(partition)?;
        let mut partitions = self.partitions.write().await;

        let requested = record_size(key, &value);
        let replaced = partitions
            .get(partition)
            .and_then(|p| p.records.get(key))
            .map(|old| record_size(key, old))
            .unwrap_or(0);

        if let Some(quota) = self.options.quota_bytes {
            let used: usize = partitions.values().map(|p| p.bytes).sum::<usize>() - replaced;
            if used + requested > quota {
                error!(store = %self.name, partition, key, used, requested, quota, "Store quota exceeded");
                return Err(StoreError::QuotaExceeded {
                    used,
                    requested,
                    quota,
                });
            }
        }

        let entry = partitions.entry(partition.to_string()).or_default();
        let previous = entry.records.insert(key.to_string(), value);
        entry.bytes = entry.bytes - replaced + requested;

        if let Err(e) = self.flush(partition, entry).await {
            // Roll back so memory never runs ahead of disk.
            match previous {
                Some(old) => {
                    entry.records.insert(key.to_string(), old);
                }
                None => {
                    entry.records.remove(key);
                }
            }
            entry.bytes = entry.bytes + replaced - requested;
            return Err(e);
        }

        trace!(store = %self.name, partition, key, "Set record");
        Ok(())
    }

    /// Encode and set a value.
    pub async fn set_as<T: Serialize>(&self, partition: &str, key: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(partition, key, value).await
    }

    /// Delete a value. Returns whether it existed.
    pub async fn delete(&self, partition: &str, key: &str) -> StoreResult<bool> {
        let mut partitions = self.partitions.write().await;
        let Some(entry) = partitions.get_mut(partition) else {
            return Ok(false);
        };
        let Some(old) = entry.records.remove(key) else {
            return Ok(false);
        };
        let size = record_size(key, &old);
        entry.bytes -= size;

        if let Err(e) = self.flush(partition, entry).await {
            entry.records.insert(key.to_string(), old);
            entry.bytes += size;
            return Err(e);
        }

        trace!(store = %self.name, partition, key, "Deleted record");
        Ok(true)
    }

    /// All keys of a partition in ascending order. Unknown partitions are empty.
    pub async fn keys(&self, partition: &str) -> StoreResult<Vec<String>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .map(|p| p.records.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Number of records in a partition.
    pub async fn count(&self, partition: &str) -> usize {
        let partitions = self.partitions.read().await;
        partitions.get(partition).map(|p| p.records.len()).unwrap_or(0)
    }

    /// Names of all partitions, sorted.
    pub async fn partitions(&self) -> Vec<String> {
        let partitions = self.partitions.read().await;
        let mut names: Vec<String> = partitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop a whole partition. Returns whether it existed.
    pub async fn delete_partition(&self, partition: &str) -> StoreResult<bool> {
        let mut partitions = self.partitions.write().await;
        if partitions.remove(partition).is_none() {
            return Ok(false);
        }
        if let Some(path) = self.partition_path(partition) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(store = %self.name, partition, "Deleted partition");
        Ok(true)
    }

    fn partition_path(&self, partition: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{partition}.json")))
    }

    /// Write a partition to disk via a temp file and rename.
    async fn flush(&self, partition: &str, entry: &Partition) -> StoreResult<()> {
        let Some(path) = self.partition_path(partition) else {
            return Ok(());
        };
        let data = serde_json::to_vec(&entry.records)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
