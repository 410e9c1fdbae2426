//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use chatkit_common::load_json_config;

use crate::SyncResult;

/// What to do when an append fails while online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnlineFailurePolicy {
    /// Log the failure and lose the message.
    Drop,
    /// Put the message in the outbox for the next drain.
    #[default]
    QueueOnFailure,
}

/// Message sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name of the local store.
    pub store_name: String,
    /// Store partition holding the outbox.
    pub outbox_partition: String,
    pub online_failure_policy: OnlineFailurePolicy,
    /// Directory for the durable store. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Local store quota in bytes.
    pub quota_bytes: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_name: "chat-app".to_string(),
            outbox_partition: "offlineMessages".to_string(),
            online_failure_policy: OnlineFailurePolicy::QueueOnFailure,
            data_dir: None,
            quota_bytes: None,
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file, `$CHATKIT_CONFIG`, or defaults.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        Ok(load_json_config(path)?)
    }
}
