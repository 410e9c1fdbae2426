//! Partition cleanup across worker generations.

use hashbrown::HashSet;
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;

/// Knows which partitions belong to the current generation.
#[derive(Debug, Clone)]
pub struct GenerationManager {
    generation: String,
    expected: HashSet<String>,
}

impl GenerationManager {
    pub fn new(generation: impl Into<String>, expected: impl IntoIterator<Item = String>) -> Self {
        Self {
            generation: generation.into(),
            expected: expected.into_iter().collect(),
        }
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Whether `name` is one of the current generation's partitions.
    pub fn is_current(&self, name: &str) -> bool {
        self.expected.contains(name)
    }

    /// Delete every partition that is not expected. Returns the deleted names, sorted.
    ///
    /// A partition whose persisted copy cannot be removed is logged and left out of the
    /// result; the next activation tries again.
    pub async fn cleanup(&self, storage: &mut CacheStorage) -> Vec<String> {
        let stale: Vec<String> = storage
            .keys()
            .into_iter()
            .filter(|name| !self.is_current(name))
            .collect();

        let mut deleted = Vec::with_capacity(stale.len());
        for name in stale {
            match storage.delete(&name).await {
                Ok(_) => {
                    debug!(partition = %name, "Deleted stale partition");
                    deleted.push(name);
                }
                Err(e) => warn!(partition = %name, error = %e, "Failed to delete stale partition"),
            }
        }

        if !deleted.is_empty() {
            info!(generation = %self.generation, deleted = deleted.len(), "Removed partitions of earlier generations");
        }
        deleted
    }
}
