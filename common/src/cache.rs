// Change-detection cache: site name -> last-seen snapshot and timestamps
//
// Writes for one site are serialised by the scheduler's per-site execution
// slot, so the cache only has to be safe across different site names.

use crate::errors::StorageError;
use crate::models::{CacheEntry, Snapshot};
use crate::storage::KeyValueStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Durable per-site cache with an in-memory read-through layer
pub struct ChangeCache {
    backend: Arc<dyn KeyValueStore>,
    entries: DashMap<String, CacheEntry>,
}

impl ChangeCache {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            entries: DashMap::new(),
        }
    }

    /// Current entry for a site, `None` when there is no prior data
    ///
    /// An unreadable or corrupt stored entry is treated as absent so the
    /// next tick re-seeds it.
    #[instrument(skip(self))]
    pub async fn read(&self, site_name: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.entries.get(site_name) {
            return Some(entry.clone());
        }

        let bytes = match self.backend.get(site_name).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(site = %site_name, error = %e, "Cache entry unreadable, treating as first observation");
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.site_name == site_name => {
                self.entries.insert(site_name.to_string(), entry.clone());
                Some(entry)
            }
            Ok(entry) => {
                warn!(
                    site = %site_name,
                    stored_site = %entry.site_name,
                    "Cache entry belongs to another site, treating as first observation"
                );
                None
            }
            Err(e) => {
                warn!(site = %site_name, error = %e, "Cache entry corrupt, treating as first observation");
                None
            }
        }
    }

    /// Replace a site's entry with a freshly fetched snapshot
    ///
    /// `last_checked_at` always advances; `last_changed_at` moves only when
    /// `changed` is set.
    #[instrument(skip(self, snapshot))]
    pub async fn write(
        &self,
        site_name: &str,
        snapshot: Snapshot,
        changed: bool,
    ) -> Result<CacheEntry, StorageError> {
        let previous = self.read(site_name).await;
        let checked_at = next_check_time(previous.as_ref());

        let entry = CacheEntry {
            site_name: site_name.to_string(),
            snapshot,
            last_checked_at: checked_at,
            last_changed_at: if changed {
                Some(checked_at)
            } else {
                previous.and_then(|p| p.last_changed_at)
            },
        };

        self.persist(&entry).await?;
        debug!(site = %site_name, changed, "Cache entry written");
        Ok(entry)
    }

    /// Advance `last_checked_at` of an existing entry, leaving the snapshot
    /// and `last_changed_at` untouched
    ///
    /// Used after a failed fetch. Returns `None` when there is no entry yet.
    #[instrument(skip(self))]
    pub async fn touch(&self, site_name: &str) -> Result<Option<CacheEntry>, StorageError> {
        let Some(mut entry) = self.read(site_name).await else {
            return Ok(None);
        };
        entry.last_checked_at = next_check_time(Some(&entry));
        self.persist(&entry).await?;
        Ok(Some(entry))
    }

    /// Drop a site's entry, used when its module leaves the registry
    #[instrument(skip(self))]
    pub async fn remove(&self, site_name: &str) -> Result<(), StorageError> {
        self.backend.delete(site_name).await?;
        self.entries.remove(site_name);
        Ok(())
    }

    async fn persist(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(entry)?;
        self.backend.put(&entry.site_name, &bytes).await?;
        self.entries.insert(entry.site_name.clone(), entry.clone());
        Ok(())
    }
}

/// Wall-clock now, bumped past the previous check so the sequence of
/// `last_checked_at` values is strictly increasing per site
fn next_check_time(previous: Option<&CacheEntry>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev.last_checked_at => prev.last_checked_at + Duration::milliseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStore, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn memory_cache() -> (ChangeCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ChangeCache::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_read_absent() {
        let (cache, _) = memory_cache();
        assert!(cache.read("demo").await.is_none());
    }

    #[tokio::test]
    async fn test_seed_write_has_no_change_time() {
        let (cache, _) = memory_cache();
        let entry = cache.write("demo", json!({"n": 1}), false).await.unwrap();
        assert_eq!(entry.last_changed_at, None);
        assert_eq!(cache.read("demo").await.unwrap().snapshot, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_unchanged_write_keeps_change_time_and_advances_check() {
        let (cache, _) = memory_cache();
        let first = cache.write("demo", json!(1), true).await.unwrap();
        let second = cache.write("demo", json!(1), false).await.unwrap();

        assert!(second.last_checked_at > first.last_checked_at);
        assert_eq!(second.last_changed_at, first.last_changed_at);
    }

    #[tokio::test]
    async fn test_changed_write_moves_change_time() {
        let (cache, _) = memory_cache();
        cache.write("demo", json!(1), false).await.unwrap();
        let changed = cache.write("demo", json!(2), true).await.unwrap();
        assert_eq!(changed.last_changed_at, Some(changed.last_checked_at));
    }

    #[tokio::test]
    async fn test_touch_only_advances_check_time() {
        let (cache, _) = memory_cache();
        assert!(cache.touch("demo").await.unwrap().is_none());

        let seeded = cache.write("demo", json!("s1"), false).await.unwrap();
        let touched = cache.touch("demo").await.unwrap().unwrap();
        assert!(touched.last_checked_at > seeded.last_checked_at);
        assert_eq!(touched.snapshot, seeded.snapshot);
        assert_eq!(touched.last_changed_at, seeded.last_changed_at);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_treated_as_absent() {
        let store = Arc::new(MemoryStore::new());
        store.put("broken", b"{not json").await.unwrap();
        store
            .put(
                "fine",
                &serde_json::to_vec(&CacheEntry {
                    site_name: "fine".to_string(),
                    snapshot: json!(7),
                    last_checked_at: Utc::now(),
                    last_changed_at: None,
                })
                .unwrap(),
            )
            .await
            .unwrap();

        let cache = ChangeCache::new(store);
        assert!(cache.read("broken").await.is_none());
        assert_eq!(cache.read("fine").await.unwrap().snapshot, json!(7));

        // Re-seeding overwrites the corrupt entry
        cache.write("broken", json!(1), false).await.unwrap();
        assert_eq!(cache.read("broken").await.unwrap().snapshot, json!(1));
    }

    #[tokio::test]
    async fn test_survives_restart_with_file_store() {
        let dir = TempDir::new().unwrap();
        {
            let cache = ChangeCache::new(Arc::new(FileStore::open(dir.path()).await.unwrap()));
            cache.write("demo", json!({"title": "S1"}), false).await.unwrap();
        }
        let cache = ChangeCache::new(Arc::new(FileStore::open(dir.path()).await.unwrap()));
        assert_eq!(
            cache.read("demo").await.unwrap().snapshot,
            json!({"title": "S1"})
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let (cache, store) = memory_cache();
        cache.write("demo", json!(1), false).await.unwrap();
        cache.remove("demo").await.unwrap();
        assert!(cache.read("demo").await.is_none());
        assert!(store.is_empty());
    }
}
