// Subscription store: subscriber identity <-> subscribed site names
//
// Every mutation is persisted before the call returns. Each subscriber has
// its own lock and its own stored record, so different subscribers never
// contend.

use crate::errors::{StorageError, SubscriptionError};
use crate::models::Subscription;
use crate::registry::SiteRegistry;
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

/// Stored form of one subscriber's subscriptions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SubscriberRecord {
    subscriber_id: String,
    /// site name -> subscribed at
    sites: BTreeMap<String, DateTime<Utc>>,
    /// Set once the record emptied and left the subscriber map
    #[serde(skip)]
    retired: bool,
}

pub struct SubscriptionStore {
    backend: Arc<dyn KeyValueStore>,
    registry: Arc<SiteRegistry>,
    subscribers: DashMap<String, Arc<Mutex<SubscriberRecord>>>,
    by_site: DashMap<String, BTreeSet<String>>,
}

impl SubscriptionStore {
    /// Load every persisted subscriber record
    ///
    /// Fails only when the backend cannot be listed. Individual corrupt
    /// records are logged and skipped.
    #[instrument(skip_all)]
    pub async fn open(
        backend: Arc<dyn KeyValueStore>,
        registry: Arc<SiteRegistry>,
    ) -> Result<Self, StorageError> {
        let store = Self::empty(backend, registry);

        let keys = store.backend.keys().await?;
        let mut loaded = 0usize;
        for key in keys {
            match store.load_record(&key).await {
                Ok(Some(record)) => {
                    for site in record.sites.keys() {
                        store
                            .by_site
                            .entry(site.clone())
                            .or_default()
                            .insert(record.subscriber_id.clone());
                    }
                    store
                        .subscribers
                        .insert(key, Arc::new(Mutex::new(record)));
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(subscriber_id = %key, error = %e, "Skipping unreadable subscription record"),
            }
        }

        info!(subscribers = loaded, "Subscription store loaded");
        Ok(store)
    }

    /// Store over `backend` without loading anything from it
    pub fn empty(backend: Arc<dyn KeyValueStore>, registry: Arc<SiteRegistry>) -> Self {
        Self {
            backend,
            registry,
            subscribers: DashMap::new(),
            by_site: DashMap::new(),
        }
    }

    async fn load_record(&self, key: &str) -> Result<Option<SubscriberRecord>, StorageError> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let record: SubscriberRecord =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        if record.subscriber_id != key {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("record belongs to '{}'", record.subscriber_id),
            });
        }
        Ok(Some(record))
    }

    fn slot(&self, subscriber_id: &str) -> Arc<Mutex<SubscriberRecord>> {
        self.subscribers
            .entry(subscriber_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SubscriberRecord {
                    subscriber_id: subscriber_id.to_string(),
                    ..Default::default()
                }))
            })
            .clone()
    }

    /// Lock the live record of a subscriber, creating it if needed
    ///
    /// A retired record is empty and no longer in the map, so a writer that
    /// raced with its retirement retries against a fresh one.
    async fn lock_live(&self, subscriber_id: &str) -> OwnedMutexGuard<SubscriberRecord> {
        loop {
            let record = self.slot(subscriber_id).lock_owned().await;
            if !record.retired {
                return record;
            }
        }
    }

    async fn persist(&self, record: &SubscriberRecord) -> Result<(), StorageError> {
        if record.sites.is_empty() {
            self.backend.delete(&record.subscriber_id).await
        } else {
            let bytes = serde_json::to_vec_pretty(record)?;
            self.backend.put(&record.subscriber_id, &bytes).await
        }
    }

    /// Persist `updated`, then swap it in and fix up the inverse index
    async fn commit(
        &self,
        current: &mut SubscriberRecord,
        updated: SubscriberRecord,
    ) -> Result<(), StorageError> {
        self.persist(&updated).await?;

        for site in current.sites.keys() {
            if !updated.sites.contains_key(site) {
                if let Some(mut subscribers) = self.by_site.get_mut(site) {
                    subscribers.remove(&updated.subscriber_id);
                }
                self.by_site.remove_if(site, |_, subscribers| subscribers.is_empty());
            }
        }
        for site in updated.sites.keys() {
            if !current.sites.contains_key(site) {
                self.by_site
                    .entry(site.clone())
                    .or_default()
                    .insert(updated.subscriber_id.clone());
            }
        }

        *current = updated;
        if current.sites.is_empty() {
            // The caller holds the live slot, so the map entry is this record
            current.retired = true;
            self.subscribers.remove(&current.subscriber_id);
        }
        Ok(())
    }

    /// Subscribe to a registered, usable site; subscribing twice is a no-op
    #[instrument(skip(self))]
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        site_name: &str,
    ) -> Result<Subscription, SubscriptionError> {
        let site = self
            .registry
            .get(site_name)
            .map_err(|_| SubscriptionError::UnknownSite(site_name.to_string()))?;
        if !site.is_usable() {
            return Err(SubscriptionError::UnknownSite(site_name.to_string()));
        }

        let mut record = self.lock_live(subscriber_id).await;

        if let Some(subscribed_at) = record.sites.get(site_name) {
            debug!("Already subscribed");
            return Ok(Subscription {
                subscriber_id: subscriber_id.to_string(),
                site_name: site_name.to_string(),
                subscribed_at: *subscribed_at,
            });
        }

        let subscribed_at = Utc::now();
        let mut updated = record.clone();
        updated.sites.insert(site_name.to_string(), subscribed_at);
        self.commit(&mut record, updated).await?;

        info!("Subscribed");
        Ok(Subscription {
            subscriber_id: subscriber_id.to_string(),
            site_name: site_name.to_string(),
            subscribed_at,
        })
    }

    /// Remove a subscription; returns whether one existed
    #[instrument(skip(self))]
    pub async fn unsubscribe(
        &self,
        subscriber_id: &str,
        site_name: &str,
    ) -> Result<bool, SubscriptionError> {
        let Some(slot) = self.subscribers.get(subscriber_id).map(|s| s.clone()) else {
            return Ok(false);
        };
        let mut record = slot.lock().await;
        if !record.sites.contains_key(site_name) {
            return Ok(false);
        }

        let mut updated = record.clone();
        updated.sites.remove(site_name);
        self.commit(&mut record, updated).await?;

        info!("Unsubscribed");
        Ok(true)
    }

    /// Subscribe to every usable site; returns the sites newly subscribed
    #[instrument(skip(self))]
    pub async fn subscribe_all(&self, subscriber_id: &str) -> Result<Vec<String>, SubscriptionError> {
        let mut record = self.lock_live(subscriber_id).await;

        let now = Utc::now();
        let mut updated = record.clone();
        let mut added = Vec::new();
        for site in self.registry.usable() {
            if !updated.sites.contains_key(site.name()) {
                updated.sites.insert(site.name().to_string(), now);
                added.push(site.name().to_string());
            }
        }

        if !added.is_empty() {
            self.commit(&mut record, updated).await?;
        }
        info!(added = added.len(), "Subscribed to all usable sites");
        Ok(added)
    }

    /// Drop every subscription of a subscriber; returns how many were removed
    #[instrument(skip(self))]
    pub async fn unsubscribe_all(&self, subscriber_id: &str) -> Result<usize, SubscriptionError> {
        let Some(slot) = self.subscribers.get(subscriber_id).map(|s| s.clone()) else {
            return Ok(0);
        };
        let mut record = slot.lock().await;
        let removed = record.sites.len();
        if removed == 0 {
            return Ok(0);
        }

        let updated = SubscriberRecord {
            subscriber_id: subscriber_id.to_string(),
            ..Default::default()
        };
        self.commit(&mut record, updated).await?;

        info!(removed, "Unsubscribed from all sites");
        Ok(removed)
    }

    /// Subscribers of a site, for fan-out
    pub fn subscribers_of(&self, site_name: &str) -> Vec<String> {
        self.by_site
            .get(site_name)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Site names a subscriber is subscribed to, sorted
    pub async fn sites_of(&self, subscriber_id: &str) -> Vec<String> {
        self.subscriptions_of(subscriber_id)
            .await
            .into_iter()
            .map(|s| s.site_name)
            .collect()
    }

    pub async fn subscriptions_of(&self, subscriber_id: &str) -> Vec<Subscription> {
        let Some(slot) = self.subscribers.get(subscriber_id).map(|s| s.clone()) else {
            return Vec::new();
        };
        let record = slot.lock().await;
        record
            .sites
            .iter()
            .map(|(site_name, subscribed_at)| Subscription {
                subscriber_id: subscriber_id.to_string(),
                site_name: site_name.clone(),
                subscribed_at: *subscribed_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SiteConfig, SiteModule};
    use crate::storage::{FileStore, MemoryStore};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    fn site(name: &str, usable: bool) -> Arc<dyn SiteModule> {
        let display = format!("{} site", name);
        Arc::new(
            SiteConfig::builder(name)
                .fetch(|| async { Ok(json!(1)) })
                .compare(|a, b| a != b)
                .format(|l| l.to_string())
                .description(|| "test")
                .display_name(move || display.clone())
                .schedule(|| "interval:60")
                .check_dependencies(move || usable)
                .build()
                .unwrap(),
        )
    }

    fn registry() -> Arc<SiteRegistry> {
        let registry = Arc::new(SiteRegistry::new());
        registry.register(site("demo", true)).unwrap();
        registry.register(site("news", true)).unwrap();
        registry.register(site("gated", false)).unwrap();
        registry
    }

    async fn memory_store() -> SubscriptionStore {
        SubscriptionStore::open(Arc::new(MemoryStore::new()), registry())
            .await
            .unwrap()
    }

    /// Backend that refuses every write
    struct ReadOnlyStore;

    #[async_trait]
    impl KeyValueStore for ReadOnlyStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("read-only".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("read-only".to_string()))
        }
        async fn keys(&self) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let store = memory_store().await;
        let first = store.subscribe("U1", "demo").await.unwrap();
        let second = store.subscribe("U1", "demo").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.sites_of("U1").await, vec!["demo"]);
        assert_eq!(store.subscribers_of("demo"), vec!["U1"]);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_site_fails_and_changes_nothing() {
        let store = memory_store().await;
        store.subscribe("U1", "demo").await.unwrap();

        let err = store.subscribe("U1", "unknown").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::UnknownSite(s) if s == "unknown"));
        assert_eq!(store.sites_of("U1").await, vec!["demo"]);
    }

    #[tokio::test]
    async fn test_subscribe_unusable_site_fails() {
        let store = memory_store().await;
        let err = store.subscribe("U1", "gated").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::UnknownSite(_)));
        assert!(store.sites_of("U1").await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_missing_is_not_an_error() {
        let store = memory_store().await;
        assert!(!store.unsubscribe("U1", "demo").await.unwrap());

        store.subscribe("U1", "demo").await.unwrap();
        assert!(store.unsubscribe("U1", "demo").await.unwrap());
        assert!(!store.unsubscribe("U1", "demo").await.unwrap());
        assert!(store.subscribers_of("demo").is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_all_skips_unusable_sites() {
        let store = memory_store().await;
        store.subscribe("U1", "news").await.unwrap();

        let added = store.subscribe_all("U1").await.unwrap();
        assert_eq!(added, vec!["demo"]);
        assert_eq!(store.sites_of("U1").await, vec!["demo", "news"]);
        assert!(store.subscribers_of("gated").is_empty());

        // Second call adds nothing
        assert!(store.subscribe_all("U1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_with_nothing_is_noop() {
        let store = memory_store().await;
        assert_eq!(store.unsubscribe_all("U1").await.unwrap(), 0);

        store.subscribe_all("U1").await.unwrap();
        assert_eq!(store.unsubscribe_all("U1").await.unwrap(), 2);
        assert!(store.sites_of("U1").await.is_empty());
        assert!(store.subscribers_of("demo").is_empty());
    }

    #[tokio::test]
    async fn test_emptied_subscriber_is_dropped_from_memory() {
        let store = memory_store().await;
        store.subscribe("U1", "demo").await.unwrap();
        store.subscribe("U2", "news").await.unwrap();

        store.unsubscribe("U1", "demo").await.unwrap();
        assert!(!store.subscribers.contains_key("U1"));
        assert!(!store.by_site.contains_key("demo"));
        assert!(store.by_site.contains_key("news"));

        // A later subscribe starts a fresh record
        store.subscribe("U1", "news").await.unwrap();
        assert_eq!(store.sites_of("U1").await, vec!["news"]);
        assert_eq!(store.unsubscribe_all("U1").await.unwrap(), 1);
        assert!(!store.subscribers.contains_key("U1"));
        assert_eq!(store.subscribers_of("news"), vec!["U2"]);
    }

    #[tokio::test]
    async fn test_long_subscriber_id_persists() {
        let dir = TempDir::new().unwrap();
        let subscriber = format!("aiocqhttp:GroupMessage:{}", "用户".repeat(40));
        assert!(subscriber.len() > 200);
        {
            let backend = Arc::new(FileStore::open(dir.path()).await.unwrap());
            let store = SubscriptionStore::open(backend, registry()).await.unwrap();
            store.subscribe(&subscriber, "demo").await.unwrap();
        }

        let backend = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let store = SubscriptionStore::open(backend, registry()).await.unwrap();
        assert_eq!(store.sites_of(&subscriber).await, vec!["demo"]);
        assert_eq!(store.subscribers_of("demo"), vec![subscriber]);
    }

    #[tokio::test]
    async fn test_inverse_index_tracks_many_subscribers() {
        let store = memory_store().await;
        for id in ["A", "B", "C"] {
            store.subscribe(id, "demo").await.unwrap();
        }
        store.unsubscribe("B", "demo").await.unwrap();

        let mut subscribers = store.subscribers_of("demo");
        subscribers.sort();
        assert_eq!(subscribers, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_persisted_across_restart() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        {
            let backend = Arc::new(FileStore::open(dir.path()).await.unwrap());
            let store = SubscriptionStore::open(backend, Arc::clone(&registry)).await.unwrap();
            store.subscribe("group:42", "demo").await.unwrap();
            store.subscribe("user:7", "news").await.unwrap();
            store.subscribe("user:7", "demo").await.unwrap();
            store.unsubscribe("user:7", "demo").await.unwrap();
        }

        let backend = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let store = SubscriptionStore::open(backend, registry).await.unwrap();
        assert_eq!(store.sites_of("group:42").await, vec!["demo"]);
        assert_eq!(store.sites_of("user:7").await, vec!["news"]);
        assert_eq!(store.subscribers_of("demo"), vec!["group:42"]);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_skipped_on_open() {
        let backend = Arc::new(MemoryStore::new());
        backend.put("bad", b"garbage").await.unwrap();
        backend
            .put(
                "good",
                br#"{"subscriber_id":"good","sites":{"demo":"2024-01-01T00:00:00Z"}}"#,
            )
            .await
            .unwrap();

        let store = SubscriptionStore::open(backend, registry()).await.unwrap();
        assert_eq!(store.sites_of("good").await, vec!["demo"]);
        assert!(store.sites_of("bad").await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_state_unchanged() {
        let store = SubscriptionStore::open(Arc::new(ReadOnlyStore), registry())
            .await
            .unwrap();

        let err = store.subscribe("U1", "demo").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Storage(_)));
        assert!(store.sites_of("U1").await.is_empty());
        assert!(store.subscribers_of("demo").is_empty());
    }
}
