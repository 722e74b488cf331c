// Message de-duplication: a site never re-sends the same message within
// the configured window

use crate::errors::StorageError;
use crate::storage::KeyValueStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

type SentLog = HashMap<String, DateTime<Utc>>;

/// Per-site log of message digests and when they were sent
pub struct MessageDedup {
    backend: Arc<dyn KeyValueStore>,
    window: Duration,
    sent: DashMap<String, SentLog>,
}

impl MessageDedup {
    /// Load and prune every stored site log
    #[instrument(skip_all, fields(window_days = window.num_days()))]
    pub async fn open(backend: Arc<dyn KeyValueStore>, window: Duration) -> Result<Self, StorageError> {
        let dedup = Self {
            backend,
            window,
            sent: DashMap::new(),
        };

        let cutoff = Utc::now() - window;
        let mut total = 0usize;
        for site in dedup.backend.keys().await? {
            let bytes = match dedup.backend.get(&site).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(site = %site, error = %e, "Discarding unreadable sent-message log");
                    continue;
                }
            };
            let mut log: SentLog = match serde_json::from_slice(&bytes) {
                Ok(log) => log,
                Err(e) => {
                    warn!(site = %site, error = %e, "Discarding corrupt sent-message log");
                    continue;
                }
            };
            let before = log.len();
            log.retain(|_, sent_at| *sent_at > cutoff);
            total += log.len();
            if log.len() != before {
                dedup.persist(&site, &log).await?;
            }
            dedup.sent.insert(site, log);
        }

        info!(messages = total, "Loaded recently sent message digests");
        Ok(dedup)
    }

    pub fn digest(message: &str) -> String {
        hex::encode(Sha256::digest(message.as_bytes()))
    }

    /// Whether `message` was already sent for `site` inside the window
    pub fn is_duplicate(&self, site: &str, message: &str) -> bool {
        let digest = Self::digest(message);
        let cutoff = Utc::now() - self.window;
        self.sent
            .get(site)
            .and_then(|log| log.get(&digest).copied())
            .map(|sent_at| sent_at > cutoff)
            .unwrap_or(false)
    }

    /// Remember that `message` was sent for `site`, pruning expired digests
    #[instrument(skip(self, message))]
    pub async fn record(&self, site: &str, message: &str) -> Result<(), StorageError> {
        let now = Utc::now();
        let cutoff = now - self.window;

        let log = {
            let mut log = self.sent.entry(site.to_string()).or_default();
            log.retain(|_, sent_at| *sent_at > cutoff);
            log.insert(Self::digest(message), now);
            log.clone()
        };

        self.persist(site, &log).await?;
        debug!(site = %site, tracked = log.len(), "Recorded sent message");
        Ok(())
    }

    async fn persist(&self, site: &str, log: &SentLog) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(log)?;
        self.backend.put(site, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_records_and_detects_duplicates_per_site() {
        let dedup = MessageDedup::open(Arc::new(MemoryStore::new()), Duration::days(7))
            .await
            .unwrap();

        assert!(!dedup.is_duplicate("demo", "update #1"));
        dedup.record("demo", "update #1").await.unwrap();
        assert!(dedup.is_duplicate("demo", "update #1"));
        assert!(!dedup.is_duplicate("demo", "update #2"));
        assert!(!dedup.is_duplicate("other", "update #1"));
    }

    #[tokio::test]
    async fn test_expired_digests_are_pruned_on_open() {
        let backend = Arc::new(MemoryStore::new());
        let mut log = SentLog::new();
        log.insert(MessageDedup::digest("old"), Utc::now() - Duration::days(8));
        log.insert(MessageDedup::digest("fresh"), Utc::now() - Duration::days(1));
        backend
            .put("demo", &serde_json::to_vec(&log).unwrap())
            .await
            .unwrap();

        let dedup = MessageDedup::open(backend.clone(), Duration::days(7))
            .await
            .unwrap();
        assert!(!dedup.is_duplicate("demo", "old"));
        assert!(dedup.is_duplicate("demo", "fresh"));

        let stored: SentLog =
            serde_json::from_slice(&backend.get("demo").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let backend = Arc::new(MemoryStore::new());
        {
            let dedup = MessageDedup::open(backend.clone(), Duration::days(7))
                .await
                .unwrap();
            dedup.record("demo", "hello").await.unwrap();
        }
        let dedup = MessageDedup::open(backend, Duration::days(7)).await.unwrap();
        assert!(dedup.is_duplicate("demo", "hello"));
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let digest = MessageDedup::digest("abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, MessageDedup::digest("abc"));
    }
}
