// Notification dispatcher: resolves subscribers and fans out change events

use crate::dedup::MessageDedup;
use crate::models::{ChangeEvent, DispatchReport};
use crate::notify::MessageTransport;
use crate::subscriptions::SubscriptionStore;
use crate::telemetry;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

pub struct NotificationDispatcher {
    subscriptions: Arc<SubscriptionStore>,
    transport: Arc<dyn MessageTransport>,
    dedup: Option<Arc<MessageDedup>>,
}

impl NotificationDispatcher {
    pub fn new(subscriptions: Arc<SubscriptionStore>, transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            subscriptions,
            transport,
            dedup: None,
        }
    }

    /// Skip messages already delivered for the same site within the
    /// de-duplication window
    pub fn with_dedup(mut self, dedup: Arc<MessageDedup>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Deliver one event to every subscriber of its site
    ///
    /// Each delivery is independent: a failure is logged and counted, and
    /// the remaining subscribers are still attempted. Failed deliveries are
    /// not retried.
    #[instrument(skip(self, event), fields(event_id = %event.id, site = %event.site_name))]
    pub async fn dispatch(&self, event: &ChangeEvent) -> DispatchReport {
        if let Some(dedup) = &self.dedup {
            if dedup.is_duplicate(&event.site_name, &event.formatted_message) {
                info!("Message already sent within de-duplication window, skipping");
                telemetry::record_notification_deduplicated(&event.site_name);
                return DispatchReport {
                    duplicate: true,
                    ..DispatchReport::default()
                };
            }
        }

        let subscribers = self.subscriptions.subscribers_of(&event.site_name);
        if subscribers.is_empty() {
            debug!("Site has no subscribers");
            return DispatchReport::default();
        }

        let deliveries = subscribers.iter().map(|subscriber_id| async move {
            let result = self
                .transport
                .send(subscriber_id, &event.formatted_message)
                .await;
            (subscriber_id, result)
        });

        let mut report = DispatchReport::default();
        for (subscriber_id, result) in join_all(deliveries).await {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    telemetry::record_notification_delivered(&event.site_name);
                }
                Err(e) => {
                    report.failed += 1;
                    telemetry::record_notification_failed(&event.site_name);
                    warn!(subscriber_id = %subscriber_id, error = %e, "Failed to deliver notification");
                }
            }
        }

        if report.delivered > 0 {
            if let Some(dedup) = &self.dedup {
                if let Err(e) = dedup
                    .record(&event.site_name, &event.formatted_message)
                    .await
                {
                    warn!(error = %e, "Failed to record sent message");
                }
            }
        }

        info!(
            delivered = report.delivered,
            failed = report.failed,
            "Change notification dispatched"
        );
        report
    }

    /// Consume events until every sender is dropped
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ChangeEvent>) {
        info!("Notification dispatcher started");
        while let Some(event) = events.recv().await {
            self.dispatch(&event).await;
        }
        info!("Notification dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeliveryError;
    use crate::registry::{SiteConfig, SiteModule, SiteRegistry};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use mockall::mock;
    use serde_json::json;

    mock! {
        pub Transport {}

        #[async_trait]
        impl MessageTransport for Transport {
            async fn send(&self, subscriber_id: &str, message: &str) -> Result<(), DeliveryError>;
        }
    }

    async fn store_with(subscribers: &[&str]) -> Arc<SubscriptionStore> {
        let registry = Arc::new(SiteRegistry::new());
        let module: Arc<dyn SiteModule> = Arc::new(
            SiteConfig::builder("demo")
                .fetch(|| async { Ok(json!(1)) })
                .compare(|a, b| a != b)
                .format(|l| l.to_string())
                .description(|| "demo")
                .schedule(|| "interval:60")
                .build()
                .unwrap(),
        );
        registry.register(module).unwrap();

        let store = SubscriptionStore::open(Arc::new(MemoryStore::new()), registry)
            .await
            .unwrap();
        for id in subscribers {
            store.subscribe(id, "demo").await.unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_failure_for_one_subscriber_does_not_block_others() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|id: &str, _: &str| id == "A")
            .times(1)
            .returning(|_, _| Err(DeliveryError::Unreachable("A".to_string())));
        transport
            .expect_send()
            .withf(|id: &str, msg: &str| id == "B" && msg == "changed!")
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = NotificationDispatcher::new(store_with(&["A", "B"]).await, Arc::new(transport));
        let report = dispatcher.dispatch(&ChangeEvent::new("demo", "changed!")).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.duplicate);
    }

    #[tokio::test]
    async fn test_no_subscribers_sends_nothing() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let dispatcher = NotificationDispatcher::new(store_with(&[]).await, Arc::new(transport));
        let report = dispatcher.dispatch(&ChangeEvent::new("demo", "x")).await;
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_duplicate_message_is_skipped() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(|_, _| Ok(()));

        let dedup = Arc::new(
            MessageDedup::open(Arc::new(MemoryStore::new()), Duration::days(7))
                .await
                .unwrap(),
        );
        let dispatcher =
            NotificationDispatcher::new(store_with(&["A"]).await, Arc::new(transport)).with_dedup(dedup);

        let first = dispatcher.dispatch(&ChangeEvent::new("demo", "same")).await;
        let second = dispatcher.dispatch(&ChangeEvent::new("demo", "same")).await;

        assert_eq!(first.delivered, 1);
        assert!(second.duplicate);
        assert_eq!(second.delivered, 0);
    }

    #[tokio::test]
    async fn test_undelivered_message_is_not_recorded_as_sent() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(2)
            .returning(|_, _| Err(DeliveryError::SendFailed("down".to_string())));

        let dedup = Arc::new(
            MessageDedup::open(Arc::new(MemoryStore::new()), Duration::days(7))
                .await
                .unwrap(),
        );
        let dispatcher = NotificationDispatcher::new(store_with(&["A"]).await, Arc::new(transport))
            .with_dedup(Arc::clone(&dedup));

        dispatcher.dispatch(&ChangeEvent::new("demo", "m")).await;
        assert!(!dedup.is_duplicate("demo", "m"));
        let report = dispatcher.dispatch(&ChangeEvent::new("demo", "m")).await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_run_drains_channel_until_closed() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(3).returning(|_, _| Ok(()));

        let dispatcher = Arc::new(NotificationDispatcher::new(
            store_with(&["A"]).await,
            Arc::new(transport),
        ));
        let (tx, rx) = mpsc::channel(8);
        for n in 0..3 {
            tx.send(ChangeEvent::new("demo", format!("update {}", n)))
                .await
                .unwrap();
        }
        drop(tx);

        dispatcher.run(rx).await;
    }
}
