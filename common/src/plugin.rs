// Lifecycle facade wiring registry, stores, scheduler and dispatcher
//
// This is the surface the host command layer talks to: subscription
// commands, site listing and the enable/disable hooks.

use crate::cache::ChangeCache;
use crate::dedup::MessageDedup;
use crate::errors::{RegistryError, SchedulerError, StorageError, SubscriptionError};
use crate::models::{SiteListing, SiteState, Subscription, TickOutcome};
use crate::notify::{LogTransport, MessageTransport, NotificationDispatcher};
use crate::registry::{RegisteredSite, SiteModule, SiteRegistry};
use crate::scheduler::{PollingScheduler, SchedulerConfig};
use crate::storage::{KeyValueStore, MemoryStore};
use crate::subscriptions::SubscriptionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Scheduler and dispatcher of an enabled plugin
struct Running {
    scheduler: Arc<PollingScheduler>,
    dispatcher_task: JoinHandle<()>,
}

pub struct SiteWatch {
    registry: Arc<SiteRegistry>,
    cache: Arc<ChangeCache>,
    subscriptions: Arc<SubscriptionStore>,
    dispatcher: Arc<NotificationDispatcher>,
    scheduler_config: SchedulerConfig,
    event_buffer: usize,
    degraded: Option<String>,
    running: Mutex<Option<Running>>,
}

/// Builder for [`SiteWatch`]
///
/// Unset stores default to in-memory ones and the transport defaults to
/// [`LogTransport`].
pub struct SiteWatchBuilder {
    registry: Option<Arc<SiteRegistry>>,
    cache_store: Option<Arc<dyn KeyValueStore>>,
    subscription_store: Result<Option<Arc<dyn KeyValueStore>>, StorageError>,
    dedup: Option<(Arc<dyn KeyValueStore>, chrono::Duration)>,
    transport: Option<Arc<dyn MessageTransport>>,
    scheduler_config: SchedulerConfig,
    event_buffer: usize,
}

impl SiteWatchBuilder {
    pub fn registry(mut self, registry: Arc<SiteRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn subscription_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.subscription_store = Ok(Some(store));
        self
    }

    /// The durable subscription store could not be opened; run degraded
    pub fn subscriptions_unavailable(mut self, error: StorageError) -> Self {
        self.subscription_store = Err(error);
        self
    }

    pub fn dedup(mut self, store: Arc<dyn KeyValueStore>, window: chrono::Duration) -> Self {
        self.dedup = Some((store, window));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Open the stores
    ///
    /// Storage problems never fail the build: an unreadable subscription
    /// store switches to degraded mode and an unreadable de-duplication log
    /// disables de-duplication.
    pub async fn build(self) -> SiteWatch {
        let registry = self.registry.unwrap_or_default();
        let cache_store = self
            .cache_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let cache = Arc::new(ChangeCache::new(cache_store));

        let opened = match self.subscription_store {
            Ok(Some(store)) => SubscriptionStore::open(store, Arc::clone(&registry)).await,
            Ok(None) => Ok(in_memory_subscriptions(Arc::clone(&registry))),
            Err(e) => Err(e),
        };
        let (subscriptions, degraded) = match opened {
            Ok(store) => (store, None),
            Err(e) => {
                error!(error = %e, "Subscription storage unavailable, subscriptions will not survive a restart");
                let store = in_memory_subscriptions(Arc::clone(&registry));
                let warning = format!(
                    "订阅存储不可用，订阅将不会被保存 (subscription storage unavailable: {})",
                    e
                );
                (store, Some(warning))
            }
        };
        let subscriptions = Arc::new(subscriptions);

        let transport = self.transport.unwrap_or_else(|| Arc::new(LogTransport));
        let mut dispatcher = NotificationDispatcher::new(Arc::clone(&subscriptions), transport);
        if let Some((store, window)) = self.dedup {
            match MessageDedup::open(store, window).await {
                Ok(dedup) => dispatcher = dispatcher.with_dedup(Arc::new(dedup)),
                Err(e) => warn!(error = %e, "Message de-duplication disabled"),
            }
        }

        SiteWatch {
            registry,
            cache,
            subscriptions,
            dispatcher: Arc::new(dispatcher),
            scheduler_config: self.scheduler_config,
            event_buffer: self.event_buffer,
            degraded,
            running: Mutex::new(None),
        }
    }
}

fn in_memory_subscriptions(registry: Arc<SiteRegistry>) -> SubscriptionStore {
    SubscriptionStore::empty(Arc::new(MemoryStore::new()), registry)
}

impl SiteWatch {
    pub fn builder() -> SiteWatchBuilder {
        SiteWatchBuilder {
            registry: None,
            cache_store: None,
            subscription_store: Ok(None),
            dedup: None,
            transport: None,
            scheduler_config: SchedulerConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn registry(&self) -> &Arc<SiteRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ChangeCache> {
        &self.cache
    }

    /// User-visible warning while subscriptions are not durable
    pub fn degraded_warning(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    async fn scheduler(&self) -> Option<Arc<PollingScheduler>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| Arc::clone(&running.scheduler))
    }

    pub async fn is_enabled(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start the dispatcher and a schedule for every usable site
    ///
    /// Returns the number of schedules started.
    #[instrument(skip(self))]
    pub async fn on_enable(&self) -> Result<usize, SchedulerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (events_tx, events_rx) = mpsc::channel(self.event_buffer);
        let dispatcher_task = tokio::spawn(Arc::clone(&self.dispatcher).run(events_rx));
        let scheduler = Arc::new(PollingScheduler::new(
            self.scheduler_config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.cache),
            events_tx,
        ));

        let started = scheduler.start_all()?;
        *running = Some(Running {
            scheduler,
            dispatcher_task,
        });

        if let Some(warning) = &self.degraded {
            warn!(warning = %warning, "Running in degraded mode");
        }
        info!(sites = started, "Site watch enabled");
        Ok(started)
    }

    /// Cancel every schedule, drain in-flight ticks, then drain pending
    /// notifications
    #[instrument(skip(self))]
    pub async fn on_disable(&self) -> Result<(), SchedulerError> {
        let Some(Running {
            scheduler,
            mut dispatcher_task,
        }) = self.running.lock().await.take()
        else {
            return Err(SchedulerError::NotRunning);
        };

        scheduler.shutdown().await;
        // Dropping the scheduler closes the event channel once its tasks are gone
        drop(scheduler);

        let grace = Duration::from_secs(self.scheduler_config.shutdown_grace_seconds);
        match tokio::time::timeout(grace, &mut dispatcher_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Dispatcher task failed"),
            Err(_) => {
                error!("Dispatcher did not drain within grace period, aborting");
                dispatcher_task.abort();
            }
        }

        info!("Site watch disabled");
        Ok(())
    }

    /// Register a module at runtime, scheduling it right away when enabled
    #[instrument(skip_all, fields(site = %module.name()))]
    pub async fn register_site(
        &self,
        module: Arc<dyn SiteModule>,
    ) -> Result<Arc<RegisteredSite>, RegistryError> {
        let site = self.registry.register(module)?;
        if let Some(scheduler) = self.scheduler().await {
            if site.is_usable() {
                if let Err(e) = scheduler.start_site(site.name()) {
                    warn!(error = %e, "Failed to schedule new site");
                }
            }
        }
        Ok(site)
    }

    /// Unregister a module, stopping its schedule and dropping its cache entry
    ///
    /// Subscriptions to the site are kept.
    #[instrument(skip(self))]
    pub async fn remove_site(&self, name_or_display: &str) -> Result<(), RegistryError> {
        let site = self.registry.resolve(name_or_display)?;
        self.registry.remove(site.name())?;
        if let Some(scheduler) = self.scheduler().await {
            scheduler.remove_site(site.name()).await;
        }
        if let Err(e) = self.cache.remove(site.name()).await {
            warn!(site = %site.name(), error = %e, "Failed to drop cache entry");
        }
        Ok(())
    }

    /// Re-run every dependency check, starting or stopping flipped sites
    ///
    /// Returns `(site, now_usable)` for each site whose usability changed.
    #[instrument(skip(self))]
    pub async fn refresh_dependencies(&self) -> Vec<(String, bool)> {
        let scheduler = self.scheduler().await;
        let mut flipped = Vec::new();

        for site in self.registry.list() {
            let usable = match self.registry.refresh_usability(site.name()) {
                Ok(Some(usable)) => usable,
                Ok(None) => continue,
                Err(e) => {
                    warn!(site = %site.name(), error = %e, "Failed to refresh dependencies");
                    continue;
                }
            };

            if let Some(scheduler) = &scheduler {
                if usable {
                    if let Err(e) = scheduler.start_site(site.name()) {
                        warn!(site = %site.name(), error = %e, "Failed to schedule site");
                    }
                } else {
                    scheduler.stop_site(site.name()).await;
                }
            }
            flipped.push((site.name().to_string(), usable));
        }
        flipped
    }

    /// Subscribe by site key or display name
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        name_or_display: &str,
    ) -> Result<Subscription, SubscriptionError> {
        let site = self
            .registry
            .resolve(name_or_display)
            .map_err(|_| SubscriptionError::UnknownSite(name_or_display.to_string()))?;
        self.subscriptions.subscribe(subscriber_id, site.name()).await
    }

    /// Unsubscribe by site key or display name
    ///
    /// Names of sites no longer registered are accepted so stale
    /// subscriptions can be removed.
    pub async fn unsubscribe(
        &self,
        subscriber_id: &str,
        name_or_display: &str,
    ) -> Result<bool, SubscriptionError> {
        let site_name = match self.registry.resolve(name_or_display) {
            Ok(site) => site.name().to_string(),
            Err(_) => name_or_display.trim().to_string(),
        };
        self.subscriptions.unsubscribe(subscriber_id, &site_name).await
    }

    pub async fn subscribe_all(&self, subscriber_id: &str) -> Result<Vec<String>, SubscriptionError> {
        self.subscriptions.subscribe_all(subscriber_id).await
    }

    pub async fn unsubscribe_all(&self, subscriber_id: &str) -> Result<usize, SubscriptionError> {
        self.subscriptions.unsubscribe_all(subscriber_id).await
    }

    /// Every registered site in registration order, then subscriptions to
    /// sites that are no longer registered
    pub async fn list_sites(&self, subscriber_id: &str) -> Vec<SiteListing> {
        let mut subscribed = self.subscriptions.sites_of(subscriber_id).await;

        let mut listings: Vec<SiteListing> = self
            .registry
            .list()
            .map(|site| {
                let is_subscribed = subscribed.iter().any(|name| name == site.name());
                SiteListing {
                    name: site.name().to_string(),
                    display_name: site.display_name().to_string(),
                    description: site.description().to_string(),
                    usable: site.is_usable(),
                    registered: true,
                    subscribed: is_subscribed,
                }
            })
            .collect();

        subscribed.retain(|name| !listings.iter().any(|listing| &listing.name == name));
        listings.extend(subscribed.into_iter().map(|name| SiteListing {
            display_name: name.clone(),
            name,
            description: String::new(),
            usable: false,
            registered: false,
            subscribed: true,
        }));
        listings
    }

    /// Run one tick for a site immediately
    pub async fn check_now(&self, name_or_display: &str) -> Result<TickOutcome, SchedulerError> {
        let site = self.registry.resolve(name_or_display)?;
        let scheduler = self.scheduler().await.ok_or(SchedulerError::NotRunning)?;
        scheduler.check_now(site.name()).await
    }

    pub async fn site_state(&self, site_name: &str) -> Option<SiteState> {
        self.scheduler().await?.site_state(site_name)
    }
}
