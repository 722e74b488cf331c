// Bootstrap utilities for binary initialization

use crate::config::Settings;
use crate::errors::StorageError;
use crate::notify::MessageTransport;
use crate::plugin::SiteWatch;
use crate::registry::{SiteModule, SiteRegistry};
use crate::sites::{ExampleSite, HttpPageSite};
use crate::storage::{FileStore, KeyValueStore, MemoryStore};
use std::sync::Arc;
use tracing::{info, warn};

pub const CACHE_NAMESPACE: &str = "cache";
pub const SUBSCRIPTIONS_NAMESPACE: &str = "subscriptions";
pub const DEDUP_NAMESPACE: &str = "dedup";

/// Open one storage namespace under `storage.data_dir`
#[tracing::instrument(skip(settings))]
pub async fn open_namespace(
    settings: &Settings,
    namespace: &str,
) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    let dir = settings.storage.data_dir.join(namespace);
    let store = FileStore::open(&dir).await?;
    info!(dir = %dir.display(), "Storage namespace opened");
    Ok(Arc::new(store))
}

/// Registry holding the built-in example site and every configured HTTP site
///
/// Invalid configured sites are logged and skipped.
#[tracing::instrument(skip_all)]
pub fn build_registry(settings: &Settings) -> Arc<SiteRegistry> {
    let registry = Arc::new(SiteRegistry::new());

    let mut modules: Vec<Arc<dyn SiteModule>> = vec![Arc::new(ExampleSite::new())];
    for site in &settings.sites {
        match HttpPageSite::new(site.clone(), settings.scheduler.fetch_timeout_seconds) {
            Ok(module) => modules.push(Arc::new(module)),
            Err(e) => warn!(site = %site.name, error = %e, "Skipping configured site"),
        }
    }

    let registered = registry
        .register_all(modules)
        .into_iter()
        .filter(Result::is_ok)
        .count();
    info!(registered, "Site registry initialized");
    registry
}

/// Wire a [`SiteWatch`] from settings
///
/// An unopenable cache namespace falls back to memory, an unopenable
/// subscription namespace puts the plugin in degraded mode, and an
/// unopenable de-duplication namespace disables de-duplication.
#[tracing::instrument(skip_all)]
pub async fn init_site_watch(
    settings: &Settings,
    transport: Arc<dyn MessageTransport>,
) -> SiteWatch {
    let mut builder = SiteWatch::builder()
        .registry(build_registry(settings))
        .transport(transport)
        .scheduler_config(settings.scheduler.engine_config())
        .event_buffer(settings.scheduler.event_buffer);

    builder = match open_namespace(settings, CACHE_NAMESPACE).await {
        Ok(store) => builder.cache_store(store),
        Err(e) => {
            warn!(error = %e, "Cache storage unavailable, every site will re-seed after a restart");
            builder.cache_store(Arc::new(MemoryStore::new()))
        }
    };

    builder = match open_namespace(settings, SUBSCRIPTIONS_NAMESPACE).await {
        Ok(store) => builder.subscription_store(store),
        Err(e) => builder.subscriptions_unavailable(e),
    };

    if settings.dispatcher.dedup_enabled {
        let window = chrono::Duration::days(i64::from(settings.dispatcher.dedup_window_days));
        builder = match open_namespace(settings, DEDUP_NAMESPACE).await {
            Ok(store) => builder.dedup(store, window),
            Err(e) => {
                warn!(error = %e, "De-duplication storage unavailable, de-duplication disabled");
                builder
            }
        };
    }

    builder.build().await
}
