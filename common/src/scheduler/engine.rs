// Polling scheduler implementation

use crate::cache::ChangeCache;
use crate::errors::{FetchError, SchedulerError};
use crate::models::{ChangeEvent, SiteState, TickOutcome};
use crate::registry::{RegisteredSite, SiteRegistry};
use crate::telemetry;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on fetches in flight across all sites
    pub max_concurrent_fetches: usize,
    /// A fetch running longer than this counts as failed (in seconds)
    pub fetch_timeout_seconds: u64,
    /// How long shutdown waits for in-flight ticks before aborting them (in seconds)
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            fetch_timeout_seconds: 30,
            shutdown_grace_seconds: 10,
        }
    }
}

/// State shared by every site task and manual checks
struct TickContext {
    registry: Arc<SiteRegistry>,
    cache: Arc<ChangeCache>,
    events: mpsc::Sender<ChangeEvent>,
    fetch_permits: Semaphore,
    fetch_timeout: Duration,
    /// Per-site execution slot; a tick holds it from fetch to notify
    slots: DashMap<String, Arc<Mutex<()>>>,
    states: DashMap<String, SiteState>,
}

impl TickContext {
    fn slot(&self, site_name: &str) -> Arc<Mutex<()>> {
        self.slots
            .entry(site_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn set_state(&self, site_name: &str, state: SiteState) {
        self.states.insert(site_name.to_string(), state);
    }

    async fn tick(&self, site: &RegisteredSite, cancel: &mut watch::Receiver<bool>) -> TickOutcome {
        let outcome = self.run_tick(site, cancel).await;
        telemetry::record_tick(site.name(), outcome.as_str());
        debug!(site = %site.name(), outcome = outcome.as_str(), "Tick finished");
        self.set_state(site.name(), SiteState::Idle);
        outcome
    }

    async fn run_tick(
        &self,
        site: &RegisteredSite,
        cancel: &mut watch::Receiver<bool>,
    ) -> TickOutcome {
        let name = site.name();

        let slot = self.slot(name);
        let _exclusive = tokio::select! {
            biased;
            _ = cancelled(cancel) => return TickOutcome::Aborted,
            guard = slot.lock() => guard,
        };

        self.set_state(name, SiteState::Fetching);
        let started = Instant::now();
        let fetched = {
            let _permit = tokio::select! {
                biased;
                _ = cancelled(cancel) => return TickOutcome::Aborted,
                permit = self.fetch_permits.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return TickOutcome::Aborted,
                },
            };
            tokio::select! {
                biased;
                _ = cancelled(cancel) => return TickOutcome::Aborted,
                result = timeout(self.fetch_timeout, site.module().fetch()) => result
                    .unwrap_or_else(|_| Err(FetchError::Timeout(self.fetch_timeout.as_secs()))),
            }
        };
        telemetry::record_fetch_duration(name, started.elapsed().as_secs_f64());

        let latest = match fetched {
            Ok(latest) => latest,
            Err(e) => {
                warn!(site = %name, error = %e, "Fetch failed, keeping cached snapshot");
                telemetry::record_fetch_failure(name);
                if is_cancelled(cancel) {
                    return TickOutcome::Aborted;
                }
                if let Err(e) = self.cache.touch(name).await {
                    warn!(site = %name, error = %e, "Failed to record check time");
                }
                return TickOutcome::FetchFailed;
            }
        };

        self.set_state(name, SiteState::Comparing);
        let previous = self.cache.read(name).await;
        let changed = previous
            .as_ref()
            .map(|entry| site.module().compare(&entry.snapshot, &latest))
            .unwrap_or(false);
        let message = changed.then(|| site.module().format(&latest));

        // Nothing is written once cancellation has been observed
        if is_cancelled(cancel) {
            return TickOutcome::Aborted;
        }
        if let Err(e) = self.cache.write(name, latest, changed).await {
            warn!(site = %name, error = %e, "Failed to write cache entry");
        }

        if previous.is_none() {
            info!(site = %name, "Cache seeded");
            return TickOutcome::Seeded;
        }
        let Some(message) = message else {
            return TickOutcome::Unchanged;
        };

        self.set_state(name, SiteState::Notifying);
        let event = ChangeEvent::new(name, message);
        info!(site = %name, event_id = %event.id, "Change detected");
        if self.events.send(event).await.is_err() {
            warn!(site = %name, "Dispatcher is gone, change event dropped");
        }
        TickOutcome::Changed
    }
}

/// Resolves once the watch value is `true`; never resolves if the sender
/// goes away without cancelling
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Fixed-rate loop for one site; the first tick runs immediately
async fn run_site(
    ctx: Arc<TickContext>,
    site: Arc<RegisteredSite>,
    mut cancel: watch::Receiver<bool>,
) {
    info!(site = %site.name(), schedule = %site.schedule(), "Site schedule started");
    let mut deadline = Instant::now();
    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            _ = sleep_until(deadline) => {}
        }
        ctx.tick(&site, &mut cancel).await;
        deadline = site.schedule().next_deadline(deadline, Instant::now());
    }
    info!(site = %site.name(), "Site schedule stopped");
}

struct SiteTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns one independent, cancellable schedule per usable site
pub struct PollingScheduler {
    config: SchedulerConfig,
    ctx: Arc<TickContext>,
    tasks: DashMap<String, SiteTask>,
    /// Ticks started by `check_now`, drained on shutdown like site tasks
    manual: SyncMutex<JoinSet<()>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl PollingScheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<SiteRegistry>,
        cache: Arc<ChangeCache>,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(TickContext {
            registry,
            cache,
            events,
            fetch_permits: Semaphore::new(config.max_concurrent_fetches.max(1)),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_seconds),
            slots: DashMap::new(),
            states: DashMap::new(),
        });

        Self {
            config,
            ctx,
            tasks: DashMap::new(),
            manual: SyncMutex::new(JoinSet::new()),
            running: AtomicBool::new(true),
            shutdown_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the schedule of one site
    ///
    /// Returns `Ok(false)` when the site is already scheduled.
    #[instrument(skip(self))]
    pub fn start_site(&self, site_name: &str) -> Result<bool, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        let site = self.ctx.registry.get(site_name)?;
        if !site.is_usable() {
            self.ctx.set_state(site_name, SiteState::Disabled);
            return Err(SchedulerError::SiteUnusable(site_name.to_string()));
        }

        let started = match self.tasks.entry(site_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (cancel, cancel_rx) = watch::channel(false);
                self.ctx.set_state(site_name, SiteState::Idle);
                let handle = tokio::spawn(run_site(Arc::clone(&self.ctx), site, cancel_rx));
                vacant.insert(SiteTask { cancel, handle });
                true
            }
        };

        telemetry::update_scheduled_sites(self.tasks.len());
        Ok(started)
    }

    /// Start every usable site; unusable sites are marked disabled
    ///
    /// Returns the number of schedules started.
    pub fn start_all(&self) -> Result<usize, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        let mut started = 0;
        for site in self.ctx.registry.list() {
            match self.start_site(site.name()) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(SchedulerError::SiteUnusable(_)) => {
                    debug!(site = %site.name(), "Site disabled, not scheduling");
                }
                Err(e) => warn!(site = %site.name(), error = %e, "Failed to start site schedule"),
            }
        }
        info!(started, "Site schedules started");
        Ok(started)
    }

    /// Stop one site's schedule, waiting for an in-flight tick to wind down
    ///
    /// Returns whether the site was scheduled.
    #[instrument(skip(self))]
    pub async fn stop_site(&self, site_name: &str) -> bool {
        let Some((_, task)) = self.tasks.remove(site_name) else {
            return false;
        };
        telemetry::update_scheduled_sites(self.tasks.len());

        task.cancel.send_replace(true);
        let deadline = Instant::now() + self.grace();
        drain(site_name, task.handle, deadline).await;
        self.ctx.set_state(site_name, SiteState::Disabled);
        true
    }

    /// Stop a site leaving the registry and drop its slot and state
    ///
    /// Returns whether the site was scheduled.
    #[instrument(skip(self))]
    pub async fn remove_site(&self, site_name: &str) -> bool {
        let was_scheduled = self.stop_site(site_name).await;
        self.ctx.slots.remove(site_name);
        self.ctx.states.remove(site_name);
        was_scheduled
    }

    /// Run one tick now, serialised with the site's scheduled ticks
    #[instrument(skip(self))]
    pub async fn check_now(&self, site_name: &str) -> Result<TickOutcome, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        let site = self.ctx.registry.get(site_name)?;
        if !site.is_usable() {
            return Err(SchedulerError::SiteUnusable(site_name.to_string()));
        }

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut manual = self.manual.lock();
            // Checked under the lock so shutdown sees every spawned tick
            if !self.is_running() {
                return Err(SchedulerError::NotRunning);
            }
            while manual.try_join_next().is_some() {}

            let ctx = Arc::clone(&self.ctx);
            let mut cancel = self.shutdown_tx.subscribe();
            manual.spawn(async move {
                let outcome = ctx.tick(&site, &mut cancel).await;
                let _ = done_tx.send(outcome);
            });
        }

        // A tick aborted at shutdown drops its sender
        Ok(done_rx.await.unwrap_or(TickOutcome::Aborted))
    }

    pub fn site_state(&self, site_name: &str) -> Option<SiteState> {
        self.ctx.states.get(site_name).map(|state| *state)
    }

    pub fn is_scheduled(&self, site_name: &str) -> bool {
        self.tasks.contains_key(site_name)
    }

    /// Names of scheduled sites, sorted
    pub fn scheduled_sites(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|task| task.key().clone()).collect();
        names.sort();
        names
    }

    /// Cancel every schedule and wait for in-flight ticks
    ///
    /// Ticks still running after the grace period are aborted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(sites = self.tasks.len(), "Stopping scheduler");
        self.shutdown_tx.send_replace(true);

        let names: Vec<String> = self.tasks.iter().map(|task| task.key().clone()).collect();
        let tasks: Vec<(String, SiteTask)> = names
            .into_iter()
            .filter_map(|name| self.tasks.remove(&name))
            .collect();
        for (_, task) in &tasks {
            task.cancel.send_replace(true);
        }

        let deadline = Instant::now() + self.grace();
        for (name, task) in tasks {
            drain(&name, task.handle, deadline).await;
        }

        let mut manual = std::mem::take(&mut *self.manual.lock());
        let drained = timeout_at(deadline, async {
            while manual.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            error!(
                checks = manual.len(),
                "Manual checks did not stop within grace period, aborting"
            );
            manual.abort_all();
        }

        for mut state in self.ctx.states.iter_mut() {
            *state = SiteState::Stopped;
        }
        telemetry::update_scheduled_sites(0);
        info!("Scheduler stopped");
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_grace_seconds)
    }
}

async fn drain(site_name: &str, mut handle: JoinHandle<()>, deadline: Instant) {
    match timeout_at(deadline, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(site = %site_name, error = %e, "Site task failed"),
        Err(_) => {
            error!(site = %site_name, "Site task did not stop within grace period, aborting");
            handle.abort();
        }
    }
}
