// Registry of available site modules

use crate::errors::RegistryError;
use crate::registry::SiteModule;
use crate::schedule::ScheduleSpec;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A validated module together with its parsed schedule and usability flag
pub struct RegisteredSite {
    name: String,
    display_name: String,
    description: String,
    schedule: ScheduleSpec,
    usable: AtomicBool,
    module: Arc<dyn SiteModule>,
}

impl RegisteredSite {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schedule(&self) -> &ScheduleSpec {
        &self.schedule
    }

    pub fn module(&self) -> &Arc<dyn SiteModule> {
        &self.module
    }

    /// Dependencies were available at the last evaluation
    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RegisteredSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSite")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("schedule", &self.schedule)
            .field("usable", &self.is_usable())
            .finish()
    }
}

/// Site module registry, ordered by registration
///
/// Modules with unmet dependencies stay registered and listed but are
/// reported as unusable.
#[derive(Default)]
pub struct SiteRegistry {
    sites: RwLock<Vec<Arc<RegisteredSite>>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a module
    ///
    /// Fails with `InvalidModule` on an empty or malformed name, an empty
    /// display name, an unparsable schedule, or a name/display-name
    /// collision with an existing entry.
    #[instrument(skip_all, fields(site = %module.name()))]
    pub fn register(&self, module: Arc<dyn SiteModule>) -> Result<Arc<RegisteredSite>, RegistryError> {
        let name = module.name().trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::invalid("", "site name is required"));
        }
        if name != module.name() || name.chars().any(char::is_whitespace) {
            return Err(RegistryError::invalid(&name, "site name must not contain whitespace"));
        }

        let display_name = module.display_name().trim().to_string();
        if display_name.is_empty() {
            return Err(RegistryError::invalid(&name, "display name is required"));
        }

        let schedule_text = module.schedule();
        let schedule = ScheduleSpec::parse(&schedule_text, module.timezone())
            .map_err(|e| RegistryError::invalid(&name, e.to_string()))?;

        let usable = module.check_dependencies();

        let site = Arc::new(RegisteredSite {
            name: name.clone(),
            display_name: display_name.clone(),
            description: module.description(),
            schedule,
            usable: AtomicBool::new(usable),
            module,
        });

        {
            let mut sites = self.sites.write();
            for existing in sites.iter() {
                if existing.name == name || existing.display_name == name {
                    return Err(RegistryError::invalid(&name, "site name already registered"));
                }
                if existing.display_name == display_name || existing.name == display_name {
                    return Err(RegistryError::invalid(
                        &name,
                        format!("display name '{}' already registered", display_name),
                    ));
                }
            }
            sites.push(Arc::clone(&site));
        }

        if usable {
            info!(display_name = %display_name, schedule = %site.schedule, "Site module registered");
        } else {
            warn!(
                display_name = %display_name,
                "Site module registered with unavailable dependencies; it will not be scheduled"
            );
        }
        Ok(site)
    }

    /// Register a batch; one invalid module never prevents the others
    pub fn register_all<I>(&self, modules: I) -> Vec<Result<Arc<RegisteredSite>, RegistryError>>
    where
        I: IntoIterator<Item = Arc<dyn SiteModule>>,
    {
        modules
            .into_iter()
            .map(|module| {
                let result = self.register(module);
                if let Err(e) = &result {
                    warn!(error = %e, "Rejected site module");
                }
                result
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<Arc<RegisteredSite>, RegistryError> {
        self.sites
            .read()
            .iter()
            .find(|site| site.name == name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Look a module up by key, then by display name
    pub fn resolve(&self, name_or_display: &str) -> Result<Arc<RegisteredSite>, RegistryError> {
        let needle = name_or_display.trim();
        let sites = self.sites.read();
        sites
            .iter()
            .find(|site| site.name == needle)
            .or_else(|| sites.iter().find(|site| site.display_name == needle))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(needle.to_string()))
    }

    /// Modules in registration order
    ///
    /// Iterates a snapshot taken at call time; call again to restart.
    pub fn list(&self) -> impl Iterator<Item = Arc<RegisteredSite>> {
        self.sites.read().clone().into_iter()
    }

    /// Usable modules in registration order
    pub fn usable(&self) -> impl Iterator<Item = Arc<RegisteredSite>> {
        self.list().filter(|site| site.is_usable())
    }

    /// Unknown sites are not usable
    pub fn is_usable(&self, name: &str) -> bool {
        self.get(name).map(|site| site.is_usable()).unwrap_or(false)
    }

    /// Re-run a module's dependency check
    ///
    /// Returns `Some(new_state)` when usability flipped, `None` otherwise.
    #[instrument(skip(self))]
    pub fn refresh_usability(&self, name: &str) -> Result<Option<bool>, RegistryError> {
        let site = self.get(name)?;
        let now_usable = site.module.check_dependencies();
        let was_usable = site.usable.swap(now_usable, Ordering::AcqRel);

        if was_usable == now_usable {
            return Ok(None);
        }
        info!(site = %name, usable = now_usable, "Site usability changed");
        Ok(Some(now_usable))
    }

    /// Unregister a module
    #[instrument(skip(self))]
    pub fn remove(&self, name: &str) -> Result<Arc<RegisteredSite>, RegistryError> {
        let mut sites = self.sites.write();
        let index = sites
            .iter()
            .position(|site| site.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let removed = sites.remove(index);
        info!(site = %name, "Site module removed");
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.sites.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.read().is_empty()
    }
}
