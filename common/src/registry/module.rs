// Site module capability contract and the closure-based builder

use crate::errors::{FetchError, RegistryError};
use crate::models::Snapshot;
use crate::schedule::default_timezone;
use async_trait::async_trait;
use chrono_tz::Tz;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Capability set every site module provides
///
/// `compare` and `format` must be pure. `check_dependencies` must be cheap
/// and side-effect free: it runs at registration and whenever usability is
/// re-evaluated.
#[async_trait]
pub trait SiteModule: Send + Sync {
    /// Unique, immutable registry key
    fn name(&self) -> &str;

    /// Name shown to users and accepted by subscribe commands
    fn display_name(&self) -> String;

    fn description(&self) -> String;

    /// `interval:<seconds>` or a cron expression
    fn schedule(&self) -> String;

    /// Timezone used to evaluate cron schedules
    fn timezone(&self) -> Tz {
        default_timezone()
    }

    fn check_dependencies(&self) -> bool;

    /// Produce the latest snapshot of the source
    async fn fetch(&self) -> Result<Snapshot, FetchError>;

    /// Whether `latest` differs from `cached` in a way worth notifying
    fn compare(&self, cached: &Snapshot, latest: &Snapshot) -> bool;

    /// Human-readable notification for `latest`
    fn format(&self, latest: &Snapshot) -> String;
}

pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Snapshot, FetchError>> + Send + Sync>;
pub type CompareFn = Arc<dyn Fn(&Snapshot, &Snapshot) -> bool + Send + Sync>;
pub type FormatFn = Arc<dyn Fn(&Snapshot) -> String + Send + Sync>;
pub type TextFn = Arc<dyn Fn() -> String + Send + Sync>;
pub type DependencyFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Site module assembled from closures plus descriptive metadata
#[derive(Clone)]
pub struct SiteConfig {
    name: String,
    fetch: FetchFn,
    compare: CompareFn,
    format: FormatFn,
    description: TextFn,
    schedule: TextFn,
    display_name: TextFn,
    check_dependencies: DependencyFn,
    timezone: Tz,
    pub version: String,
    pub author: String,
    pub dependencies: Vec<String>,
}

impl SiteConfig {
    pub fn builder(name: impl Into<String>) -> SiteConfigBuilder {
        SiteConfigBuilder::new(name)
    }
}

impl fmt::Debug for SiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteConfig")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("author", &self.author)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

#[async_trait]
impl SiteModule for SiteConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> String {
        (self.display_name)()
    }

    fn description(&self) -> String {
        (self.description)()
    }

    fn schedule(&self) -> String {
        (self.schedule)()
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }

    fn check_dependencies(&self) -> bool {
        (self.check_dependencies)()
    }

    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        (self.fetch)().await
    }

    fn compare(&self, cached: &Snapshot, latest: &Snapshot) -> bool {
        (self.compare)(cached, latest)
    }

    fn format(&self, latest: &Snapshot) -> String {
        (self.format)(latest)
    }
}

/// Builder for [`SiteConfig`]
///
/// `fetch`, `compare`, `format`, `description` and `schedule` are required.
/// The display name falls back to the description; the dependency check
/// defaults to always available.
pub struct SiteConfigBuilder {
    name: String,
    fetch: Option<FetchFn>,
    compare: Option<CompareFn>,
    format: Option<FormatFn>,
    description: Option<TextFn>,
    schedule: Option<TextFn>,
    display_name: Option<TextFn>,
    check_dependencies: Option<DependencyFn>,
    timezone: Tz,
    version: String,
    author: String,
    dependencies: Vec<String>,
}

impl SiteConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fetch: None,
            compare: None,
            format: None,
            description: None,
            schedule: None,
            display_name: None,
            check_dependencies: None,
            timezone: default_timezone(),
            version: "1.0.0".to_string(),
            author: "Anonymous".to_string(),
            dependencies: Vec::new(),
        }
    }

    pub fn fetch<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Snapshot, FetchError>> + Send + 'static,
    {
        self.fetch = Some(Arc::new(
            move || -> BoxFuture<'static, Result<Snapshot, FetchError>> { Box::pin(fetch()) },
        ));
        self
    }

    pub fn compare<F>(mut self, compare: F) -> Self
    where
        F: Fn(&Snapshot, &Snapshot) -> bool + Send + Sync + 'static,
    {
        self.compare = Some(Arc::new(compare));
        self
    }

    pub fn format<F>(mut self, format: F) -> Self
    where
        F: Fn(&Snapshot) -> String + Send + Sync + 'static,
    {
        self.format = Some(Arc::new(format));
        self
    }

    pub fn description<F, S>(mut self, description: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Into<String>,
    {
        self.description = Some(Arc::new(move || description().into()));
        self
    }

    pub fn schedule<F, S>(mut self, schedule: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Into<String>,
    {
        self.schedule = Some(Arc::new(move || schedule().into()));
        self
    }

    pub fn display_name<F, S>(mut self, display_name: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Into<String>,
    {
        self.display_name = Some(Arc::new(move || display_name().into()));
        self
    }

    pub fn check_dependencies<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.check_dependencies = Some(Arc::new(check));
        self
    }

    pub fn timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Assemble the module, naming the first missing capability on failure
    pub fn build(self) -> Result<SiteConfig, RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::invalid("", "site name is required"));
        }

        let name = self.name;
        let missing = |capability: &str| {
            RegistryError::invalid(&name, format!("missing {} capability", capability))
        };

        let fetch = self.fetch.ok_or_else(|| missing("fetch"))?;
        let compare = self.compare.ok_or_else(|| missing("compare"))?;
        let format = self.format.ok_or_else(|| missing("format"))?;
        let description = self.description.ok_or_else(|| missing("description"))?;
        let schedule = self.schedule.ok_or_else(|| missing("schedule"))?;
        let display_name = self.display_name.unwrap_or_else(|| description.clone());
        let check_dependencies: DependencyFn = match self.check_dependencies {
            Some(check) => check,
            None => Arc::new(|| true),
        };

        Ok(SiteConfig {
            name,
            fetch,
            compare,
            format,
            description,
            schedule,
            display_name,
            check_dependencies,
            timezone: self.timezone,
            version: self.version,
            author: self.author,
            dependencies: self.dependencies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete(name: &str) -> SiteConfigBuilder {
        SiteConfig::builder(name)
            .fetch(|| async { Ok(json!({"n": 1})) })
            .compare(|a, b| a != b)
            .format(|latest| format!("now {}", latest["n"]))
            .description(|| "Demo source")
            .schedule(|| "interval:60")
    }

    #[tokio::test]
    async fn test_builder_produces_working_module() {
        let site = complete("demo").build().unwrap();
        assert_eq!(site.name(), "demo");
        assert_eq!(site.schedule(), "interval:60");
        assert!(site.check_dependencies());

        let latest = site.fetch().await.unwrap();
        assert!(site.compare(&json!({"n": 0}), &latest));
        assert_eq!(site.format(&latest), "now 1");
    }

    #[test]
    fn test_display_name_defaults_to_description() {
        let site = complete("demo").build().unwrap();
        assert_eq!(site.display_name(), "Demo source");
    }

    #[test]
    fn test_missing_fetch_is_rejected() {
        let result = SiteConfig::builder("demo")
            .compare(|a, b| a != b)
            .format(|_| String::new())
            .description(|| "d")
            .schedule(|| "interval:1")
            .build();
        assert_eq!(
            result.unwrap_err(),
            RegistryError::invalid("demo", "missing fetch capability")
        );
    }

    #[test]
    fn test_missing_schedule_is_rejected() {
        let result = SiteConfig::builder("demo")
            .fetch(|| async { Ok(json!(null)) })
            .compare(|a, b| a != b)
            .format(|_| String::new())
            .description(|| "d")
            .build();
        assert!(matches!(result, Err(RegistryError::InvalidModule { reason, .. }) if reason.contains("schedule")));
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(complete("  ").build().is_err());
    }

    #[test]
    fn test_metadata_is_kept() {
        let site = complete("demo")
            .version("2.1.0")
            .author("someone")
            .dependencies(["scraper"])
            .check_dependencies(|| false)
            .build()
            .unwrap();
        assert_eq!(site.version, "2.1.0");
        assert_eq!(site.author, "someone");
        assert_eq!(site.dependencies, vec!["scraper".to_string()]);
        assert!(!site.check_dependencies());
    }
}
