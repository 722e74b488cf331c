// Error handling framework
// Each failure is contained at its own granularity: one module, one tick,
// one subscriber, one store.

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid interval '{0}': expected interval:<seconds> with seconds > 0")]
    InvalidInterval(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("No next execution time available for {schedule_type} schedule")]
    NoNextExecution { schedule_type: String },
}

/// Site module registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid site module '{name}': {reason}")]
    InvalidModule { name: String, reason: String },

    #[error("Site not found: {0}")]
    NotFound(String),
}

impl RegistryError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::InvalidModule {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Fetch failures raised by a site module during a tick
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Fetch timed out after {0} seconds")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// Delivery failures for a single subscriber
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("Subscriber unreachable: {0}")]
    Unreachable(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Storage errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Filesystem error: {0}")]
    Io(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Corrupt entry '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Subscription command errors, surfaced to the user as a rejection message
#[derive(Error, Debug, Clone)]
pub enum SubscriptionError {
    #[error("Unknown or unavailable site: {0}")]
    UnknownSite(String),

    #[error("Subscription storage failed: {0}")]
    Storage(#[from] StorageError),
}

/// Scheduler lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Site dependencies are unavailable: {0}")]
    SiteUnusable(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
