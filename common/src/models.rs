use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque serialized representation of a site's latest observed content
pub type Snapshot = serde_json::Value;

// ============================================================================
// Cache Models
// ============================================================================

/// Last-seen state of one site, keyed by site name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub site_name: String,
    pub snapshot: Snapshot,
    pub last_checked_at: DateTime<Utc>,
    /// `None` until a tick observes a change after the seeding fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Subscription Models
// ============================================================================

/// Relationship between one subscriber identity and one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: String,
    pub site_name: String,
    pub subscribed_at: DateTime<Utc>,
}

/// One row of the per-subscriber site listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteListing {
    pub name: String,
    pub display_name: String,
    pub description: String,
    /// Registered and dependencies available
    pub usable: bool,
    /// Still present in the registry
    pub registered: bool,
    pub subscribed: bool,
}

// ============================================================================
// Scheduling Models
// ============================================================================

/// Change notification produced by a tick, consumed once by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub site_name: String,
    pub formatted_message: String,
    pub detected_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(site_name: impl Into<String>, formatted_message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_name: site_name.into(),
            formatted_message: formatted_message.into(),
            detected_at: Utc::now(),
        }
    }
}

/// Per-site scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteState {
    Idle,
    Fetching,
    Comparing,
    Notifying,
    /// Dependencies unavailable or module removed
    Disabled,
    /// Terminal, entered on shutdown
    Stopped,
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// First observation, cache seeded, nothing emitted
    Seeded,
    Unchanged,
    Changed,
    FetchFailed,
    /// Cancelled before the cache write
    Aborted,
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Seeded => "seeded",
            TickOutcome::Unchanged => "unchanged",
            TickOutcome::Changed => "changed",
            TickOutcome::FetchFailed => "fetch_failed",
            TickOutcome::Aborted => "aborted",
        }
    }
}

/// Per-event delivery summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub duplicate: bool,
}
