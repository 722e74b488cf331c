// Common library: site registry, change detection, subscriptions and
// notification fan-out shared by the scheduler binary and its tests

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod models;
pub mod notify;
pub mod plugin;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod sites;
pub mod storage;
pub mod subscriptions;
pub mod telemetry;

pub use plugin::{SiteWatch, SiteWatchBuilder};
