// Scheduler module: per-site fixed-rate polling and change detection

pub mod engine;

pub use engine::{PollingScheduler, SchedulerConfig};
