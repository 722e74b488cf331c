// Demo site that produces a new update on every fetch

use crate::errors::FetchError;
use crate::models::Snapshot;
use crate::registry::SiteModule;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub const EXAMPLE_SITE_NAME: &str = "example";

/// Deterministic source for trying out subscriptions end to end
#[derive(Debug, Default)]
pub struct ExampleSite {
    update_count: AtomicU64,
}

impl ExampleSite {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SiteModule for ExampleSite {
    fn name(&self) -> &str {
        EXAMPLE_SITE_NAME
    }

    fn display_name(&self) -> String {
        "示例网站".to_string()
    }

    fn description(&self) -> String {
        "示例网站 - 每分钟产生一条更新用于测试".to_string()
    }

    fn schedule(&self) -> String {
        "interval:60".to_string()
    }

    fn check_dependencies(&self) -> bool {
        true
    }

    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        let update_count = self.update_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(update_count, "Example site produced an update");
        Ok(json!({
            "update_count": update_count,
            "title": format!("Example Update #{}", update_count),
            "content": format!("This is example content for update #{}", update_count),
        }))
    }

    fn compare(&self, cached: &Snapshot, latest: &Snapshot) -> bool {
        cached["update_count"] != latest["update_count"]
    }

    fn format(&self, latest: &Snapshot) -> String {
        format!(
            "【示例网站更新】\n{}\n{}",
            latest["title"].as_str().unwrap_or_default(),
            latest["content"].as_str().unwrap_or_default()
        )
    }
}
