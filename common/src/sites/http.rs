// HTTP page watcher configured from settings

use crate::errors::{FetchError, RegistryError};
use crate::models::Snapshot;
use crate::registry::SiteModule;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, instrument};

const EXCERPT_CHARS: usize = 200;

fn default_schedule() -> String {
    "interval:300".to_string()
}

/// One `[[sites]]` entry in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSiteConfig {
    pub name: String,
    /// Defaults to the description
    #[serde(default)]
    pub display_name: Option<String>,
    pub description: String,
    pub url: String,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Only the matches of this regex are watched; the first capture group
    /// is used when present
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Watches a web page for content changes
pub struct HttpPageSite {
    config: HttpSiteConfig,
    client: Client,
    pattern: Option<Regex>,
    timeout_seconds: u64,
}

impl HttpPageSite {
    pub fn new(config: HttpSiteConfig, timeout_seconds: u64) -> Result<Self, RegistryError> {
        let pattern = match &config.pattern {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                RegistryError::invalid(&config.name, format!("invalid pattern: {}", e))
            })?),
            None => None,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| {
                RegistryError::invalid(&config.name, format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            config,
            client,
            pattern,
            timeout_seconds,
        })
    }

    /// Portion of the page that is compared between ticks
    fn watched_content(&self, body: &str) -> String {
        match &self.pattern {
            Some(pattern) => pattern
                .captures_iter(body)
                .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| m.as_str().trim())
                .collect::<Vec<_>>()
                .join("\n"),
            None => body.to_string(),
        }
    }
}

fn excerpt(content: &str) -> String {
    let trimmed = content.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[async_trait]
impl SiteModule for HttpPageSite {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn display_name(&self) -> String {
        self.config
            .display_name
            .clone()
            .unwrap_or_else(|| self.config.description.clone())
    }

    fn description(&self) -> String {
        self.config.description.clone()
    }

    fn schedule(&self) -> String {
        self.config.schedule.clone()
    }

    /// Usable when the URL is a valid http(s) URL
    fn check_dependencies(&self) -> bool {
        Url::parse(&self.config.url)
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false)
    }

    #[instrument(skip(self), fields(site = %self.config.name, url = %self.config.url))]
    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        let response = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(self.timeout_seconds)
                } else {
                    FetchError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: self.config.url.clone(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        let content = self.watched_content(&body);
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        debug!(bytes = body.len(), digest = %digest, "Page fetched");

        Ok(json!({
            "digest": digest,
            "excerpt": excerpt(&content),
            "url": self.config.url,
        }))
    }

    fn compare(&self, cached: &Snapshot, latest: &Snapshot) -> bool {
        cached["digest"] != latest["digest"]
    }

    fn format(&self, latest: &Snapshot) -> String {
        format!(
            "【{}】页面已更新\n{}\n{}",
            self.display_name(),
            latest["url"].as_str().unwrap_or(&self.config.url),
            latest["excerpt"].as_str().unwrap_or_default()
        )
    }
}
