use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Social-Crawler
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default, rename = "seed")]
    pub seeds: Vec<SeedEntry>,
}

/// Fetch pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of concurrent fetches; also sizes the connection pool
    #[serde(rename = "max-concurrency", default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Connect timeout applied to every fetch (milliseconds)
    #[serde(rename = "connect-timeout-ms", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Number of idle ticks a fetcher survives without work
    #[serde(rename = "idle-cycles", default = "default_idle_cycles")]
    pub idle_cycles: u32,

    /// Length of one idle tick (milliseconds)
    #[serde(rename = "idle-tick-ms", default = "default_idle_tick_ms")]
    pub idle_tick_ms: u64,
}

/// Crawl controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Delay before retrying an entity read that failed (milliseconds)
    #[serde(rename = "store-retry-ms", default = "default_store_retry_ms")]
    pub store_retry_ms: u64,
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

/// Seed entity for the runner binary
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub url: String,
}

fn default_max_concurrency() -> usize {
    20
}

fn default_connect_timeout_ms() -> u64 {
    1500
}

fn default_idle_cycles() -> u32 {
    5
}

fn default_idle_tick_ms() -> u64 {
    1000
}

fn default_store_retry_ms() -> u64 {
    1000
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    /// Total time an idle fetcher waits for work before retiring
    pub fn idle_window(&self) -> Duration {
        self.idle_tick() * self.idle_cycles
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_cycles: default_idle_cycles(),
            idle_tick_ms: default_idle_tick_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn store_retry(&self) -> Duration {
        Duration::from_millis(self.store_retry_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            store_retry_ms: default_store_retry_ms(),
        }
    }
}

impl UserAgentConfig {
    /// Formats the header value: `CrawlerName/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}
