//! Social-Crawler: a generic, restartable crawl engine
//!
//! This crate pulls domain entities from a sequential store, asks a
//! per-target strategy which requests to issue for each entity, runs those
//! requests on an elastic bounded fetch pool, and routes the results back to
//! the strategy. Crawls can be paused, resumed and stopped without losing
//! in-flight work.

pub mod config;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Social-Crawler operations
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Strategy hook failed while {context}: {message}")]
    Strategy { context: String, message: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control loop terminated abnormally: {0}")]
    ControlLoop(#[from] tokio::task::JoinError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Errors produced by a single fetch attempt
///
/// Every variant is transient from the controller's point of view: the unit
/// is marked failed and resent later.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request timeout for {url}")]
    Timeout { url: String },

    #[error("Connection failed for {url}: {message}")]
    Connect { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to read body of {url}: {message}")]
    Body { url: String, message: String },

    #[error("Request aborted: {url}")]
    Aborted { url: String },

    #[error("Request failed for {url}: {message}")]
    Other { url: String, message: String },
}

impl FetchError {
    /// Returns true if the attempt was cancelled by the pool rather than
    /// failing on its own
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Errors raised by a crawl strategy's hooks
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Failed to generate fetch units: {0}")]
    Generate(String),

    #[error("Failed to handle completed unit: {0}")]
    Complete(String),}

/// Result type alias for Social-Crawler operations
pub type Result<T> = std::result::Result<T, CrawlError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlController, CrawlStrategy, FetchPool, FetchRequest, FetchUnit};
pub use state::{ControlState, FetchState};
pub use storage::{EntityStore, MemoryStore};
