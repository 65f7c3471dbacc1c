//! Crawl engine
//!
//! This module contains the core crawling machinery, including:
//! - Fetch units and request descriptors
//! - The HTTP transport and its connection limits
//! - The elastic, bounded fetch pool
//! - Crawl strategies and the controller that drives them

mod controller;
mod fetcher;
mod pool;
mod strategy;
mod unit;

#[cfg(test)]
mod test_utils;

pub use controller::{ControllerSnapshot, CrawlController};
pub use fetcher::{
    build_http_client, classify_error, ConnectionLimits, HttpTransport, Transport,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use pool::{FetchPool, Job};
pub use strategy::CrawlStrategy;
pub use unit::{FetchRequest, FetchUnit, UnitId};
