//! Output module for crawl reporting
//!
//! This module handles:
//! - Recording crawl statistics while a controller runs
//! - Printing statistics summaries

pub mod stats;

pub use stats::{print_statistics, CrawlStatistics, CrawlStats};
