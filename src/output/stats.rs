//! Crawl statistics
//!
//! Controllers update a [`CrawlStats`] block of atomic counters as they run;
//! [`CrawlStats::snapshot`] copies them into a plain [`CrawlStatistics`]
//! value for reporting.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Live counters for one crawl controller
#[derive(Debug, Default)]
pub struct CrawlStats {
    entities_read: AtomicU64,
    units_generated: AtomicU64,
    units_dispatched: AtomicU64,
    units_retried: AtomicU64,
    units_succeeded: AtomicU64,
    units_failed: AtomicU64,
    stale_completions: AtomicU64,
    hook_errors: AtomicU64,
    store_errors: AtomicU64,
    window: Mutex<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
}

/// Point-in-time copy of a controller's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStatistics {
    /// Entities read from the store
    pub entities_read: u64,

    /// Units returned by the strategy's `generate` hook
    pub units_generated: u64,

    /// Units handed to the fetch pool, retries included
    pub units_dispatched: u64,

    /// Dispatches that were resends of a failed unit
    pub units_retried: u64,

    /// Attempts that completed successfully
    pub units_succeeded: u64,

    /// Attempts that failed and were queued for resend
    pub units_failed: u64,

    /// Completions dropped because pause/stop had already requeued the unit
    pub stale_completions: u64,

    /// Strategy hook invocations that returned an error or panicked
    pub hook_errors: u64,

    /// Entity store reads that failed
    pub store_errors: u64,

    /// When the controller last started from `Stopped`
    pub started_at: Option<DateTime<Utc>>,

    /// When the controller last reached `Stopped`
    pub finished_at: Option<DateTime<Utc>>,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn entity_read(&self) {
        self.entities_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn units_generated(&self, count: usize) {
        self.units_generated
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn unit_dispatched(&self, retry: bool) {
        self.units_dispatched.fetch_add(1, Ordering::Relaxed);
        if retry {
            self.units_retried.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn unit_succeeded(&self) {
        self.units_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unit_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stale_completion(&self) {
        self.stale_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hook_error(&self) {
        self.hook_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_started(&self) {
        if let Ok(mut window) = self.window.lock() {
            *window = (Some(Utc::now()), None);
        }
    }

    pub(crate) fn mark_finished(&self) {
        if let Ok(mut window) = self.window.lock() {
            window.1 = Some(Utc::now());
        }
    }

    /// Copies the current counter values
    pub fn snapshot(&self) -> CrawlStatistics {
        let (started_at, finished_at) = self
            .window
            .lock()
            .map(|window| *window)
            .unwrap_or_default();

        CrawlStatistics {
            entities_read: self.entities_read.load(Ordering::Relaxed),
            units_generated: self.units_generated.load(Ordering::Relaxed),
            units_dispatched: self.units_dispatched.load(Ordering::Relaxed),
            units_retried: self.units_retried.load(Ordering::Relaxed),
            units_succeeded: self.units_succeeded.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            hook_errors: self.hook_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            started_at,
            finished_at,
        }
    }
}

impl CrawlStatistics {
    /// Share of dispatched attempts that succeeded, as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.units_dispatched == 0 {
            return 0.0;
        }
        (self.units_succeeded as f64 / self.units_dispatched as f64) * 100.0
    }
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `name` - The controller the statistics belong to
/// * `stats` - The statistics to display
pub fn print_statistics(name: &str, stats: &CrawlStatistics) {
    println!("=== Crawl Statistics: {} ===\n", name);

    println!("Entities:");
    println!("  Read from store: {}", stats.entities_read);
    println!("  Store read errors: {}", stats.store_errors);
    println!();

    println!("Fetch Units:");
    println!("  Generated: {}", stats.units_generated);
    println!(
        "  Dispatched: {} ({} retries)",
        stats.units_dispatched, stats.units_retried
    );
    println!("  Succeeded: {}", stats.units_succeeded);
    println!("  Failed attempts: {}", stats.units_failed);
    println!("  Stale completions: {}", stats.stale_completions);
    println!();

    if stats.hook_errors > 0 {
        println!("Strategy hook errors: {}", stats.hook_errors);
        println!();
    }

    if let (Some(started), Some(finished)) = (stats.started_at, stats.finished_at) {
        let elapsed = finished - started;
        println!("Duration: {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);
    }

    println!(
        "Success Rate: {:.1}% ({} / {} attempts)",
        stats.success_rate(),
        stats.units_succeeded,
        stats.units_dispatched
    );
}
