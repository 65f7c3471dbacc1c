//! Social-Crawler main entry point
//!
//! This is the command-line runner: it crawls the seed pages listed in a
//! configuration file and records the size of each page it fetched.

use anyhow::Context;
use clap::Parser;
use social_crawler::config::{load_config_with_hash, Config};
use social_crawler::crawler::{
    CrawlController, CrawlStrategy, FetchPool, FetchRequest, FetchUnit, HttpTransport,
};
use social_crawler::output::print_statistics;
use social_crawler::storage::{EntityKey, EntityStore, MemoryStore};
use social_crawler::{ControlState, StrategyError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Social-Crawler: a restartable crawl engine
///
/// Reads the seed pages from the configuration, fetches each of them on a
/// bounded pool, retrying failures until they succeed, and prints crawl
/// statistics when the seeds are exhausted or on Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "social-crawler")]
#[command(version)]
#[command(about = "A restartable crawl engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long)]
    dry_run: bool,
}

/// A seed page and what the crawl learned about it
#[derive(Debug, Clone)]
struct Page {
    url: Url,
    body_len: Option<usize>,
}

impl EntityKey for Page {
    type Key = String;

    fn key(&self) -> String {
        self.url.to_string()
    }
}

/// Issues one GET per page and writes the body size back to the store
struct PageStrategy {
    store: Arc<MemoryStore<Page>>,
}

impl CrawlStrategy<Page> for PageStrategy {
    fn generate(&self, page: &Page) -> Result<Vec<FetchUnit<Page>>, StrategyError> {
        if page.body_len.is_some() {
            return Ok(Vec::new());
        }
        let request = FetchRequest::get(page.url.clone());
        Ok(vec![FetchUnit::new(request, page.clone()).with_label("page")])
    }

    fn on_complete(&self, unit: &FetchUnit<Page>, content: &str) -> Result<(), StrategyError> {
        let page = Page {
            url: unit.entity().url.clone(),
            body_len: Some(content.len()),
        };
        tracing::info!("{} -> {} bytes", page.url, content.len());

        self.store
            .update(page)
            .map(|_| ())
            .map_err(|e| StrategyError::Complete(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
        return Ok(());
    }

    handle_crawl(config).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("social_crawler=info,warn"),
            1 => EnvFilter::new("social_crawler=debug,info"),
            2 => EnvFilter::new("social_crawler=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the validated configuration
fn handle_dry_run(config: &Config) {
    println!("=== Social-Crawler Dry Run ===\n");

    println!("Fetch Pool:");
    println!("  Max concurrency: {}", config.pool.max_concurrency);
    println!("  Connect timeout: {}ms", config.pool.connect_timeout_ms);
    println!(
        "  Idle retirement: {} x {}ms",
        config.pool.idle_cycles, config.pool.idle_tick_ms
    );

    println!("\nController:");
    println!("  Store retry delay: {}ms", config.controller.store_retry_ms);

    println!("\nUser Agent:");
    println!("  {}", config.user_agent.header_value());

    println!("\nSeeds ({}):", config.seeds.len());
    for seed in &config.seeds {
        println!("  - {}", seed.url);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config) -> anyhow::Result<()> {
    let mut pages = Vec::with_capacity(config.seeds.len());
    for seed in &config.seeds {
        let url = Url::parse(&seed.url).with_context(|| format!("invalid seed {}", seed.url))?;
        pages.push(Page {
            url,
            body_len: None,
        });
    }
    let store = Arc::new(MemoryStore::with_entities(pages));
    tracing::info!("Seeded store with {} pages", store.len());

    let transport = HttpTransport::from_config(&config).context("failed to build HTTP client")?;
    let pool = FetchPool::new(Arc::new(transport), &config.pool);

    let strategy = PageStrategy {
        store: Arc::clone(&store),
    };
    let controller = CrawlController::with_config(
        "pages",
        pool,
        Arc::clone(&store),
        strategy,
        &config.controller,
    );

    controller.start().await?;

    tokio::select! {
        _ = controller.wait_stopped() => {
            tracing::info!("All seeds crawled");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted, stopping crawl");
            controller.pause().await?;
            let snapshot = controller.snapshot();
            tracing::info!(
                "Paused at offset {} with {} units awaiting retry",
                snapshot.offset,
                snapshot.failed.len()
            );
        }
    }

    // Also reaps the control task if the crawl stopped on its own
    controller.stop().await?;
    debug_assert_eq!(controller.state(), ControlState::Stopped);

    let fetched = (0..store.len() as u64)
        .filter_map(|offset| store.find(offset).ok().flatten())
        .filter(|page| page.body_len.is_some())
        .count();
    println!();
    print_statistics(controller.name(), &controller.stats());
    println!("\nPages fetched: {} / {}", fetched, store.len());

    Ok(())
}
