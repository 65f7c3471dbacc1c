//! Crawl strategy hooks
//!
//! A strategy decides which requests to issue for an entity and what to do
//! with a successful response. `generate` runs on tokio's blocking pool and
//! `on_complete` runs on the fetcher task that made the request; a hook that
//! errors or panics is contained by [`guard_hook`] and never takes the
//! engine down with it.

use crate::crawler::unit::FetchUnit;
use crate::{CrawlError, StrategyError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Per-target crawl behaviour
///
/// # Example
///
/// ```
/// use social_crawler::crawler::{CrawlStrategy, FetchRequest, FetchUnit};
/// use social_crawler::StrategyError;
/// use url::Url;
///
/// struct Profiles;
///
/// impl CrawlStrategy<u64> for Profiles {
///     fn generate(&self, uin: &u64) -> Result<Vec<FetchUnit<u64>>, StrategyError> {
///         let url = Url::parse(&format!("https://example.com/profile?uin={}", uin))
///             .map_err(|e| StrategyError::Generate(e.to_string()))?;
///         Ok(vec![FetchUnit::new(FetchRequest::get(url), *uin)])
///     }
///
///     fn on_complete(&self, unit: &FetchUnit<u64>, content: &str) -> Result<(), StrategyError> {
///         println!("{} -> {} bytes", unit.entity(), content.len());
///         Ok(())
///     }
/// }
/// ```
pub trait CrawlStrategy<E>: Send + Sync {
    /// Produces the fetch units for one entity read from the store
    ///
    /// An empty vector means there is nothing to fetch for this entity.
    /// Runs on the blocking pool, so it may do synchronous I/O.
    fn generate(&self, entity: &E) -> Result<Vec<FetchUnit<E>>, StrategyError>;

    /// Handles the body of a unit whose attempt succeeded
    ///
    /// Called exactly once per unit, and never for a failed attempt. This
    /// runs inline on a fetcher task, which stays bound until it returns:
    /// keep it short and hand slow work to `tokio::task::spawn_blocking` or
    /// a channel instead of blocking here.
    fn on_complete(&self, unit: &FetchUnit<E>, content: &str) -> Result<(), StrategyError>;
}

impl<E, S: CrawlStrategy<E> + ?Sized> CrawlStrategy<E> for std::sync::Arc<S> {
    fn generate(&self, entity: &E) -> Result<Vec<FetchUnit<E>>, StrategyError> {
        (**self).generate(entity)
    }

    fn on_complete(&self, unit: &FetchUnit<E>, content: &str) -> Result<(), StrategyError> {
        (**self).on_complete(unit, content)
    }
}

/// Runs a strategy hook, turning both errors and panics into
/// [`CrawlError::Strategy`]
pub(crate) fn guard_hook<T, F>(context: &str, hook: F) -> Result<T, CrawlError>
where
    F: FnOnce() -> Result<T, StrategyError>,
{
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CrawlError::Strategy {
            context: context.to_string(),
            message: e.to_string(),
        }),
        Err(payload) => Err(CrawlError::Strategy {
            context: context.to_string(),
            message: format!("panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
