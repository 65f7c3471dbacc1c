//! Elastic, capacity-bounded fetch execution pool
//!
//! The pool keeps an explicit registry of fetcher tasks. Each fetcher runs
//! one job at a time, reports back through the job's completion route, and
//! then waits on its single-slot job channel for reuse. A fetcher that stays
//! idle for `idle_cycles` ticks retires and leaves the registry.
//!
//! Binding a job to an idle fetcher and a fetcher retiring both happen under
//! the registry mutex, so a job can never be handed to a fetcher that has
//! already decided to exit.

use crate::config::PoolConfig;
use crate::crawler::fetcher::{ConnectionLimits, Transport};
use crate::crawler::unit::{FetchRequest, UnitId};
use crate::FetchError;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

type Completion = Box<dyn FnOnce(Result<String, FetchError>) + Send>;

/// A request submitted to the pool together with its completion route
pub struct Job {
    unit: UnitId,
    request: FetchRequest,
    on_done: Completion,
}

impl Job {
    /// Creates a job for `unit`
    ///
    /// `on_done` is called exactly once, on the fetcher task, with either
    /// the response body or the reason the attempt failed.
    pub fn new<F>(unit: UnitId, request: FetchRequest, on_done: F) -> Self
    where
        F: FnOnce(Result<String, FetchError>) + Send + 'static,
    {
        Self {
            unit,
            request,
            on_done: Box::new(on_done),
        }
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("unit", &self.unit)
            .field("url", &self.request.url().as_str())
            .finish_non_exhaustive()
    }
}

/// A job bound to a fetcher, with the token that aborts it
struct Bound {
    job: Job,
    cancel: CancellationToken,
}

struct Binding {
    unit: UnitId,
    cancel: CancellationToken,
}

struct FetcherSlot {
    binding: Option<Binding>,
    jobs: mpsc::Sender<Bound>,
}

struct Registry {
    capacity: usize,
    limits: ConnectionLimits,
    next_fetcher: u64,
    fetchers: HashMap<u64, FetcherSlot>,
}

struct PoolInner {
    id: u64,
    transport: Arc<dyn Transport>,
    registry: Mutex<Registry>,
    freed: Notify,
    idle_tick: Duration,
    idle_cycles: u32,
}

/// Bounded pool of fetcher tasks
///
/// Cloning the pool is cheap and yields a handle to the same fetchers, so
/// one pool can be shared by several controllers, whatever their entity
/// types.
#[derive(Clone)]
pub struct FetchPool {
    inner: Arc<PoolInner>,
}

impl FetchPool {
    /// Creates a pool over `transport`, sized from `config`
    pub fn new(transport: Arc<dyn Transport>, config: &PoolConfig) -> Self {
        let capacity = config.max_concurrency.max(1);
        let pool = Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                transport,
                registry: Mutex::new(Registry {
                    capacity,
                    limits: ConnectionLimits::for_capacity(capacity),
                    next_fetcher: 0,
                    fetchers: HashMap::new(),
                }),
                freed: Notify::new(),
                idle_tick: config.idle_tick(),
                idle_cycles: config.idle_cycles.max(1),
            }),
        };
        pool.set_capacity(capacity);
        pool
    }

    /// Submits a job and returns once a fetcher has accepted it
    ///
    /// Reuses an idle fetcher when there is one, spawns a new fetcher while
    /// under capacity, and otherwise waits until a fetcher frees up. The
    /// returned future is cancel-safe: if it is dropped before resolving, the
    /// job was not bound and is simply discarded.
    pub async fn execute(&self, job: Job) {
        let mut job = job;
        loop {
            let freed = self.inner.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            match self.inner.try_bind(job) {
                Ok(()) => return,
                Err(rejected) => job = rejected,
            }

            tracing::trace!("Pool {} saturated, waiting for a free fetcher", self.inner.id);
            freed.await;
        }
    }

    /// Aborts every in-flight attempt for `unit`
    ///
    /// Each fetcher bound to the unit cancels its request and completes its
    /// job with [`FetchError::Aborted`]. A resent unit can briefly hold two
    /// fetchers while the earlier attempt finishes its completion hook, so
    /// all of them are cancelled. Returns `false` if no fetcher is bound to
    /// the unit.
    pub fn abort(&self, unit: UnitId) -> bool {
        let registry = self.inner.lock();
        let mut aborted = 0;
        for binding in registry
            .fetchers
            .values()
            .filter_map(|slot| slot.binding.as_ref())
            .filter(|binding| binding.unit == unit)
        {
            binding.cancel.cancel();
            aborted += 1;
        }

        if aborted > 0 {
            tracing::debug!(
                "Aborting {} ({} attempts) on pool {}",
                unit,
                aborted,
                self.inner.id
            );
        }
        aborted > 0
    }

    /// Sets the maximum number of fetchers
    ///
    /// Also derives the transport's connection limits: `n/2 + 1` per route
    /// and `n*2 + 1` in total.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let limits = ConnectionLimits::for_capacity(capacity);
        {
            let mut registry = self.inner.lock();
            registry.capacity = capacity;
            registry.limits = limits;
        }
        self.inner.transport.apply_limits(limits);
        // Waiters may now be able to spawn
        self.inner.freed.notify_waiters();
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        self.inner.lock().limits
    }

    /// Number of fetcher tasks currently registered
    pub fn live_fetchers(&self) -> usize {
        self.inner.lock().fetchers.len()
    }

    /// Number of fetchers currently bound to a job
    pub fn busy_fetchers(&self) -> usize {
        self.inner
            .lock()
            .fetchers
            .values()
            .filter(|slot| slot.binding.is_some())
            .count()
    }
}

impl fmt::Debug for FetchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.lock();
        f.debug_struct("FetchPool")
            .field("id", &self.inner.id)
            .field("capacity", &registry.capacity)
            .field("live", &registry.fetchers.len())
            .finish()
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `job` to an idle fetcher or a new one; hands it back if the
    /// pool is saturated
    fn try_bind(self: &Arc<Self>, job: Job) -> Result<(), Job> {
        let mut job = job;
        let mut registry = self.lock();

        // Idle fetchers are only reused while the pool is within capacity,
        // so shrinking the pool lets the surplus retire.
        if registry.fetchers.len() <= registry.capacity {
            let idle: Vec<u64> = registry
                .fetchers
                .iter()
                .filter(|(_, slot)| slot.binding.is_none())
                .map(|(id, _)| *id)
                .collect();

            for fetcher in idle {
                let Some(slot) = registry.fetchers.get_mut(&fetcher) else {
                    continue;
                };
                let cancel = CancellationToken::new();
                let unit = job.unit;
                match slot.jobs.try_send(Bound {
                    job,
                    cancel: cancel.clone(),
                }) {
                    Ok(()) => {
                        slot.binding = Some(Binding { unit, cancel });
                        tracing::trace!("Bound {} to fetcher {}", unit, fetcher);
                        return Ok(());
                    }
                    Err(TrySendError::Full(bound)) => job = bound.job,
                    Err(TrySendError::Closed(bound)) => {
                        // The fetcher task is gone without deregistering
                        registry.fetchers.remove(&fetcher);
                        job = bound.job;
                    }
                }
            }
        }

        if registry.fetchers.len() < registry.capacity {
            let fetcher = registry.next_fetcher;
            registry.next_fetcher += 1;

            let (tx, rx) = mpsc::channel(1);
            let cancel = CancellationToken::new();
            let unit = job.unit;
            registry.fetchers.insert(
                fetcher,
                FetcherSlot {
                    binding: Some(Binding {
                        unit,
                        cancel: cancel.clone(),
                    }),
                    jobs: tx,
                },
            );

            let span = tracing::debug_span!("fetcher", pool = self.id, fetcher);
            tokio::spawn(
                Arc::clone(self)
                    .run_fetcher(fetcher, Bound { job, cancel }, rx)
                    .instrument(span),
            );
            tracing::trace!(
                "Spawned fetcher {} for {} ({} live)",
                fetcher,
                unit,
                registry.fetchers.len()
            );
            return Ok(());
        }

        Err(job)
    }

    async fn run_fetcher(
        self: Arc<Self>,
        fetcher: u64,
        first: Bound,
        mut jobs: mpsc::Receiver<Bound>,
    ) {
        let mut next = Some(first);
        loop {
            let bound = match next.take() {
                Some(bound) => bound,
                None => match self.wait_for_job(fetcher, &mut jobs).await {
                    Some(bound) => bound,
                    None => return,
                },
            };

            self.run_job(bound).await;

            if !self.release(fetcher) {
                return;
            }
        }
    }

    async fn run_job(&self, bound: Bound) {
        let Bound { job, cancel } = bound;
        let Job {
            unit,
            request,
            on_done,
        } = job;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Aborted {
                url: request.url().to_string(),
            }),
            result = self.transport.fetch(&request) => result,
        };

        match &result {
            Ok(body) => tracing::debug!("{} fetched {} ({} bytes)", unit, request.url(), body.len()),
            Err(e) if e.is_abort() => tracing::debug!("{} aborted", unit),
            Err(e) => tracing::debug!("{} failed: {}", unit, e),
        }

        on_done(result);
    }

    /// Marks the fetcher idle; returns `false` if it should retire instead
    fn release(&self, fetcher: u64) -> bool {
        let keep = {
            let mut registry = self.lock();
            if registry.fetchers.len() > registry.capacity {
                registry.fetchers.remove(&fetcher);
                false
            } else if let Some(slot) = registry.fetchers.get_mut(&fetcher) {
                slot.binding = None;
                true
            } else {
                false
            }
        };

        self.freed.notify_one();
        keep
    }

    /// Waits up to the idle window for a new job
    ///
    /// Returns `None` once the fetcher has deregistered itself.
    async fn wait_for_job(&self, fetcher: u64, jobs: &mut mpsc::Receiver<Bound>) -> Option<Bound> {
        for _ in 0..self.idle_cycles {
            match tokio::time::timeout(self.idle_tick, jobs.recv()).await {
                Ok(Some(bound)) => return Some(bound),
                Ok(None) => return None,
                Err(_) => continue,
            }
        }

        let mut registry = self.lock();
        match jobs.try_recv() {
            // Bound while the last tick expired
            Ok(bound) => Some(bound),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                registry.fetchers.remove(&fetcher);
                let live = registry.fetchers.len();
                drop(registry);
                tracing::trace!("Fetcher {} retired after idle window ({} live)", fetcher, live);
                self.freed.notify_one();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::test_utils::{test_request, GatedTransport};
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    fn pool_config(capacity: usize) -> PoolConfig {
        PoolConfig {
            max_concurrency: capacity,
            idle_cycles: 2,
            idle_tick_ms: 20,
            ..PoolConfig::default()
        }
    }

    fn job(path: &str) -> (Job, UnitId, oneshot::Receiver<Result<String, FetchError>>) {
        let (tx, rx) = oneshot::channel();
        let unit = crate::crawler::FetchUnit::new(test_request(path), ()).id();
        let job = Job::new(unit, test_request(path), move |result| {
            let _ = tx.send(result);
        });
        (job, unit, rx)
    }

    #[tokio::test]
    async fn test_third_submission_waits_for_free_fetcher() {
        let transport = GatedTransport::new();
        let pool = FetchPool::new(transport.clone(), &pool_config(2));

        let (first, _, _) = job("/1");
        let (second, _, _) = job("/2");
        let (third, _, third_done) = job("/3");

        pool.execute(first).await;
        pool.execute(second).await;
        assert_eq!(pool.live_fetchers(), 2);

        let pool_clone = pool.clone();
        let blocked = tokio::spawn(async move { pool_clone.execute(third).await });
        sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(pool.live_fetchers(), 2);

        // One completion frees a fetcher for the third unit
        transport.release(1);
        timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert_eq!(pool.live_fetchers(), 2);

        transport.release(2);
        assert!(third_done.await.unwrap().is_ok());
        assert!(transport.peak() <= 2);
    }

    #[tokio::test]
    async fn test_idle_fetcher_is_reused() {
        let transport = GatedTransport::open();
        let pool = FetchPool::new(transport.clone(), &pool_config(4));

        let (first, _, first_done) = job("/a");
        pool.execute(first).await;
        first_done.await.unwrap().unwrap();

        let (second, _, second_done) = job("/b");
        pool.execute(second).await;
        second_done.await.unwrap().unwrap();

        assert_eq!(pool.live_fetchers(), 1);
    }

    #[tokio::test]
    async fn test_idle_fetchers_retire() {
        let transport = GatedTransport::open();
        let pool = FetchPool::new(transport.clone(), &pool_config(4));

        let (first, _, first_done) = job("/a");
        pool.execute(first).await;
        first_done.await.unwrap().unwrap();
        assert_eq!(pool.live_fetchers(), 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.live_fetchers(), 0);
    }

    #[tokio::test]
    async fn test_abort_fails_in_flight_unit() {
        let transport = GatedTransport::new();
        let pool = FetchPool::new(transport.clone(), &pool_config(2));

        let (job, unit, done) = job("/slow");
        pool.execute(job).await;

        assert!(pool.abort(unit));
        let result = timeout(Duration::from_secs(1), done).await.unwrap().unwrap();
        assert!(matches!(result, Err(FetchError::Aborted { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_reaches_resent_attempt() {
        let transport = GatedTransport::new();
        let pool = FetchPool::new(transport.clone(), &pool_config(2));

        // The first attempt succeeds but its completion hook is still running
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (finish_tx, finish_rx) = std::sync::mpsc::channel::<()>();
        let (_, unit, _) = job("/resent");
        let first = Job::new(unit, test_request("/resent"), move |_| {
            let _ = entered_tx.send(());
            let _ = finish_rx.recv();
        });
        pool.execute(first).await;
        transport.release(1);
        timeout(Duration::from_secs(1), async {
            while entered_rx.try_recv().is_err() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The resend binds a second fetcher for the same unit
        let (tx, resent_done) = oneshot::channel();
        let resent = Job::new(unit, test_request("/resent"), move |result| {
            let _ = tx.send(result);
        });
        pool.execute(resent).await;
        assert_eq!(pool.busy_fetchers(), 2);

        assert!(pool.abort(unit));
        let result = timeout(Duration::from_secs(1), resent_done)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(FetchError::Aborted { .. })));

        finish_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_abort_unknown_unit_is_noop() {
        let pool = FetchPool::new(GatedTransport::open(), &pool_config(2));
        let (_, unit, _) = job("/never");
        assert!(!pool.abort(unit));
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let transport = GatedTransport::failing();
        let pool = FetchPool::new(transport, &pool_config(1));

        let (job, _, done) = job("/down");
        pool.execute(job).await;
        let result = done.await.unwrap();
        assert!(matches!(result, Err(FetchError::Connect { .. })));

        // The fetcher survives a failed attempt
        assert_eq!(pool.live_fetchers(), 1);
    }

    #[tokio::test]
    async fn test_set_capacity_applies_limits() {
        let transport = GatedTransport::open();
        let pool = FetchPool::new(transport.clone(), &pool_config(20));
        assert_eq!(transport.last_limits(), Some(ConnectionLimits::for_capacity(20)));

        pool.set_capacity(6);
        assert_eq!(pool.capacity(), 6);
        assert_eq!(
            pool.connection_limits(),
            ConnectionLimits {
                per_route: 4,
                total: 13
            }
        );
        assert_eq!(transport.last_limits(), Some(pool.connection_limits()));
    }

    #[tokio::test]
    async fn test_dropped_execute_binds_nothing() {
        let transport = GatedTransport::new();
        let pool = FetchPool::new(transport.clone(), &pool_config(1));

        let (first, _, _) = job("/busy");
        pool.execute(first).await;

        let (second, second_unit, second_done) = job("/dropped");
        let waited = timeout(Duration::from_millis(30), pool.execute(second)).await;
        assert!(waited.is_err());
        assert!(!pool.abort(second_unit));
        // The job and its completion route were dropped with the future
        assert!(second_done.await.is_err());
        assert_eq!(pool.busy_fetchers(), 1);
    }
}
