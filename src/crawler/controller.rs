//! Crawl controller - the control loop that drives one crawl
//!
//! The controller reads entities from its store in offset order, asks its
//! strategy for fetch units, and feeds those units to a shared
//! [`FetchPool`] one dispatch per loop iteration. Completions come back on
//! fetcher tasks and are routed either to the strategy (success) or to the
//! retry list (failure).
//!
//! Control state only changes through signals sent over a single-slot
//! channel to the control task:
//! - `Pause` aborts in-flight units, requeues them for retry and parks the
//!   loop until `Resume` or `Stop`
//! - `Stop` aborts in-flight units and resets the controller so the next
//!   `start()` begins again at offset 0
//! - `Resume` while already working is ignored

use crate::config::ControllerConfig;
use crate::crawler::pool::{FetchPool, Job};
use crate::crawler::strategy::{guard_hook, CrawlStrategy};
use crate::crawler::unit::{FetchUnit, UnitId};
use crate::output::{CrawlStatistics, CrawlStats};
use crate::state::{ControlState, FetchState};
use crate::storage::{EntityStore, StoreError};
use crate::{CrawlError, FetchError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

/// Messages understood by the control task
enum Signal {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Stop,
}

/// A unit handed to the pool, tagged with the attempt it belongs to
struct Dispatched<E> {
    unit: Arc<FetchUnit<E>>,
    ticket: u64,
}

struct WorkLists<E> {
    offset: u64,
    pending: Vec<Dispatched<E>>,
    failed: VecDeque<Arc<FetchUnit<E>>>,
    buffered: VecDeque<Arc<FetchUnit<E>>>,
    /// Successful completions whose `on_complete` hook is still running
    completing: usize,
}

impl<E> WorkLists<E> {
    fn new() -> Self {
        Self {
            offset: 0,
            pending: Vec::new(),
            failed: VecDeque::new(),
            buffered: VecDeque::new(),
            completing: 0,
        }
    }

    fn is_settled(&self) -> bool {
        self.pending.is_empty()
            && self.failed.is_empty()
            && self.buffered.is_empty()
            && self.completing == 0
    }
}

struct Shared<E, St, S> {
    name: String,
    pool: FetchPool,
    store: St,
    strategy: S,
    store_retry: Duration,
    work: Mutex<WorkLists<E>>,
    state: watch::Sender<ControlState>,
    completed: Notify,
    stats: CrawlStats,
    next_ticket: AtomicU64,
}

struct LoopHandle {
    signals: mpsc::Sender<Signal>,
    task: JoinHandle<()>,
}

/// Point-in-time view of a controller's lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub state: ControlState,

    /// Offset of the next entity to read
    pub offset: u64,

    /// Units handed to the pool and not yet completed, in dispatch order
    pub pending: Vec<UnitId>,

    /// Units waiting to be resent, oldest first
    pub failed: Vec<UnitId>,

    /// Generated units not yet handed to the pool
    pub buffered: Vec<UnitId>,
}

/// Drives one crawl over an entity store with a strategy
///
/// A controller is constructed once and can be started, paused, resumed and
/// stopped any number of times. Stopping discards all progress; the next
/// start reads the store from offset 0 again.
///
/// # Example
///
/// ```no_run
/// use social_crawler::config::PoolConfig;
/// use social_crawler::crawler::{CrawlController, CrawlStrategy, FetchPool, FetchUnit};
/// use social_crawler::crawler::{FetchRequest, HttpTransport, ConnectionLimits};
/// use social_crawler::crawler::DEFAULT_CONNECT_TIMEOUT;
/// use social_crawler::storage::{EntityKey, MemoryStore};
/// use social_crawler::StrategyError;
/// use std::sync::Arc;
/// use url::Url;
///
/// #[derive(Clone)]
/// struct Page(String);
///
/// impl EntityKey for Page {
///     type Key = String;
///     fn key(&self) -> String {
///         self.0.clone()
///     }
/// }
///
/// struct Pages;
///
/// impl CrawlStrategy<Page> for Pages {
///     fn generate(&self, page: &Page) -> Result<Vec<FetchUnit<Page>>, StrategyError> {
///         let url = Url::parse(&page.0).map_err(|e| StrategyError::Generate(e.to_string()))?;
///         Ok(vec![FetchUnit::new(FetchRequest::get(url), page.clone())])
///     }
///
///     fn on_complete(&self, _unit: &FetchUnit<Page>, content: &str) -> Result<(), StrategyError> {
///         println!("{} bytes", content.len());
///         Ok(())
///     }
/// }
///
/// # async fn run(user_agent: social_crawler::config::UserAgentConfig) -> social_crawler::Result<()> {
/// let transport = HttpTransport::new(
///     user_agent,
///     DEFAULT_CONNECT_TIMEOUT,
///     ConnectionLimits::for_capacity(20),
/// )?;
/// let pool = FetchPool::new(Arc::new(transport), &PoolConfig::default());
/// let store = MemoryStore::with_entities(vec![Page("https://example.com/".to_string())]);
///
/// let controller = CrawlController::new("pages", pool, store, Pages);
/// controller.start().await?;
/// controller.wait_stopped().await;
/// # Ok(())
/// # }
/// ```
pub struct CrawlController<E, St, S> {
    shared: Arc<Shared<E, St, S>>,
    runtime: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl<E, St, S> CrawlController<E, St, S>
where
    E: Send + Sync + 'static,
    St: EntityStore<E> + 'static,
    S: CrawlStrategy<E> + 'static,
{
    /// Creates a stopped controller with the default store retry delay
    pub fn new(name: impl Into<String>, pool: FetchPool, store: St, strategy: S) -> Self {
        Self::with_config(name, pool, store, strategy, &ControllerConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        pool: FetchPool,
        store: St,
        strategy: S,
        config: &ControllerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ControlState::Stopped);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                pool,
                store,
                strategy,
                store_retry: config.store_retry(),
                work: Mutex::new(WorkLists::new()),
                state,
                completed: Notify::new(),
                stats: CrawlStats::new(),
                next_ticket: AtomicU64::new(0),
            }),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts the crawl, or resumes it if paused
    ///
    /// From `Stopped` this spawns a fresh control task that reads the store
    /// from offset 0. From `Paused` it resumes the parked task, which resends
    /// every failed unit before reading new entities. Does nothing while
    /// already working.
    pub async fn start(&self) -> crate::Result<()> {
        let mut runtime = self.runtime.lock().await;

        match self.state() {
            ControlState::Working => Ok(()),
            ControlState::Paused => {
                if let Some(handle) = runtime.as_ref() {
                    let (ack, acked) = oneshot::channel();
                    if handle.signals.send(Signal::Resume(ack)).await.is_ok() {
                        let _ = acked.await;
                    }
                }
                Ok(())
            }
            ControlState::Stopped => {
                // Reap the task of a crawl that stopped on its own
                if let Some(handle) = runtime.take() {
                    self.join(handle.task).await?;
                }

                let (signals, receiver) = mpsc::channel(1);
                self.shared.state.send_replace(ControlState::Working);
                self.shared.stats.mark_started();
                tracing::info!("Controller {} started", self.shared.name);

                let span = tracing::info_span!("controller", name = %self.shared.name);
                let task = tokio::spawn(Arc::clone(&self.shared).run(receiver).instrument(span));
                *runtime = Some(LoopHandle { signals, task });
                Ok(())
            }
        }
    }

    /// Pauses the crawl
    ///
    /// Returns once the control task has aborted every in-flight unit and
    /// moved it to the retry list. Does nothing unless working.
    pub async fn pause(&self) -> crate::Result<()> {
        let runtime = self.runtime.lock().await;
        if self.state() != ControlState::Working {
            return Ok(());
        }

        if let Some(handle) = runtime.as_ref() {
            let (ack, acked) = oneshot::channel();
            if handle.signals.send(Signal::Pause(ack)).await.is_ok() {
                // The ack is dropped unanswered if the loop stopped first
                let _ = acked.await;
            }
        }
        Ok(())
    }

    /// Stops the crawl and waits for the control task to exit
    ///
    /// Valid from any state. On return the controller is `Stopped` with an
    /// empty state and can be started again.
    pub async fn stop(&self) -> crate::Result<()> {
        let mut runtime = self.runtime.lock().await;
        let Some(handle) = runtime.take() else {
            return Ok(());
        };

        // Fails only if the loop already exited on its own
        let _ = handle.signals.send(Signal::Stop).await;
        self.join(handle.task).await
    }

    /// Waits until the controller reaches `Stopped`
    pub async fn wait_stopped(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == ControlState::Stopped).await;
    }

    pub fn state(&self) -> ControlState {
        *self.shared.state.borrow()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let lists = self.shared.lists();
        ControllerSnapshot {
            state: self.state(),
            offset: lists.offset,
            pending: lists.pending.iter().map(|d| d.unit.id()).collect(),
            failed: lists.failed.iter().map(|unit| unit.id()).collect(),
            buffered: lists.buffered.iter().map(|unit| unit.id()).collect(),
        }
    }

    pub fn stats(&self) -> CrawlStatistics {
        self.shared.stats.snapshot()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pool(&self) -> &FetchPool {
        &self.shared.pool
    }

    pub fn store(&self) -> &St {
        &self.shared.store
    }

    pub fn strategy(&self) -> &S {
        &self.shared.strategy
    }

    async fn join(&self, task: JoinHandle<()>) -> crate::Result<()> {
        if let Err(e) = task.await {
            tracing::error!("Control task of {} died: {}", self.shared.name, e);
            self.shared.reset();
            return Err(CrawlError::ControlLoop(e));
        }
        Ok(())
    }
}

impl<E, St, S> Shared<E, St, S>
where
    E: Send + Sync + 'static,
    St: EntityStore<E> + 'static,
    S: CrawlStrategy<E> + 'static,
{
    fn lists(&self) -> MutexGuard<'_, WorkLists<E>> {
        self.work.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<Signal>) {
        let mut raised: Option<Signal> = None;

        loop {
            let signal = match raised.take() {
                Some(signal) => Some(signal),
                None => match signals.try_recv() {
                    Ok(signal) => Some(signal),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => Some(Signal::Stop),
                },
            };

            match signal {
                Some(Signal::Pause(ack)) => {
                    self.park();
                    let _ = ack.send(());
                    if !self.wait_for_resume(&mut signals).await {
                        self.reset();
                        return;
                    }
                    continue;
                }
                Some(Signal::Resume(ack)) => {
                    let _ = ack.send(());
                    continue;
                }
                Some(Signal::Stop) => {
                    self.reset();
                    return;
                }
                None => {}
            }

            let queued = {
                let mut lists = self.lists();
                match lists.failed.pop_front() {
                    Some(unit) => Some((unit, true)),
                    None => lists.buffered.pop_front().map(|unit| (unit, false)),
                }
            };

            if let Some((unit, retry)) = queued {
                self.dispatch(unit, retry, &mut signals, &mut raised).await;
            } else {
                self.read_next(&mut signals, &mut raised).await;
            }

            tokio::task::yield_now().await;
        }
    }

    /// Reads the entity at the current offset and dispatches its first unit
    ///
    /// When the store has nothing at the offset, the offset stays put. The
    /// crawl stops if no unit is pending, queued or completing; otherwise the
    /// loop waits for the next completion and reads the same offset again,
    /// so entities a strategy inserts from `on_complete` are still crawled.
    async fn read_next(
        self: &Arc<Self>,
        signals: &mut mpsc::Receiver<Signal>,
        raised: &mut Option<Signal>,
    ) {
        let completed = self.completed.notified();
        tokio::pin!(completed);
        completed.as_mut().enable();

        // Checked before the read: a hook that finishes after this point
        // leaves `settled` false and the offset is polled again
        let (offset, settled) = {
            let lists = self.lists();
            (lists.offset, lists.is_settled())
        };

        let found = self
            .blocking(move |shared: &Self| shared.store.find(offset))
            .await
            .unwrap_or_else(|e| Err(StoreError::Backend(format!("find panicked: {}", e))));

        let entity = match found {
            Ok(Some(entity)) => entity,
            Ok(None) if settled => {
                tracing::info!("No entity at offset {}, finishing crawl", offset);
                *raised = Some(Signal::Stop);
                return;
            }
            Ok(None) => {
                tracing::debug!("No entity at offset {} yet, waiting for completions", offset);
                tokio::select! {
                    _ = completed => {}
                    signal = signals.recv() => *raised = Some(signal.unwrap_or(Signal::Stop)),
                }
                return;
            }
            Err(e) => {
                self.stats.store_error();
                tracing::warn!(
                    "Failed to read entity at offset {}, retrying in {:?}: {}",
                    offset,
                    self.store_retry,
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.store_retry) => {}
                    signal = signals.recv() => *raised = Some(signal.unwrap_or(Signal::Stop)),
                }
                return;
            }
        };

        self.lists().offset += 1;
        self.stats.entity_read();

        let context = format!("generating units for entity {}", offset);
        let generated = self
            .blocking({
                let context = context.clone();
                move |shared: &Self| guard_hook(&context, || shared.strategy.generate(&entity))
            })
            .await
            .unwrap_or_else(|e| {
                Err(CrawlError::Strategy {
                    context,
                    message: e.to_string(),
                })
            });

        let units = match generated {
            Ok(units) => units,
            Err(e) => {
                self.stats.hook_error();
                tracing::error!("Skipping entity {}: {}", offset, e);
                return;
            }
        };

        self.stats.units_generated(units.len());
        tracing::debug!("Entity {} produced {} units", offset, units.len());

        let mut units = units.into_iter().map(Arc::new);
        if let Some(head) = units.next() {
            self.lists().buffered.extend(units);
            self.dispatch(head, false, signals, raised).await;
        }
    }

    /// Runs a synchronous store or strategy call on the blocking pool
    async fn blocking<T, F>(self: &Arc<Self>, call: F) -> Result<T, JoinError>
    where
        F: FnOnce(&Self) -> T + Send + 'static,
        T: Send + 'static,
    {
        let shared = Arc::clone(self);
        tokio::task::spawn_blocking(move || call(&shared)).await
    }

    /// Hands one unit to the pool
    ///
    /// The unit is recorded as pending before the pool sees it. If a signal
    /// arrives while the pool is saturated, the submission is abandoned, the
    /// unit goes back to the head of the list it came from and the signal is
    /// kept for the next iteration.
    async fn dispatch(
        self: &Arc<Self>,
        unit: Arc<FetchUnit<E>>,
        retry: bool,
        signals: &mut mpsc::Receiver<Signal>,
        raised: &mut Option<Signal>,
    ) {
        let attempt = unit.begin_attempt();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.lists().pending.push(Dispatched {
            unit: Arc::clone(&unit),
            ticket,
        });
        self.stats.unit_dispatched(retry);
        tracing::debug!(
            "Dispatching {} {} (attempt {})",
            unit.id(),
            unit.request().url(),
            attempt
        );

        let shared: Weak<Self> = Arc::downgrade(self);
        let routed = Arc::clone(&unit);
        let job = Job::new(unit.id(), unit.request().clone(), move |result| {
            if let Some(shared) = shared.upgrade() {
                shared.on_completion(&routed, ticket, result);
            }
        });

        tokio::select! {
            biased;
            signal = signals.recv() => {
                *raised = Some(signal.unwrap_or(Signal::Stop));
                let mut lists = self.lists();
                if let Some(index) = lists.position(&unit, ticket) {
                    lists.pending.remove(index);
                    unit.resolve(FetchState::Failed);
                    if retry {
                        lists.failed.push_front(unit);
                    } else {
                        lists.buffered.push_front(unit);
                    }
                }
            }
            _ = self.pool.execute(job) => {}
        }
    }

    /// Routes the outcome of one attempt; runs on a fetcher task
    fn on_completion(
        &self,
        unit: &Arc<FetchUnit<E>>,
        ticket: u64,
        result: Result<String, FetchError>,
    ) {
        let outcome = if result.is_ok() {
            FetchState::Successful
        } else {
            FetchState::Failed
        };

        {
            let mut lists = self.lists();
            let Some(index) = lists.position(unit, ticket) else {
                drop(lists);
                self.stats.stale_completion();
                tracing::trace!("Dropping stale completion for {}", unit.id());
                return;
            };

            lists.pending.remove(index);
            unit.resolve(outcome);
            match outcome {
                FetchState::Failed => lists.failed.push_back(Arc::clone(unit)),
                _ => lists.completing += 1,
            }
        }

        match result {
            Ok(body) => {
                self.stats.unit_succeeded();
                let context = format!("completing {}", unit.id());
                if let Err(e) = guard_hook(&context, || self.strategy.on_complete(unit, &body)) {
                    self.stats.hook_error();
                    tracing::error!("{}", e);
                }
                self.lists().completing -= 1;
            }
            Err(e) => {
                self.stats.unit_failed();
                tracing::warn!(
                    "{} failed on attempt {}, queued for retry: {}",
                    unit.id(),
                    unit.attempts(),
                    e
                );
            }
        }

        self.completed.notify_one();
    }

    /// Aborts every pending unit and moves it to the retry list
    fn park(&self) {
        let parked = {
            let mut lists = self.lists();
            let pending = std::mem::take(&mut lists.pending);
            let parked = pending.len();
            for Dispatched { unit, .. } in pending {
                self.pool.abort(unit.id());
                unit.resolve(FetchState::Failed);
                self.stats.unit_failed();
                lists.failed.push_back(unit);
            }
            parked
        };

        self.state.send_replace(ControlState::Paused);
        tracing::info!("Controller {} paused, {} units requeued", self.name, parked);
    }

    /// Blocks until resumed; returns `false` if told to stop instead
    async fn wait_for_resume(&self, signals: &mut mpsc::Receiver<Signal>) -> bool {
        loop {
            match signals.recv().await {
                Some(Signal::Resume(ack)) => {
                    self.state.send_replace(ControlState::Working);
                    tracing::info!("Controller {} resumed", self.name);
                    let _ = ack.send(());
                    return true;
                }
                Some(Signal::Pause(ack)) => {
                    let _ = ack.send(());
                }
                Some(Signal::Stop) | None => return false,
            }
        }
    }

    /// Aborts in-flight units and clears all progress
    fn reset(&self) {
        let offset = {
            let mut lists = self.lists();
            for Dispatched { unit, .. } in lists.pending.drain(..) {
                self.pool.abort(unit.id());
                unit.resolve(FetchState::Failed);
            }
            lists.failed.clear();
            lists.buffered.clear();
            std::mem::replace(&mut lists.offset, 0)
        };

        self.state.send_replace(ControlState::Stopped);
        self.stats.mark_finished();
        tracing::info!("Controller {} stopped at offset {}", self.name, offset);
    }
}

impl<E> WorkLists<E> {
    fn position(&self, unit: &FetchUnit<E>, ticket: u64) -> Option<usize> {
        self.pending
            .iter()
            .position(|d| d.ticket == ticket && d.unit.id() == unit.id())
    }
}
