//! Scripted transport for pool and controller unit tests

use crate::crawler::fetcher::{ConnectionLimits, Transport};
use crate::crawler::unit::FetchRequest;
use crate::FetchError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use url::Url;

pub(crate) fn test_request(path: &str) -> FetchRequest {
    FetchRequest::get(Url::parse(&format!("http://crawler.test{}", path)).unwrap())
}

/// Transport whose responses are released by the test
///
/// Gated transports hold every fetch until [`GatedTransport::release`] hands
/// out permits. Paths registered with [`GatedTransport::fail_times`] fail
/// with a timeout that many times before succeeding. Successful fetches
/// return the request path as the body.
pub(crate) struct GatedTransport {
    gate: Option<Semaphore>,
    always_fail: bool,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    limits: Mutex<Option<ConnectionLimits>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GatedTransport {
    fn build(gate: Option<Semaphore>, always_fail: bool) -> Arc<Self> {
        Arc::new(Self {
            gate,
            always_fail,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limits: Mutex::new(None),
        })
    }

    /// Every fetch waits for a released permit
    pub(crate) fn new() -> Arc<Self> {
        Self::build(Some(Semaphore::new(0)), false)
    }

    /// Fetches complete immediately
    pub(crate) fn open() -> Arc<Self> {
        Self::build(None, false)
    }

    /// Every fetch fails with a connection error
    pub(crate) fn failing() -> Arc<Self> {
        Self::build(None, true)
    }

    pub(crate) fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub(crate) fn fail_times(&self, path: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
    }

    /// Paths requested so far, in order
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, path: &str) -> usize {
        self.calls().iter().filter(|call| *call == path).count()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn last_limits(&self) -> Option<ConnectionLimits> {
        *self.limits.lock().unwrap()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let path = request.url().path().to_string();
        self.calls.lock().unwrap().push(path.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.always_fail {
            return Err(FetchError::Connect {
                url: request.url().to_string(),
                message: "connection refused".to_string(),
            });
        }

        let should_fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&path) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(FetchError::Timeout {
                url: request.url().to_string(),
            });
        }

        Ok(path)
    }

    fn apply_limits(&self, limits: ConnectionLimits) {
        *self.limits.lock().unwrap() = Some(limits);
    }
}
