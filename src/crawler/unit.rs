//! Fetch unit model
//!
//! A fetch unit is one schedulable request together with the entity it was
//! generated for and the state of its current attempt.

use crate::state::FetchState;
use reqwest::Method;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use url::Url;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a fetch unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Outbound request descriptor
#[derive(Debug, Clone)]
pub struct FetchRequest {
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
        }
    }

    /// Creates a GET request for `url`
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Adds a header to the request
    ///
    /// # Example
    ///
    /// ```
    /// use social_crawler::crawler::FetchRequest;
    /// use url::Url;
    ///
    /// let request = FetchRequest::get(Url::parse("https://example.com/").unwrap())
    ///     .header("Cookie", "uin=o0000012345; skey=abc");
    /// assert_eq!(request.headers().len(), 1);
    /// ```
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// A unit of dispatchable work
///
/// Units are created by a [`CrawlStrategy`](crate::crawler::CrawlStrategy)
/// and owned by the controller that asked for them. The entity is opaque to
/// the engine; the optional label lets a strategy tell its own request kinds
/// apart when the unit comes back in `on_complete`.
pub struct FetchUnit<E> {
    id: UnitId,
    request: FetchRequest,
    entity: E,
    label: Option<String>,
    state: AtomicU8,
    attempts: AtomicU32,
}

impl<E> FetchUnit<E> {
    pub fn new(request: FetchRequest, entity: E) -> Self {
        Self {
            id: UnitId::next(),
            request,
            entity,
            label: None,
            state: AtomicU8::new(FetchState::Pending.as_u8()),
            attempts: AtomicU32::new(0),
        }
    }

    /// Tags the unit with a strategy-defined label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// State of the current (or last) attempt
    pub fn state(&self) -> FetchState {
        FetchState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of times the unit has been handed to the pool
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Resets the state to `Pending` for a new attempt and returns its number
    pub(crate) fn begin_attempt(&self) -> u32 {
        self.state.store(FetchState::Pending.as_u8(), Ordering::Release);
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Moves the current attempt out of `Pending`
    ///
    /// Only the first resolution of an attempt wins, so an abort racing a
    /// completion cannot flip the outcome twice. Returns whether this call
    /// performed the transition.
    pub(crate) fn resolve(&self, outcome: FetchState) -> bool {
        debug_assert!(outcome.is_terminal());
        self.state
            .compare_exchange(
                FetchState::Pending.as_u8(),
                outcome.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl<E: fmt::Debug> fmt::Debug for FetchUnit<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchUnit")
            .field("id", &self.id)
            .field("method", self.request.method())
            .field("url", &self.request.url().as_str())
            .field("label", &self.label)
            .field("entity", &self.entity)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}
