//! HTTP transport for the fetch pool
//!
//! This module handles all outbound requests, including:
//! - Building HTTP clients with proper user agent strings
//! - Sizing the shared connection pool from the fetch pool capacity
//! - Executing a request and returning its body as text
//! - Error classification

use crate::config::{Config, UserAgentConfig};
use crate::crawler::unit::FetchRequest;
use crate::FetchError;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Reference connect timeout applied to every fetch
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Connection pool limits derived from the fetch pool capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Connections kept per host
    pub per_route: usize,

    /// Connections open at once across all hosts
    pub total: usize,
}

impl ConnectionLimits {
    /// Derives limits for a pool of `capacity` fetchers
    ///
    /// # Example
    ///
    /// ```
    /// use social_crawler::crawler::ConnectionLimits;
    ///
    /// let limits = ConnectionLimits::for_capacity(20);
    /// assert_eq!(limits.per_route, 11);
    /// assert_eq!(limits.total, 41);
    /// ```
    pub fn for_capacity(capacity: usize) -> Self {
        Self {
            per_route: capacity / 2 + 1,
            total: capacity * 2 + 1,
        }
    }
}

/// Executes fetch requests for the pool
///
/// Implementations must be cancel-safe: the pool drops the `fetch` future
/// when a unit is aborted.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the request and returns the response body
    async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError>;

    /// Applies new connection limits after the pool capacity changed
    fn apply_limits(&self, _limits: ConnectionLimits) {}
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
/// * `connect_timeout` - Connect timeout applied to every request
/// * `limits` - Connection pool limits
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use social_crawler::config::UserAgentConfig;
/// use social_crawler::crawler::{build_http_client, ConnectionLimits, DEFAULT_CONNECT_TIMEOUT};
///
/// let config = UserAgentConfig {
///     crawler_name: "SocialCrawler".to_string(),
///     crawler_version: "0.1".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(
///     &config,
///     DEFAULT_CONNECT_TIMEOUT,
///     ConnectionLimits::for_capacity(20),
/// )
/// .unwrap();
/// ```
pub fn build_http_client(
    config: &UserAgentConfig,
    connect_timeout: Duration,
    limits: ConnectionLimits,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(limits.per_route)
        .gzip(true)
        .brotli(true)
        .build()
}

/// Client plus the permits capping concurrent connections
struct Wire {
    client: Client,
    connections: Arc<Semaphore>,
    limits: ConnectionLimits,
}

/// reqwest-backed [`Transport`]
///
/// Any non-2xx status is treated as a failed attempt.
pub struct HttpTransport {
    user_agent: UserAgentConfig,
    connect_timeout: Duration,
    wire: RwLock<Arc<Wire>>,
}

impl HttpTransport {
    pub fn new(
        user_agent: UserAgentConfig,
        connect_timeout: Duration,
        limits: ConnectionLimits,
    ) -> Result<Self, reqwest::Error> {
        let wire = Self::build_wire(&user_agent, connect_timeout, limits)?;
        Ok(Self {
            user_agent,
            connect_timeout,
            wire: RwLock::new(Arc::new(wire)),
        })
    }

    /// Builds the transport described by a loaded configuration
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        Self::new(
            config.user_agent.clone(),
            config.pool.connect_timeout(),
            ConnectionLimits::for_capacity(config.pool.max_concurrency),
        )
    }

    /// Limits currently in effect
    pub fn limits(&self) -> ConnectionLimits {
        self.current().limits
    }

    fn build_wire(
        user_agent: &UserAgentConfig,
        connect_timeout: Duration,
        limits: ConnectionLimits,
    ) -> Result<Wire, reqwest::Error> {
        Ok(Wire {
            client: build_http_client(user_agent, connect_timeout, limits)?,
            connections: Arc::new(Semaphore::new(limits.total)),
            limits,
        })
    }

    fn current(&self) -> Arc<Wire> {
        Arc::clone(&self.wire.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let url = request.url().as_str();
        let wire = self.current();

        let _permit = wire
            .connections
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| FetchError::Other {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let mut builder = wire
            .client
            .request(request.method().clone(), request.url().clone());
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|e| FetchError::Body {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    fn apply_limits(&self, limits: ConnectionLimits) {
        if self.current().limits == limits {
            return;
        }

        match Self::build_wire(&self.user_agent, self.connect_timeout, limits) {
            Ok(wire) => {
                *self.wire.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(wire);
                tracing::debug!(
                    "Connection limits set to {} per route, {} total",
                    limits.per_route,
                    limits.total
                );
            }
            Err(e) => {
                tracing::warn!("Failed to rebuild HTTP client, keeping old limits: {}", e);
            }
        }
    }
}

/// Classifies a reqwest error into a [`FetchError`]
pub fn classify_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else if error.is_connect() {
        FetchError::Connect {
            url: url.to_string(),
            message: error.to_string(),
        }
    } else if error.is_body() || error.is_decode() {
        FetchError::Body {
            url: url.to_string(),
            message: error.to_string(),
        }
    } else {
        FetchError::Other {
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}
