//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock HTTP servers and test
//! the full crawl cycle end-to-end.

use social_crawler::config::{load_config, Config, PoolConfig, UserAgentConfig};
use social_crawler::crawler::{
    ConnectionLimits, CrawlController, CrawlStrategy, FetchPool, FetchRequest, FetchUnit,
    HttpTransport, Transport, DEFAULT_CONNECT_TIMEOUT,
};
use social_crawler::storage::{EntityKey, MemoryStore};
use social_crawler::{ControlState, FetchError, StrategyError};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn user_agent() -> UserAgentConfig {
    UserAgentConfig {
        crawler_name: "TestBot".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: "https://example.com/contact".to_string(),
        contact_email: "test@example.com".to_string(),
    }
}

fn transport(capacity: usize) -> HttpTransport {
    HttpTransport::new(
        user_agent(),
        DEFAULT_CONNECT_TIMEOUT,
        ConnectionLimits::for_capacity(capacity),
    )
    .expect("Failed to build transport")
}

fn pool_config(capacity: usize) -> PoolConfig {
    PoolConfig {
        max_concurrency: capacity,
        idle_tick_ms: 50,
        ..PoolConfig::default()
    }
}

/// A page path on the mock server
#[derive(Debug, Clone, PartialEq)]
struct Page {
    url: Url,
}

impl EntityKey for Page {
    type Key = String;

    fn key(&self) -> String {
        self.url.to_string()
    }
}

/// Fetches each page once and records the bodies it saw
#[derive(Default)]
struct BodyRecorder {
    bodies: Mutex<Vec<(String, String)>>,
}

impl BodyRecorder {
    fn bodies(&self) -> Vec<(String, String)> {
        let mut bodies = self.bodies.lock().unwrap().clone();
        bodies.sort();
        bodies
    }
}

impl CrawlStrategy<Page> for BodyRecorder {
    fn generate(&self, page: &Page) -> Result<Vec<FetchUnit<Page>>, StrategyError> {
        let request = FetchRequest::get(page.url.clone()).header("X-Crawl", "integration");
        Ok(vec![FetchUnit::new(request, page.clone())])
    }

    fn on_complete(&self, unit: &FetchUnit<Page>, content: &str) -> Result<(), StrategyError> {
        self.bodies
            .lock()
            .unwrap()
            .push((unit.entity().url.path().to_string(), content.to_string()));
        Ok(())
    }
}

fn pages(server: &MockServer, paths: &[&str]) -> MemoryStore<Page> {
    MemoryStore::with_entities(paths.iter().map(|p| Page {
        url: Url::parse(&format!("{}{}", server.uri(), p)).unwrap(),
    }))
}

#[tokio::test]
async fn test_transport_returns_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"nick\":\"abc\"}"))
        .mount(&mock_server)
        .await;

    let url = Url::parse(&format!("{}/profile", mock_server.uri())).unwrap();
    let body = transport(4).fetch(&FetchRequest::get(url)).await.unwrap();
    assert_eq!(body, "{\"nick\":\"abc\"}");
}

#[tokio::test]
async fn test_transport_treats_non_success_as_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/moved"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&mock_server)
        .await;

    let transport = transport(4);

    let url = Url::parse(&format!("{}/missing", mock_server.uri())).unwrap();
    let err = transport.fetch(&FetchRequest::get(url)).await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 404, .. }));

    let url = Url::parse(&format!("{}/moved", mock_server.uri())).unwrap();
    let err = transport.fetch(&FetchRequest::get(url)).await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 304, .. }));
}

#[tokio::test]
async fn test_transport_sends_headers_and_user_agent() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/feeds"))
        .and(header("cookie", "uin=o0012345"))
        .and(header(
            "user-agent",
            "TestBot/1.0.0 (+https://example.com/contact; test@example.com)",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let url = Url::parse(&format!("{}/feeds", mock_server.uri())).unwrap();
    let request = FetchRequest::new(reqwest::Method::POST, url).header("Cookie", "uin=o0012345");
    let body = transport(4).fetch(&request).await.unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_transport_connection_refused() {
    // Nothing listens on the discard port
    let url = Url::parse("http://127.0.0.1:9/").unwrap();
    let err = transport(1).fetch(&FetchRequest::get(url)).await.unwrap_err();
    assert!(!err.is_abort());
}

#[tokio::test]
async fn test_full_crawl_retries_failed_pages() {
    let mock_server = MockServer::start().await;

    // The first request for /flaky fails, later ones succeed
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("flaky page"))
        .mount(&mock_server)
        .await;
    for (p, body) in [("/a", "page a"), ("/b", "page b")] {
        Mock::given(method("GET"))
            .and(path(p))
            .and(header("x-crawl", "integration"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let pool = FetchPool::new(Arc::new(transport(2)), &pool_config(2));
    let controller = CrawlController::new(
        "integration",
        pool,
        pages(&mock_server, &["/a", "/flaky", "/b"]),
        BodyRecorder::default(),
    );

    controller.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), controller.wait_stopped())
        .await
        .expect("Crawl did not finish");

    assert_eq!(
        controller.strategy().bodies(),
        vec![
            ("/a".to_string(), "page a".to_string()),
            ("/b".to_string(), "page b".to_string()),
            ("/flaky".to_string(), "flaky page".to_string()),
        ]
    );

    let stats = controller.stats();
    assert_eq!(stats.entities_read, 3);
    assert_eq!(stats.units_failed, 1);
    assert_eq!(stats.units_retried, 1);
    assert_eq!(stats.units_succeeded, 3);
    assert!(stats.finished_at.is_some());

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, ControlState::Stopped);
    assert_eq!(snapshot.offset, 0);
    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_pause_aborts_slow_requests() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&mock_server)
        .await;

    let pool = FetchPool::new(Arc::new(transport(4)), &pool_config(4));
    let controller = CrawlController::new(
        "slow",
        pool.clone(),
        pages(&mock_server, &["/one", "/two"]),
        BodyRecorder::default(),
    );

    controller.start().await.unwrap();
    for _ in 0..200 {
        if controller.snapshot().pending.len() == 2 && pool.busy_fetchers() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(controller.snapshot().pending.len(), 2);

    tokio::time::timeout(Duration::from_secs(2), controller.pause())
        .await
        .expect("Pause did not return")
        .unwrap();

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, ControlState::Paused);
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.failed.len(), 2);

    tokio::time::timeout(Duration::from_secs(2), controller.stop())
        .await
        .expect("Stop did not return")
        .unwrap();
    assert_eq!(controller.state(), ControlState::Stopped);
    assert!(controller.snapshot().failed.is_empty());
    assert!(controller.strategy().bodies().is_empty());
}

#[tokio::test]
async fn test_config_file_drives_transport_and_pool() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("home"))
        .mount(&mock_server)
        .await;

    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[pool]
max-concurrency = 6
connect-timeout-ms = 500

[user-agent]
crawler-name = "TestBot"
crawler-version = "1.0.0"
contact-url = "https://example.com/contact"
contact-email = "test@example.com"

[[seed]]
url = "{}/"
"#,
        mock_server.uri()
    )
    .unwrap();

    let config: Config = load_config(file.path()).unwrap();
    assert_eq!(config.pool.max_concurrency, 6);
    assert_eq!(config.seeds.len(), 1);

    let transport = HttpTransport::from_config(&config).unwrap();
    assert_eq!(
        transport.limits(),
        ConnectionLimits {
            per_route: 4,
            total: 13
        }
    );

    let pool = FetchPool::new(Arc::new(transport), &config.pool);
    assert_eq!(pool.capacity(), 6);

    let store = MemoryStore::with_entities(config.seeds.iter().map(|seed| Page {
        url: Url::parse(&seed.url).unwrap(),
    }));
    let controller = CrawlController::with_config(
        "from-config",
        pool,
        store,
        BodyRecorder::default(),
        &config.controller,
    );
    controller.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), controller.wait_stopped())
        .await
        .expect("Crawl did not finish");

    assert_eq!(
        controller.strategy().bodies(),
        vec![("/".to_string(), "home".to_string())]
    );
}
