//! Feed poller tests against an in-process mock package feed.

use replug_core::config::FeedConfig;
use replug_core::watcher::{FeedPoller, PluginSourceWatcher, ReloadTrigger};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Default)]
struct MockFeed {
    queries: AtomicUsize,
    downloads: AtomicUsize,
    fail_queries: AtomicBool,
    package_missing: AtomicBool,
    saw_basic_auth: AtomicBool,
}

async fn query_handler(State(state): State<Arc<MockFeed>>, headers: HeaderMap) -> Response {
    state.queries.fetch_add(1, Ordering::SeqCst);
    if headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Basic "))
        .unwrap_or(false)
    {
        state.saw_basic_auth.store(true, Ordering::SeqCst);
    }
    if state.fail_queries.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({ "data": [ { "id": "Reports", "version": "1.0.2" } ] })).into_response()
}

async fn registration_handler(State(state): State<Arc<MockFeed>>) -> Response {
    if state.package_missing.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "items": [{
            "items": [
                { "catalogEntry": { "id": "Reports", "version": "1.0.1" } },
                { "catalogEntry": { "id": "Reports", "version": "1.0.2" } }
            ]
        }]
    }))
    .into_response()
}

async fn flatcontainer_handler(State(state): State<Arc<MockFeed>>) -> Response {
    state.downloads.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, b"archive bytes".to_vec()).into_response()
}

async fn start_feed() -> (String, Arc<MockFeed>) {
    let state = Arc::new(MockFeed::default());

    let app = Router::new()
        .route("/v3/query", get(query_handler))
        .route("/v3/registration/reports/index.json", get(registration_handler))
        .route(
            "/v3/flatcontainer/reports/1.0.2/reports.1.0.2.zip",
            get(flatcontainer_handler),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{}/v3", addr.port()), state)
}

fn poller_config(url: String, tmp: &TempDir) -> FeedConfig {
    FeedConfig {
        url,
        poll_interval: Duration::from_millis(50),
        download_path: tmp.path().join("staging"),
        ..FeedConfig::default()
    }
}

#[tokio::test]
async fn downloads_new_version_once() {
    let (url, feed) = start_feed().await;
    let tmp = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::channel::<ReloadTrigger>(8);

    let poller = FeedPoller::new(poller_config(url, &tmp), tx).unwrap();
    poller.start().await.unwrap();

    let trigger = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("new version should trigger")
        .unwrap();
    assert_eq!(trigger.artifacts.len(), 1);
    let artifact = &trigger.artifacts[0];
    assert_eq!(artifact.name, "Reports");
    assert_eq!(artifact.version.to_string(), "1.0.2");

    // Staged under <root>/<id>/<version>/<id>.<version>.zip.
    let staged = tmp
        .path()
        .join("staging")
        .join("Reports")
        .join("1.0.2")
        .join("Reports.1.0.2.zip");
    assert!(staged.is_file());
    assert_eq!(
        poller.last_known_versions().get("Reports").unwrap().to_string(),
        "1.0.2"
    );

    // The same feed response again must not re-download or re-trigger.
    let extra = timeout(Duration::from_millis(400), rx.recv()).await;
    assert!(extra.is_err(), "unchanged version must not trigger");
    assert_eq!(feed.downloads.load(Ordering::SeqCst), 1);

    poller.stop().await;
}

#[tokio::test]
async fn basic_auth_is_sent_when_configured() {
    let (url, feed) = start_feed().await;
    let tmp = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::channel::<ReloadTrigger>(8);

    let mut config = poller_config(url, &tmp);
    config.username = Some("svc".to_string());
    config.password = Some("secret".to_string());

    let poller = FeedPoller::new(config, tx).unwrap();
    poller.start().await.unwrap();

    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("poll should succeed")
        .unwrap();
    assert!(feed.saw_basic_auth.load(Ordering::SeqCst));

    poller.stop().await;
}

#[tokio::test]
async fn missing_package_is_not_a_failure() {
    let (url, feed) = start_feed().await;
    feed.package_missing.store(true, Ordering::SeqCst);
    let tmp = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::channel::<ReloadTrigger>(8);

    let mut config = poller_config(url, &tmp);
    config.failure_threshold = 2;

    let poller = FeedPoller::new(config, tx).unwrap();
    poller.start().await.unwrap();

    // Well past the failure threshold in poll counts: polling must continue
    // because 404 does not count toward the breaker.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(feed.queries.load(Ordering::SeqCst) > 4);
    assert_eq!(feed.downloads.load(Ordering::SeqCst), 0);
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    poller.stop().await;
}

#[tokio::test]
async fn consecutive_failures_open_the_circuit() {
    let (url, feed) = start_feed().await;
    feed.fail_queries.store(true, Ordering::SeqCst);
    let tmp = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::channel::<ReloadTrigger>(8);

    let mut config = poller_config(url, &tmp);
    config.failure_threshold = 3;
    config.circuit_cooldown = Duration::from_secs(30);

    let poller = FeedPoller::new(config, tx).unwrap();
    poller.start().await.unwrap();

    // Wait for the breaker to trip, then confirm polling stops.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let after_trip = feed.queries.load(Ordering::SeqCst);
    assert!(after_trip >= 3, "breaker needs three failures to open");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        feed.queries.load(Ordering::SeqCst),
        after_trip,
        "open breaker must suspend polling"
    );

    poller.stop().await;
}
