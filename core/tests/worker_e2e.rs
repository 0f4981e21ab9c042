//! End-to-end worker lifecycle tests against an in-process mock
//! orchestration service.

use replug_core::coordinator::ReloadCoordinator;
use replug_core::loader::{ArtifactLoad, LoadOutcome};
use replug_core::plugin::{InvocationError, PluginTask};
use replug_core::registry::{ArtifactRegistry, RegistrationSet, TaskHandle};
use replug_core::worker::{ManagerConfig, WorkerLifecycleManager};
use replug_core::{Artifact, OrchestratorClient, ReplugError};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockOrchestrator {
    registrations: Mutex<Vec<Value>>,
    queue: Mutex<VecDeque<Value>>,
    completions: Mutex<Vec<(String, Value)>>,
    failures: Mutex<Vec<(String, Value)>>,
}

impl MockOrchestrator {
    fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    fn last_registered_task_kinds(&self) -> Vec<String> {
        self.registrations
            .lock()
            .unwrap()
            .last()
            .and_then(|body| body.get("task_kinds").cloned())
            .map(|kinds| serde_json::from_value(kinds).unwrap())
            .unwrap_or_default()
    }

    fn enqueue(&self, item: Value) {
        self.queue.lock().unwrap().push_back(item);
    }
}

async fn start_mock() -> (String, Arc<MockOrchestrator>) {
    let state = Arc::new(MockOrchestrator::default());

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/workers", post(register_handler))
        .route("/api/v1/queues/:queue/poll", get(poll_handler))
        .route("/api/v1/executions/:id/complete", post(complete_handler))
        .route("/api/v1/executions/:id/fail", post(fail_handler))
        .route("/api/v1/workers/:id/heartbeat", post(|| async { "ok" }))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("127.0.0.1:{}", addr.port()), state)
}

async fn register_handler(
    State(state): State<Arc<MockOrchestrator>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.registrations.lock().unwrap().push(body);
    Json(json!({ "ok": true }))
}

async fn poll_handler(
    State(state): State<Arc<MockOrchestrator>>,
    Path(_queue): Path<String>,
) -> Response {
    match state.queue.lock().unwrap().pop_front() {
        Some(item) => Json(item).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn complete_handler(
    State(state): State<Arc<MockOrchestrator>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.completions.lock().unwrap().push((id, body));
    Json(json!({ "ok": true }))
}

async fn fail_handler(
    State(state): State<Arc<MockOrchestrator>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.failures.lock().unwrap().push((id, body));
    Json(json!({ "ok": true }))
}

struct EchoTask(&'static str);

impl PluginTask for EchoTask {
    fn kind(&self) -> &str {
        self.0
    }

    fn call(&self, input: &[u8]) -> Result<Vec<u8>, InvocationError> {
        Ok(input.to_vec())
    }
}

fn set_of(kinds: &[&'static str]) -> RegistrationSet {
    let mut set = RegistrationSet::new();
    for kind in kinds {
        set.insert_task(TaskHandle::baseline(Box::new(EchoTask(kind))));
    }
    set
}

fn fast_manager_config() -> ManagerConfig {
    ManagerConfig {
        poll_timeout: Duration::from_millis(200),
        no_work_backoff: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(60),
        drain_poll_interval: Duration::from_millis(20),
        settle_delay: Duration::from_millis(50),
        ..ManagerConfig::default()
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool, deadline: Duration) -> bool {
    let until = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < until {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

#[tokio::test]
async fn cold_start_with_no_plugins_registers_baseline() {
    let (server, mock) = start_mock().await;
    let client = OrchestratorClient::connect(&server).await.unwrap();

    let manager = WorkerLifecycleManager::new(
        client,
        fast_manager_config(),
        set_of(&["local-echo", "local-status"]),
    );
    manager.start(RegistrationSet::new()).await.unwrap();

    assert_eq!(manager.epoch(), 1);
    assert!(manager.is_running());
    assert_eq!(
        mock.last_registered_task_kinds(),
        vec!["local-echo", "local-status"]
    );
    assert_eq!(
        manager.current_registration().task_kinds(),
        vec!["local-echo", "local-status"]
    );

    manager.stop(None).await;
}

#[tokio::test]
async fn worker_executes_polled_items() {
    let (server, mock) = start_mock().await;
    let client = OrchestratorClient::connect(&server).await.unwrap();

    let manager =
        WorkerLifecycleManager::new(client, fast_manager_config(), set_of(&["local-echo"]));
    manager.start(RegistrationSet::new()).await.unwrap();

    let execution_id = "7f5c9f4e-4a6c-4d9f-8a9b-0123456789ab";
    mock.enqueue(json!({
        "id": execution_id,
        "kind": "local-echo",
        "input": { "message": "hello" }
    }));

    assert!(
        wait_for(|| !mock.completions.lock().unwrap().is_empty(), Duration::from_secs(5)).await,
        "work item should complete"
    );
    let completions = mock.completions.lock().unwrap();
    let (id, body) = &completions[0];
    assert_eq!(id.as_str(), execution_id);
    assert_eq!(body["output"], json!({ "message": "hello" }));
    drop(completions);

    manager.stop(None).await;
}

#[tokio::test]
async fn unknown_kind_fails_item_without_killing_worker() {
    let (server, mock) = start_mock().await;
    let client = OrchestratorClient::connect(&server).await.unwrap();

    let manager =
        WorkerLifecycleManager::new(client, fast_manager_config(), set_of(&["local-echo"]));
    manager.start(RegistrationSet::new()).await.unwrap();

    mock.enqueue(json!({
        "id": "11111111-2222-3333-4444-555555555555",
        "kind": "does-not-exist"
    }));

    assert!(
        wait_for(|| !mock.failures.lock().unwrap().is_empty(), Duration::from_secs(5)).await,
        "unknown kind should be reported as failed"
    );
    let failures = mock.failures.lock().unwrap();
    assert!(failures[0].1["error"]
        .as_str()
        .unwrap()
        .contains("not registered"));
    drop(failures);

    assert!(manager.is_running());
    manager.stop(None).await;
}

#[tokio::test]
async fn reload_swaps_worker_and_advances_epoch() {
    let (server, mock) = start_mock().await;
    let client = OrchestratorClient::connect(&server).await.unwrap();

    let manager = Arc::new(WorkerLifecycleManager::new(
        client,
        fast_manager_config(),
        set_of(&["local-echo"]),
    ));
    manager.start(RegistrationSet::new()).await.unwrap();
    assert_eq!(manager.epoch(), 1);

    manager
        .handle_reload(set_of(&["generate-report", "send-email"]))
        .await;

    assert_eq!(manager.epoch(), 2);
    assert!(manager.is_running());
    assert_eq!(mock.registration_count(), 2);
    assert_eq!(
        mock.last_registered_task_kinds(),
        vec!["generate-report", "send-email"]
    );
    assert_eq!(
        manager.current_registration().task_kinds(),
        vec!["generate-report", "send-email"]
    );

    manager.stop(None).await;
}

#[tokio::test]
async fn empty_reload_restores_baseline() {
    let (server, mock) = start_mock().await;
    let client = OrchestratorClient::connect(&server).await.unwrap();

    let manager = Arc::new(WorkerLifecycleManager::new(
        client,
        fast_manager_config(),
        set_of(&["local-echo"]),
    ));
    manager.start(set_of(&["send-email"])).await.unwrap();
    assert_eq!(mock.last_registered_task_kinds(), vec!["send-email"]);

    // A reload that found nothing must fall back to the baseline set.
    manager.handle_reload(RegistrationSet::new()).await;

    assert_eq!(manager.epoch(), 2);
    assert_eq!(mock.last_registered_task_kinds(), vec!["local-echo"]);

    manager.stop(None).await;
}

#[tokio::test]
async fn stop_drains_and_reports_not_running() {
    let (server, _mock) = start_mock().await;
    let client = OrchestratorClient::connect(&server).await.unwrap();

    let manager =
        WorkerLifecycleManager::new(client, fast_manager_config(), set_of(&["local-echo"]));
    manager.start(RegistrationSet::new()).await.unwrap();
    assert!(manager.is_running());

    manager.stop(None).await;
    assert!(!manager.is_running());
    assert_eq!(manager.epoch(), 1);
}

/// Loader stub whose produced set can be switched between reloads.
struct SwitchingLoader {
    kinds: Mutex<Vec<&'static str>>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ArtifactLoad for SwitchingLoader {
    async fn load_generation(
        &self,
        _generation: u64,
        artifacts: Vec<Artifact>,
    ) -> Result<LoadOutcome, ReplugError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(LoadOutcome {
            container: None,
            set: set_of(&self.kinds.lock().unwrap().clone()),
            artifacts_loaded: artifacts,
            artifact_errors: 0,
            module_errors: 0,
        })
    }

    fn unload(&self, container: Arc<replug_core::CodeContainer>) {
        container.request_unload();
    }
}

#[tokio::test]
async fn trigger_to_swap_pipeline() {
    let (server, mock) = start_mock().await;
    let client = OrchestratorClient::connect(&server).await.unwrap();

    let loader = Arc::new(SwitchingLoader {
        kinds: Mutex::new(vec!["send-email"]),
        calls: AtomicUsize::new(0),
    });
    let registry = Arc::new(ArtifactRegistry::new());
    let coordinator = Arc::new(ReloadCoordinator::new(
        loader.clone(),
        registry,
        Duration::from_millis(10),
    ));

    let initial = coordinator.initial_load().await.unwrap();
    assert_eq!(initial.task_kinds(), vec!["send-email"]);

    let manager = Arc::new(WorkerLifecycleManager::new(
        client,
        fast_manager_config(),
        set_of(&["local-echo"]),
    ));
    manager.start(initial).await.unwrap();
    let _listener = manager.spawn_reload_listener(coordinator.subscribe());

    // New plugin content appears; the watcher would fire a rescan trigger.
    *loader.kinds.lock().unwrap() = vec!["generate-report", "send-email"];
    coordinator.on_trigger(Vec::new());

    assert!(
        wait_for(|| manager.epoch() == 2, Duration::from_secs(10)).await,
        "reload should restart the worker"
    );
    assert!(wait_for(|| manager.is_running(), Duration::from_secs(5)).await);
    assert_eq!(
        mock.last_registered_task_kinds(),
        vec!["generate-report", "send-email"]
    );
    assert_eq!(
        manager.current_registration().task_kinds(),
        vec!["generate-report", "send-email"]
    );

    manager.stop(None).await;
}
