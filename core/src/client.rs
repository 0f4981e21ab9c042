//! Orchestration service client
//!
//! A thin HTTP+JSON client for the orchestration service: worker
//! registration, long-polling the task queue, reporting results and
//! heartbeats. Connection establishment retries with exponential backoff;
//! exhausting the attempts is fatal to process startup.

use crate::error::{ReplugError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Worker registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub worker_name: Option<String>,
    pub queue: String,
    pub task_kinds: Vec<String>,
    pub workflow_kinds: Vec<String>,
}

/// Whether a polled item routes to a task or a workflow handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemKind {
    #[default]
    Task,
    Workflow,
}

/// One unit of work handed out by the orchestration service.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub kind: String,
    #[serde(default)]
    pub work_type: WorkItemKind,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub attempt: u32,
}

/// Connection-establishment policy.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Maximum connection attempts.
    pub attempts: u32,
    /// Backoff before the second attempt; doubles per attempt.
    pub initial_backoff: Duration,
    /// Deadline for each individual attempt.
    pub attempt_deadline: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_secs(2),
            attempt_deadline: Duration::from_secs(30),
        }
    }
}

/// HTTP client for the orchestration service.
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: String,
}

impl OrchestratorClient {
    /// Create a client for `server` (`host:port` or a full URL). No network
    /// traffic happens here.
    pub fn new(server: &str) -> Result<Self> {
        let base_url = if server.starts_with("http://") || server.starts_with("https://") {
            server.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server.trim_end_matches('/'))
        };

        // No global timeout: the poll request long-polls and carries its own
        // per-request deadline.
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base_url })
    }

    /// Create a client and verify the service is reachable, retrying with
    /// exponential backoff per `options`.
    pub async fn connect_with(server: &str, options: ConnectOptions) -> Result<Self> {
        let client = Self::new(server)?;
        let mut backoff = options.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=options.attempts.max(1) {
            match tokio::time::timeout(options.attempt_deadline, client.ping()).await {
                Ok(Ok(())) => {
                    info!(server = %client.base_url, attempt, "connected to orchestration service");
                    return Ok(client);
                }
                Ok(Err(error)) => {
                    last_error = error.to_string();
                    warn!(attempt, %error, "orchestration service not reachable");
                }
                Err(_) => {
                    last_error = "connection attempt timed out".to_string();
                    warn!(attempt, "orchestration service connection attempt timed out");
                }
            }
            if attempt < options.attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(ReplugError::ServiceUnavailable(format!(
            "{} after {} attempts: {last_error}",
            client.base_url, options.attempts
        )))
    }

    /// Create a client and verify reachability with the default policy.
    pub async fn connect(server: &str) -> Result<Self> {
        Self::connect_with(server, ConnectOptions::default()).await
    }

    /// Service base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        self.http.get(&url).send().await?.error_for_status()?;
        Ok(())
    }

    /// Register a worker and the kinds it serves.
    pub async fn register_worker(&self, registration: &WorkerRegistration) -> Result<()> {
        let url = format!("{}/api/v1/workers", self.base_url);
        debug!(
            worker_id = %registration.worker_id,
            queue = %registration.queue,
            tasks = registration.task_kinds.len(),
            workflows = registration.workflow_kinds.len(),
            "registering worker"
        );
        self.http
            .post(&url)
            .json(registration)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Long-poll the queue for one work item. Returns `None` when the server
    /// had nothing within the timeout.
    pub async fn poll(
        &self,
        queue: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<WorkItem>> {
        let url = format!(
            "{}/api/v1/queues/{}/poll?worker_id={}&timeout_ms={}",
            self.base_url,
            queue,
            worker_id,
            timeout.as_millis()
        );
        let response = self
            .http
            .get(&url)
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let item: WorkItem = response.error_for_status()?.json().await?;
        Ok(Some(item))
    }

    /// Report successful completion of a work item.
    pub async fn complete(&self, execution_id: Uuid, output: &Value) -> Result<()> {
        let url = format!("{}/api/v1/executions/{execution_id}/complete", self.base_url);
        self.http
            .post(&url)
            .json(&serde_json::json!({ "output": output }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Report failure of a work item.
    pub async fn fail(&self, execution_id: Uuid, error: &str, retryable: bool) -> Result<()> {
        let url = format!("{}/api/v1/executions/{execution_id}/fail", self.base_url);
        self.http
            .post(&url)
            .json(&serde_json::json!({ "error": error, "retryable": retryable }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Send a worker liveness heartbeat.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let url = format!("{}/api/v1/workers/{worker_id}/heartbeat", self.base_url);
        self.http.post(&url).send().await?.error_for_status()?;
        Ok(())
    }
}
