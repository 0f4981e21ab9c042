//! Worker run loop
//!
//! Polls the task queue and executes work items against one immutable
//! registration snapshot. Cancellation is observed between polls only: an
//! item that started executing always runs to completion, which is what lets
//! a superseded container stay mapped until its in-flight work is done. The
//! snapshot's handles hold the container alive for exactly that long.

use crate::client::{OrchestratorClient, WorkItem, WorkItemKind};
use crate::plugin::InvocationError;
use crate::registry::RegistrationSet;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Settings for one worker's run loop.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Queue polled for work.
    pub queue: String,
    /// Long-poll timeout handed to the server.
    pub poll_timeout: Duration,
    /// Pause before re-polling after an empty poll.
    pub no_work_backoff: Duration,
    /// Interval between liveness heartbeats.
    pub heartbeat_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            poll_timeout: Duration::from_secs(60),
            no_work_backoff: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Handle to a running worker: cancellation plus completion observation.
pub struct WorkerHandle {
    worker_id: String,
    epoch: u64,
    cancel_tx: watch::Sender<bool>,
    done: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Identifier this worker registered under.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Epoch this worker belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Ask the worker to stop polling. In-flight work completes.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// True once the run loop has exited.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("epoch", &self.epoch)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Spawn the run loop and heartbeat task for one worker generation.
pub(crate) fn spawn_worker(
    client: OrchestratorClient,
    config: RunConfig,
    set: RegistrationSet,
    worker_id: String,
    epoch: u64,
) -> WorkerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let done = Arc::new(AtomicBool::new(false));

    tokio::spawn(heartbeat_loop(
        client.clone(),
        worker_id.clone(),
        config.heartbeat_interval,
        cancel_rx.clone(),
    ));
    tokio::spawn(run_loop(
        client,
        config,
        set,
        worker_id.clone(),
        epoch,
        cancel_rx,
        done.clone(),
    ));

    WorkerHandle {
        worker_id,
        epoch,
        cancel_tx,
        done,
    }
}

async fn heartbeat_loop(
    client: OrchestratorClient,
    worker_id: String,
    interval: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if *cancel_rx.borrow() {
            break;
        }
        if let Err(error) = client.heartbeat(&worker_id).await {
            warn!(worker_id = %worker_id, %error, "heartbeat failed");
        }
    }
    debug!(worker_id = %worker_id, "heartbeat loop stopped");
}

async fn run_loop(
    client: OrchestratorClient,
    config: RunConfig,
    set: RegistrationSet,
    worker_id: String,
    epoch: u64,
    mut cancel_rx: watch::Receiver<bool>,
    done: Arc<AtomicBool>,
) {
    info!(
        worker_id = %worker_id,
        epoch,
        queue = %config.queue,
        tasks = set.task_count(),
        workflows = set.workflow_count(),
        "worker polling started"
    );

    loop {
        if *cancel_rx.borrow() {
            break;
        }

        let polled = tokio::select! {
            _ = cancel_rx.changed() => break,
            polled = client.poll(&config.queue, &worker_id, config.poll_timeout) => polled,
        };

        match polled {
            Ok(Some(item)) => {
                // Deliberately not cancellable: the item finishes on the
                // worker generation that accepted it.
                execute_item(&client, &set, item, epoch).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = tokio::time::sleep(config.no_work_backoff) => {}
                }
            }
            Err(error) => {
                warn!(worker_id = %worker_id, %error, "poll failed");
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }

    done.store(true, Ordering::SeqCst);
    info!(worker_id = %worker_id, epoch, "worker stopped");
}

async fn execute_item(
    client: &OrchestratorClient,
    set: &RegistrationSet,
    item: WorkItem,
    epoch: u64,
) {
    let started = Instant::now();
    debug!(
        execution_id = %item.id,
        kind = %item.kind,
        work_type = ?item.work_type,
        attempt = item.attempt,
        epoch,
        "executing work item"
    );

    let input = serde_json::to_vec(&item.input).unwrap_or_default();

    let outcome = match item.work_type {
        WorkItemKind::Task => match set.task(&item.kind) {
            Some(handle) => {
                let handle = handle.clone();
                tokio::task::spawn_blocking(move || handle.call(&input))
                    .await
                    .unwrap_or_else(|e| Err(InvocationError::fatal(format!("task panicked: {e}"))))
            }
            None => Err(InvocationError::fatal(format!(
                "task kind '{}' is not registered",
                item.kind
            ))),
        },
        WorkItemKind::Workflow => match set.workflow(&item.kind) {
            Some(handle) => {
                let handle = handle.clone();
                tokio::task::spawn_blocking(move || handle.execute(&input))
                    .await
                    .unwrap_or_else(|e| {
                        Err(InvocationError::fatal(format!("workflow panicked: {e}")))
                    })
            }
            None => Err(InvocationError::fatal(format!(
                "workflow kind '{}' is not registered",
                item.kind
            ))),
        },
    };

    let duration_ms = started.elapsed().as_millis();
    match outcome {
        Ok(bytes) => {
            let output: Value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            debug!(execution_id = %item.id, duration_ms, "work item completed");
            if let Err(error) = client.complete(item.id, &output).await {
                warn!(execution_id = %item.id, %error, "failed to report completion");
            }
        }
        Err(invocation_error) => {
            warn!(
                execution_id = %item.id,
                error = %invocation_error,
                duration_ms,
                "work item failed"
            );
            if let Err(error) = client
                .fail(item.id, &invocation_error.message, invocation_error.retryable)
                .await
            {
                warn!(execution_id = %item.id, %error, "failed to report failure");
            }
        }
    }
}
