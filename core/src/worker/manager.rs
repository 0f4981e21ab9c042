//! Worker lifecycle manager
//!
//! Owns the current worker and replaces it atomically when the coordinator
//! publishes a new registration set: capture-and-clear under the mutex,
//! cancel outside it, drain-poll until the run loop exits or the cap
//! elapses, dispose, settle, then start the successor. Epoch checks keep a
//! slow reload from clobbering a faster one.

use super::run::{spawn_worker, RunConfig, WorkerHandle};
use crate::client::{OrchestratorClient, WorkerRegistration};
use crate::config::Config;
use crate::error::Result;
use crate::registry::RegistrationSet;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Queue the worker polls.
    pub queue: String,
    /// Human-readable worker name.
    pub worker_name: Option<String>,
    /// Long-poll timeout.
    pub poll_timeout: Duration,
    /// Pause after an empty poll.
    pub no_work_backoff: Duration,
    /// Liveness heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Soft cap on draining a superseded worker.
    pub drain_timeout: Duration,
    /// Interval between drain checks.
    pub drain_poll_interval: Duration,
    /// Pause between dispose and restart.
    pub settle_delay: Duration,
    /// Hard cap on process shutdown drain.
    pub shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            worker_name: None,
            poll_timeout: Duration::from_secs(60),
            no_work_backoff: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            drain_poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

impl ManagerConfig {
    /// Derive manager settings from the process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.task_queue.clone(),
            worker_name: config.worker_name.clone(),
            ..Self::default()
        }
    }
}

/// Lifecycle notifications for observers (health endpoint, logs, tests).
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker generation started polling.
    Started {
        epoch: u64,
        tasks: usize,
        workflows: usize,
    },
    /// The final worker generation stopped.
    Stopped { epoch: u64 },
}

struct ManagerInner {
    current: Option<Arc<WorkerHandle>>,
    epoch: u64,
    stopped: bool,
}

/// Owns the current worker and swaps it on reload events.
pub struct WorkerLifecycleManager {
    client: OrchestratorClient,
    config: ManagerConfig,
    baseline: RegistrationSet,
    worker_base_id: String,
    inner: Mutex<ManagerInner>,
    current_set: RwLock<RegistrationSet>,
    events_tx: broadcast::Sender<WorkerEvent>,
}

impl WorkerLifecycleManager {
    /// Create a manager with the baseline set used when a reload produces
    /// nothing to register.
    pub fn new(client: OrchestratorClient, config: ManagerConfig, baseline: RegistrationSet) -> Self {
        let base = config
            .worker_name
            .clone()
            .unwrap_or_else(|| "replug-worker".to_string());
        let worker_base_id = format!("{base}-{}", Uuid::new_v4().simple());
        let (events_tx, _) = broadcast::channel(32);

        Self {
            client,
            config,
            baseline,
            worker_base_id,
            inner: Mutex::new(ManagerInner {
                current: None,
                epoch: 0,
                stopped: false,
            }),
            current_set: RwLock::new(RegistrationSet::new()),
            events_tx,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events_tx.subscribe()
    }

    /// Current worker epoch. Zero before the first start.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// True while a worker generation is polling.
    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .current
            .as_ref()
            .map(|worker| !worker.is_done())
            .unwrap_or(false)
    }

    /// The registration set the current worker serves. Swapped whole on
    /// reload, so callers never observe a mix of generations.
    pub fn current_registration(&self) -> RegistrationSet {
        self.current_set.read().clone()
    }

    /// Start the initial worker with the given registration set.
    pub async fn start(&self, initial: RegistrationSet) -> Result<()> {
        self.start_worker(initial).await.map(|_| ())
    }

    /// React to registration replacements until the coordinator's channel
    /// closes.
    pub fn spawn_reload_listener(
        self: &Arc<Self>,
        mut reloaded_rx: broadcast::Receiver<RegistrationSet>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match reloaded_rx.recv().await {
                    Ok(set) => manager.handle_reload(set).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "reload events lagged, catching up");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("reload listener stopped");
        })
    }

    /// Replace the current worker with one serving `set`.
    pub async fn handle_reload(&self, set: RegistrationSet) {
        info!(
            tasks = set.task_count(),
            workflows = set.workflow_count(),
            "registration replacement received, swapping worker"
        );

        // Clear the reference first so concurrent observers see "no worker"
        // rather than a worker about to die.
        let (old, old_epoch) = {
            let mut inner = self.inner.lock();
            (inner.current.take(), inner.epoch)
        };

        if let Some(old) = old {
            self.drain(&old, self.config.drain_timeout).await;
            drop(old);
        }
        tokio::time::sleep(self.config.settle_delay).await;

        {
            let inner = self.inner.lock();
            if inner.epoch != old_epoch {
                debug!("a newer worker already started, abandoning restart");
                return;
            }
        }

        if let Err(err) = self.start_worker(set).await {
            error!(error = %err, "failed to start replacement worker");
        }
    }

    /// Drain the current worker and release resources. The cap is the
    /// caller's deadline or the internal shutdown cap, whichever is shorter.
    pub async fn stop(&self, deadline: Option<Duration>) {
        let cap = deadline
            .map(|d| d.min(self.config.shutdown_timeout))
            .unwrap_or(self.config.shutdown_timeout);

        let old = {
            let mut inner = self.inner.lock();
            inner.stopped = true;
            inner.current.take()
        };
        if let Some(old) = old {
            let epoch = old.epoch();
            self.drain(&old, cap).await;
            if !old.is_done() {
                warn!(epoch, "shutdown cap elapsed, force-disposing worker");
            }
            drop(old);
            let _ = self.events_tx.send(WorkerEvent::Stopped { epoch });
            info!(epoch, "worker lifecycle stopped");
        }
    }

    async fn start_worker(&self, set: RegistrationSet) -> Result<u64> {
        let effective = if set.is_empty() {
            info!("registration set is empty, substituting baseline set");
            self.baseline.clone()
        } else {
            set
        };

        let epoch = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                debug!("manager stopped, not starting a worker");
                return Ok(inner.epoch);
            }
            inner.epoch += 1;
            inner.epoch
        };
        let worker_id = format!("{}-{epoch}", self.worker_base_id);

        let registration = WorkerRegistration {
            worker_id: worker_id.clone(),
            worker_name: self.config.worker_name.clone(),
            queue: self.config.queue.clone(),
            task_kinds: effective.task_kinds(),
            workflow_kinds: effective.workflow_kinds(),
        };
        self.client.register_worker(&registration).await?;

        let run_config = RunConfig {
            queue: self.config.queue.clone(),
            poll_timeout: self.config.poll_timeout,
            no_work_backoff: self.config.no_work_backoff,
            heartbeat_interval: self.config.heartbeat_interval,
        };
        let handle = Arc::new(spawn_worker(
            self.client.clone(),
            run_config,
            effective.clone(),
            worker_id,
            epoch,
        ));

        {
            let mut inner = self.inner.lock();
            if inner.stopped || inner.epoch != epoch {
                // Superseded while registering, either by a faster reload or
                // by shutdown; this worker must not clobber the winner.
                drop(inner);
                warn!(epoch, "discarding worker superseded during startup");
                handle.cancel();
                return Ok(epoch);
            }
            inner.current = Some(handle.clone());
        }
        *self.current_set.write() = effective.clone();

        let _ = self.events_tx.send(WorkerEvent::Started {
            epoch,
            tasks: effective.task_count(),
            workflows: effective.workflow_count(),
        });
        info!(
            epoch,
            queue = %self.config.queue,
            tasks = effective.task_count(),
            workflows = effective.workflow_count(),
            "worker started"
        );
        Ok(epoch)
    }

    async fn drain(&self, handle: &Arc<WorkerHandle>, cap: Duration) {
        handle.cancel();
        let deadline = Instant::now() + cap;
        while !handle.is_done() && Instant::now() < deadline {
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }
        if handle.is_done() {
            debug!(epoch = handle.epoch(), "worker drained");
        } else {
            warn!(epoch = handle.epoch(), "drain timed out, disposing worker anyway");
        }
    }
}
