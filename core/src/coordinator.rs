//! Hot-reload coordinator
//!
//! Converts watcher triggers into serialized reloads: at most one reload is
//! in flight, and triggers arriving during a reload collapse into a single
//! pending follow-up. Each completed reload publishes the complete current
//! registration set to subscribers as a replacement.

use crate::artifact::Artifact;
use crate::error::Result;
use crate::loader::ArtifactLoad;
use crate::registry::{ArtifactRegistry, RegistrationSet};
use crate::watcher::ReloadTrigger;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the reload-event channel. Reloads are serialized, so depth
/// beyond a handful means the subscriber has stalled.
const RELOAD_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Reloading,
}

struct CoordinatorState {
    phase: Phase,
    pending: bool,
    pending_artifacts: Vec<Artifact>,
    stopped: bool,
}

/// Serializes reloads and publishes registration-set replacements.
pub struct ReloadCoordinator {
    loader: Arc<dyn ArtifactLoad>,
    registry: Arc<ArtifactRegistry>,
    quiesce_delay: Duration,
    state: Mutex<CoordinatorState>,
    reloaded_tx: broadcast::Sender<RegistrationSet>,
}

impl ReloadCoordinator {
    /// Create an idle coordinator.
    pub fn new(
        loader: Arc<dyn ArtifactLoad>,
        registry: Arc<ArtifactRegistry>,
        quiesce_delay: Duration,
    ) -> Self {
        let (reloaded_tx, _) = broadcast::channel(RELOAD_EVENT_CAPACITY);
        Self {
            loader,
            registry,
            quiesce_delay,
            state: Mutex::new(CoordinatorState {
                phase: Phase::Idle,
                pending: false,
                pending_artifacts: Vec::new(),
                stopped: false,
            }),
            reloaded_tx,
        }
    }

    /// Subscribe to registration-set replacements. Each received value is the
    /// complete current set, never a diff. Only reloads completing after the
    /// subscription are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationSet> {
        self.reloaded_tx.subscribe()
    }

    /// The last published registration set.
    pub fn current_registration(&self) -> RegistrationSet {
        self.registry.current_set()
    }

    /// Synchronous startup load: scan everything once and publish the result
    /// before any worker starts.
    pub async fn initial_load(&self) -> Result<RegistrationSet> {
        self.reload_once(Vec::new()).await?;
        Ok(self.registry.current_set())
    }

    /// Consume watcher triggers until the channel closes or the coordinator
    /// stops.
    pub fn start(self: &Arc<Self>, mut triggers: mpsc::Receiver<ReloadTrigger>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(trigger) = triggers.recv().await {
                if coordinator.state.lock().stopped {
                    break;
                }
                coordinator.on_trigger(trigger.artifacts);
            }
            debug!("trigger dispatcher stopped");
        })
    }

    /// Feed one trigger into the state machine.
    pub fn on_trigger(self: &Arc<Self>, artifacts: Vec<Artifact>) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        match state.phase {
            Phase::Idle => {
                state.phase = Phase::Reloading;
                drop(state);
                let coordinator = self.clone();
                tokio::spawn(async move {
                    coordinator.run_reload(artifacts).await;
                });
            }
            Phase::Reloading => {
                state.pending = true;
                state.pending_artifacts.extend(artifacts);
                debug!("reload in progress, trigger queued as pending");
            }
        }
    }

    /// Terminal stop: cancel pending work and emit no further events.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.pending = false;
        state.pending_artifacts.clear();
        info!("reload coordinator stopped");
    }

    async fn run_reload(self: Arc<Self>, mut artifacts: Vec<Artifact>) {
        loop {
            // Let downloaders and installers finish writing before loading.
            tokio::time::sleep(self.quiesce_delay).await;

            if let Err(error) = self.reload_once(std::mem::take(&mut artifacts)).await {
                warn!(%error, "reload failed, keeping current registration");
            }

            let follow_up = {
                let mut state = self.state.lock();
                if state.stopped {
                    state.phase = Phase::Idle;
                    None
                } else if state.pending {
                    state.pending = false;
                    Some(std::mem::take(&mut state.pending_artifacts))
                } else {
                    state.phase = Phase::Idle;
                    None
                }
            };

            match follow_up {
                Some(next) => artifacts = next,
                None => break,
            }
        }
    }

    /// One load pass: stage, load, publish, unload superseded containers.
    async fn reload_once(&self, artifacts: Vec<Artifact>) -> Result<()> {
        let explicit = !artifacts.is_empty();

        // Artifacts already processed at this exact version never reload.
        let fresh: Vec<Artifact> = artifacts
            .into_iter()
            .filter(|artifact| !self.registry.is_current(artifact))
            .collect();
        if explicit && fresh.is_empty() {
            debug!("triggered artifacts already current, skipping reload");
            return Ok(());
        }

        // Rebuild from everything known plus the new arrivals, one artifact
        // per package name with the new arrival winning.
        let mut by_name: HashMap<String, Artifact> = self
            .registry
            .known_artifacts()
            .into_iter()
            .map(|artifact| (artifact.name.clone(), artifact))
            .collect();
        let fresh_names: HashSet<String> =
            fresh.iter().map(|artifact| artifact.name.clone()).collect();
        for artifact in fresh {
            by_name.insert(artifact.name.clone(), artifact);
        }
        let candidates: Vec<Artifact> = by_name.into_values().collect();

        let generation = self.registry.next_generation();
        let outcome = self.loader.load_generation(generation, candidates).await?;

        if explicit
            && !outcome
                .artifacts_loaded
                .iter()
                .any(|artifact| fresh_names.contains(&artifact.name))
        {
            warn!("none of the triggered artifacts could be loaded, keeping current registration");
            return Ok(());
        }
        if outcome.set.is_empty() && (outcome.artifact_errors > 0 || outcome.module_errors > 0) {
            warn!(
                artifact_errors = outcome.artifact_errors,
                module_errors = outcome.module_errors,
                "reload produced no registrations, keeping current registration"
            );
            return Ok(());
        }

        let set = outcome.set.clone();
        let superseded =
            self.registry
                .publish(outcome.container, &outcome.artifacts_loaded, outcome.set);
        for container in superseded {
            self.loader.unload(container);
        }

        info!(
            generation,
            tasks = set.task_count(),
            workflows = set.workflow_count(),
            "registration set published"
        );

        if !self.state.lock().stopped {
            let _ = self.reloaded_tx.send(set);
        }
        Ok(())
    }
}
