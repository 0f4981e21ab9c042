//! Registration sets and the process-wide artifact registry

use crate::artifact::{Artifact, ArtifactId};
use crate::container::CodeContainer;
use crate::plugin::{InvocationError, PluginTask, PluginWorkflow};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

/// A callable task extracted from a loaded module.
///
/// The handle keeps its owning container alive, so plugin code stays mapped
/// for as long as any worker snapshot references it. Baseline tasks compiled
/// into the host have no container.
#[derive(Clone)]
pub struct TaskHandle {
    kind: String,
    task: Arc<dyn PluginTask>,
    container: Option<Arc<CodeContainer>>,
}

impl TaskHandle {
    /// Wrap a plugin-provided task bound to its container.
    pub fn new(task: Box<dyn PluginTask>, container: Arc<CodeContainer>) -> Self {
        Self {
            kind: task.kind().to_string(),
            task: Arc::from(task),
            container: Some(container),
        }
    }

    /// Wrap a task compiled into the host binary.
    pub fn baseline(task: Box<dyn PluginTask>) -> Self {
        Self {
            kind: task.kind().to_string(),
            task: Arc::from(task),
            container: None,
        }
    }

    /// Task kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Owning container, if plugin-provided.
    pub fn container(&self) -> Option<&Arc<CodeContainer>> {
        self.container.as_ref()
    }

    /// Invoke the task with a JSON payload.
    pub fn call(&self, input: &[u8]) -> std::result::Result<Vec<u8>, InvocationError> {
        self.task.call(input)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("kind", &self.kind)
            .field("generation", &self.container.as_ref().map(|c| c.generation()))
            .finish()
    }
}

/// A workflow type extracted from a loaded module. Same lifetime rules as
/// [`TaskHandle`].
#[derive(Clone)]
pub struct WorkflowTypeHandle {
    kind: String,
    workflow: Arc<dyn PluginWorkflow>,
    container: Option<Arc<CodeContainer>>,
}

impl WorkflowTypeHandle {
    /// Wrap a plugin-provided workflow bound to its container.
    pub fn new(workflow: Box<dyn PluginWorkflow>, container: Arc<CodeContainer>) -> Self {
        Self {
            kind: workflow.kind().to_string(),
            workflow: Arc::from(workflow),
            container: Some(container),
        }
    }

    /// Wrap a workflow compiled into the host binary.
    pub fn baseline(workflow: Box<dyn PluginWorkflow>) -> Self {
        Self {
            kind: workflow.kind().to_string(),
            workflow: Arc::from(workflow),
            container: None,
        }
    }

    /// Workflow kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Owning container, if plugin-provided.
    pub fn container(&self) -> Option<&Arc<CodeContainer>> {
        self.container.as_ref()
    }

    /// Run the workflow body with a JSON payload.
    pub fn execute(&self, input: &[u8]) -> std::result::Result<Vec<u8>, InvocationError> {
        self.workflow.execute(input)
    }
}

impl std::fmt::Debug for WorkflowTypeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowTypeHandle")
            .field("kind", &self.kind)
            .field("generation", &self.container.as_ref().map(|c| c.generation()))
            .finish()
    }
}

/// The tasks and workflows one reload contributes, keyed by declared kind.
///
/// Within a set the last definition of a kind wins; displacements are logged.
#[derive(Clone, Default)]
pub struct RegistrationSet {
    tasks: HashMap<String, TaskHandle>,
    workflows: HashMap<String, WorkflowTypeHandle>,
}

impl RegistrationSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the set holds no tasks and no workflows.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.workflows.is_empty()
    }

    /// Number of tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of workflows.
    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    /// Insert a task, displacing any earlier definition of the same kind.
    pub fn insert_task(&mut self, handle: TaskHandle) {
        if let Some(previous) = self.tasks.insert(handle.kind().to_string(), handle) {
            warn!(
                kind = %previous.kind(),
                "duplicate task definition, last loaded wins"
            );
        }
    }

    /// Insert a workflow, displacing any earlier definition of the same kind.
    pub fn insert_workflow(&mut self, handle: WorkflowTypeHandle) {
        if let Some(previous) = self.workflows.insert(handle.kind().to_string(), handle) {
            warn!(
                kind = %previous.kind(),
                "duplicate workflow definition, last loaded wins"
            );
        }
    }

    /// Merge another set into this one; the other set's definitions win.
    pub fn merge(&mut self, other: RegistrationSet) {
        for (_, handle) in other.tasks {
            self.insert_task(handle);
        }
        for (_, handle) in other.workflows {
            self.insert_workflow(handle);
        }
    }

    /// Look up a task by kind.
    pub fn task(&self, kind: &str) -> Option<&TaskHandle> {
        self.tasks.get(kind)
    }

    /// Look up a workflow by kind.
    pub fn workflow(&self, kind: &str) -> Option<&WorkflowTypeHandle> {
        self.workflows.get(kind)
    }

    /// Sorted task kinds.
    pub fn task_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.tasks.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Sorted workflow kinds.
    pub fn workflow_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.workflows.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for RegistrationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationSet")
            .field("tasks", &self.task_kinds())
            .field("workflows", &self.workflow_kinds())
            .finish()
    }
}

/// What the registry remembers about a processed artifact.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub artifact: Artifact,
    pub generation: u64,
    pub processed_at: SystemTime,
}

struct RegistryInner {
    records: HashMap<String, ArtifactRecord>,
    containers: Vec<Arc<CodeContainer>>,
    current: RegistrationSet,
    next_generation: u64,
}

/// Process-wide record of processed artifacts, live containers and the
/// currently published registration set.
///
/// A single mutex guards all of it; reads clone small values out. Suppresses
/// re-processing of already-seen artifact versions and hands superseded
/// containers back to the loader for unload.
pub struct ArtifactRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for ArtifactRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                containers: Vec::new(),
                current: RegistrationSet::new(),
                next_generation: 0,
            }),
        }
    }

    /// Allocate the next container generation.
    pub fn next_generation(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        inner.next_generation
    }

    /// True when this exact artifact version has already been processed.
    pub fn is_current(&self, artifact: &Artifact) -> bool {
        let inner = self.inner.lock();
        inner
            .records
            .get(&artifact.name)
            .map(|record| record.artifact.id() == artifact.id())
            .unwrap_or(false)
    }

    /// Every artifact the registry knows, one per package name.
    pub fn known_artifacts(&self) -> Vec<Artifact> {
        let inner = self.inner.lock();
        inner
            .records
            .values()
            .map(|record| record.artifact.clone())
            .collect()
    }

    /// Identity records for inspection.
    pub fn record(&self, id: &ArtifactId) -> Option<ArtifactRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .get(&id.name)
            .filter(|record| record.artifact.id() == *id)
            .cloned()
    }

    /// Publish a reload outcome: remember the artifacts, install the new
    /// container and registration set, and return the superseded containers,
    /// already marked unloading.
    pub fn publish(
        &self,
        container: Option<Arc<CodeContainer>>,
        artifacts: &[Artifact],
        set: RegistrationSet,
    ) -> Vec<Arc<CodeContainer>> {
        let generation = container.as_ref().map(|c| c.generation()).unwrap_or(0);
        let mut inner = self.inner.lock();

        for artifact in artifacts {
            inner.records.insert(
                artifact.name.clone(),
                ArtifactRecord {
                    artifact: artifact.clone(),
                    generation,
                    processed_at: SystemTime::now(),
                },
            );
        }

        let superseded = std::mem::take(&mut inner.containers);
        for old in &superseded {
            old.request_unload();
        }

        if let Some(container) = container {
            inner.containers.push(container);
        }
        inner.current = set;

        superseded
    }

    /// The currently published registration set.
    pub fn current_set(&self) -> RegistrationSet {
        self.inner.lock().current.clone()
    }

    /// Number of live containers (normally zero or one).
    pub fn live_container_count(&self) -> usize {
        self.inner.lock().containers.len()
    }
}
