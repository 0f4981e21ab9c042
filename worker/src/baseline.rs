//! Baseline tasks and workflows compiled into the worker binary.
//!
//! When a (re)start finds nothing to register, the lifecycle manager
//! substitutes this set so the worker never polls with nothing to do. The
//! next successful non-empty reload replaces it.

use replug_core::plugin::{InvocationError, PluginTask, PluginWorkflow};
use replug_core::registry::{RegistrationSet, TaskHandle, WorkflowTypeHandle};
use std::time::{SystemTime, UNIX_EPOCH};

/// Echoes its input payload back.
struct EchoTask;

impl PluginTask for EchoTask {
    fn kind(&self) -> &str {
        "local-echo"
    }

    fn call(&self, input: &[u8]) -> Result<Vec<u8>, InvocationError> {
        Ok(input.to_vec())
    }
}

/// Reports the worker's wall-clock time and binary version.
struct StatusTask;

impl PluginTask for StatusTask {
    fn kind(&self) -> &str {
        "local-status"
    }

    fn call(&self, _input: &[u8]) -> Result<Vec<u8>, InvocationError> {
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| InvocationError::retryable(e.to_string()))?
            .as_secs();
        let body = serde_json::json!({
            "status": "ok",
            "unix_time": unix_time,
            "version": env!("CARGO_PKG_VERSION"),
        });
        serde_json::to_vec(&body).map_err(|e| InvocationError::fatal(e.to_string()))
    }
}

/// Passes its input through unchanged; a placeholder orchestration.
struct PassthroughWorkflow;

impl PluginWorkflow for PassthroughWorkflow {
    fn kind(&self) -> &str {
        "local-passthrough"
    }

    fn execute(&self, input: &[u8]) -> Result<Vec<u8>, InvocationError> {
        Ok(input.to_vec())
    }
}

/// The built-in registration set.
pub fn baseline_registration() -> RegistrationSet {
    let mut set = RegistrationSet::new();
    set.insert_task(TaskHandle::baseline(Box::new(EchoTask)));
    set.insert_task(TaskHandle::baseline(Box::new(StatusTask)));
    set.insert_workflow(WorkflowTypeHandle::baseline(Box::new(PassthroughWorkflow)));
    set
}
