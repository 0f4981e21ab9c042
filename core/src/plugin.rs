//! Plugin ABI
//!
//! Plugins are `cdylib` crates that export a single well-known static, the
//! [`PluginDeclaration`], via [`export_plugin!`]. The declaration carries the
//! compiler and core versions it was built against and a registration entry
//! point that enumerates the plugin's tasks and workflows. The loader refuses
//! declarations built by a different toolchain or core version.
//!
//! Callables use one uniform shape: JSON bytes in, JSON bytes out. All typed
//! de/serialization happens on the host side.

use std::fmt;

/// Compiler version the core was built with.
pub static RUSTC_VERSION: &str = env!("REPLUG_RUSTC_VERSION");

/// Core crate version.
pub static CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error returned by a plugin callable.
#[derive(Debug, Clone)]
pub struct InvocationError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the orchestration service may retry the work item.
    pub retryable: bool,
}

impl InvocationError {
    /// A failure the service may retry.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for InvocationError {}

/// A side-effectful function a plugin contributes.
///
/// Input and output are JSON-encoded payloads.
pub trait PluginTask: Send + Sync {
    /// Unique task kind, used for queue routing and dispatch.
    fn kind(&self) -> &str;

    /// Execute the task.
    fn call(&self, input: &[u8]) -> std::result::Result<Vec<u8>, InvocationError>;
}

/// A deterministic orchestration procedure a plugin contributes.
pub trait PluginWorkflow: Send + Sync {
    /// Unique workflow kind.
    fn kind(&self) -> &str;

    /// Execute the workflow body.
    fn execute(&self, input: &[u8]) -> std::result::Result<Vec<u8>, InvocationError>;
}

/// Collector handed to a plugin's registration entry point.
pub trait PluginRegistrar {
    /// Contribute a task.
    fn register_task(&mut self, task: Box<dyn PluginTask>);

    /// Contribute a workflow.
    fn register_workflow(&mut self, workflow: Box<dyn PluginWorkflow>);
}

/// The well-known exported static every plugin provides.
#[repr(C)]
pub struct PluginDeclaration {
    /// Compiler version the plugin was built with.
    pub rustc_version: &'static str,
    /// replug-core version the plugin was built against.
    pub core_version: &'static str,
    /// Registration entry point.
    pub register: unsafe extern "C" fn(&mut dyn PluginRegistrar),
}

/// Symbol name of the exported [`PluginDeclaration`].
pub const DECLARATION_SYMBOL: &[u8] = b"plugin_declaration\0";

/// Export a plugin's registration entry point.
///
/// ```ignore
/// use replug_core::plugin::{PluginRegistrar, PluginTask};
///
/// extern "C" fn register(registrar: &mut dyn PluginRegistrar) {
///     registrar.register_task(Box::new(SendEmail));
/// }
///
/// replug_core::export_plugin!(register);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($register:expr) => {
        #[doc(hidden)]
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static plugin_declaration: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                rustc_version: $crate::plugin::RUSTC_VERSION,
                core_version: $crate::plugin::CORE_VERSION,
                register: $register,
            };
    };
}
