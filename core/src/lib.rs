//! # replug core
//!
//! A long-running worker that polls an orchestration service for work on a
//! named task queue and hot-swaps dynamically discovered plugin code without
//! dropping in-flight work.
//!
//! ## Architecture
//!
//! Four subsystems cooperate, leaves first:
//!
//! - [`watcher`] - plugin source watchers: a debounced filesystem watcher
//!   and a remote package-feed poller with a circuit breaker
//! - [`loader`] - materializes artifacts into isolated, unloadable
//!   [`container::CodeContainer`]s and extracts their registrations
//! - [`coordinator`] - serializes reloads and publishes complete
//!   registration-set replacements
//! - [`worker`] - runs the orchestration worker and swaps it atomically on
//!   reload events, draining the previous generation to completion
//!
//! Plugins are `cdylib` crates exporting a registration entry point via
//! [`export_plugin!`]; see the [`plugin`] module for the ABI.
//!
//! ## Modules
//!
//! - [`artifact`] - versioned package artifacts and their identity
//! - [`client`] - HTTP client for the orchestration service
//! - [`config`] - environment-derived process configuration
//! - [`container`] - isolation units for loaded plugin code
//! - [`registry`] - registration sets and the process-wide artifact registry
//! - [`version`] - package version parsing and ordering

pub mod artifact;
pub mod client;
pub mod config;
pub mod container;
pub mod coordinator;
pub mod error;
pub mod loader;
pub mod plugin;
pub mod registry;
pub mod version;
pub mod watcher;
pub mod worker;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactId};
pub use client::{ConnectOptions, OrchestratorClient, WorkItem, WorkItemKind, WorkerRegistration};
pub use config::{Config, FeedConfig, HotReloadMode};
pub use container::{CodeContainer, ContainerState};
pub use coordinator::ReloadCoordinator;
pub use error::{ReplugError, Result};
pub use loader::{ArtifactLoad, ArtifactLoader, LoadOutcome, LoaderConfig};
pub use plugin::{
    InvocationError, PluginDeclaration, PluginRegistrar, PluginTask, PluginWorkflow,
};
pub use registry::{ArtifactRegistry, RegistrationSet, TaskHandle, WorkflowTypeHandle};
pub use version::PackageVersion;
pub use watcher::{
    CircuitBreaker, FeedPoller, FileSystemWatcher, PluginSourceWatcher, ReloadTrigger,
};
pub use worker::{ManagerConfig, RunConfig, WorkerEvent, WorkerHandle, WorkerLifecycleManager};
