//! Error types for the replug core

/// Main error type for replug
#[derive(Debug, thiserror::Error)]
pub enum ReplugError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// HTTP communication error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem watch error
    #[error("Filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Package archive error
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Dynamic module load error
    #[error("Module load error: {0}")]
    ModuleLoad(#[from] libloading::Error),

    /// Module was built against a different toolchain or core version
    #[error("Incompatible plugin: {0}")]
    IncompatiblePlugin(String),

    /// Artifact could not be staged or contained no loadable modules
    #[error("Bad artifact {artifact}: {reason}")]
    BadArtifact { artifact: String, reason: String },

    /// Orchestration service could not be reached
    #[error("Orchestration service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Work item execution failed
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Work item kind has no registered handler
    #[error("Task not registered: {0}")]
    TaskNotFound(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias for replug core operations
pub type Result<T> = std::result::Result<T, ReplugError>;
