//! Plugin source watchers
//!
//! Watchers emit a [`ReloadTrigger`] whenever new or updated plugin
//! artifacts may exist. Two variants ship: a filesystem watcher and a
//! remote-feed poller; both deliver triggers over the same channel and obey
//! the same start/stop contract.

mod breaker;
mod feed;
mod fs;

pub use breaker::CircuitBreaker;
pub use feed::FeedPoller;
pub use fs::FileSystemWatcher;

use crate::artifact::Artifact;
use crate::error::Result;
use async_trait::async_trait;

/// One "plugins may have changed" notification.
///
/// An empty artifact list means "something changed, rescan"; a non-empty
/// list names the concrete newly available artifacts.
#[derive(Debug, Clone, Default)]
pub struct ReloadTrigger {
    pub artifacts: Vec<Artifact>,
}

impl ReloadTrigger {
    /// A rescan request carrying no concrete artifacts.
    pub fn rescan() -> Self {
        Self::default()
    }

    /// A trigger naming concrete artifacts.
    pub fn with_artifacts(artifacts: Vec<Artifact>) -> Self {
        Self { artifacts }
    }
}

/// Contract every plugin source watcher implements.
#[async_trait]
pub trait PluginSourceWatcher: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Begin emitting triggers. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Cease emitting triggers. Idempotent; triggers already in flight may
    /// still be delivered.
    async fn stop(&self);
}
