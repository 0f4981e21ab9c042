//! Filesystem watcher
//!
//! Watches the configured directories for module creation, modification,
//! renames and deletions, and coalesces bursts into a single rescan trigger.
//! The debounce timer fires a fixed interval after the first eligible event;
//! later events within the window do not push the deadline out. Package
//! installers and build tools write many files in rapid succession, so one
//! reload per burst is the useful granularity.

use super::{PluginSourceWatcher, ReloadTrigger};
use crate::error::{ReplugError, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct WatchInner {
    // Dropping the notify watcher stops event delivery.
    _watcher: RecommendedWatcher,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Debounced filesystem plugin source.
pub struct FileSystemWatcher {
    paths: Vec<PathBuf>,
    debounce: Duration,
    filter: GlobSet,
    exclude_prefixes: Vec<String>,
    trigger_tx: mpsc::Sender<ReloadTrigger>,
    inner: Mutex<Option<WatchInner>>,
}

impl FileSystemWatcher {
    /// Create a watcher over `paths`; triggers are sent on `trigger_tx`.
    pub fn new(
        paths: Vec<PathBuf>,
        file_filter: &str,
        exclude_prefixes: Vec<String>,
        debounce: Duration,
        trigger_tx: mpsc::Sender<ReloadTrigger>,
    ) -> Result<Self> {
        let glob = Glob::new(file_filter).map_err(|e| {
            ReplugError::InvalidConfiguration(format!("invalid file filter '{file_filter}': {e}"))
        })?;
        let mut builder = GlobSetBuilder::new();
        builder.add(glob);
        let filter = builder
            .build()
            .map_err(|e| ReplugError::InvalidConfiguration(format!("file filter build: {e}")))?;

        Ok(Self {
            paths,
            debounce,
            filter,
            exclude_prefixes,
            trigger_tx,
            inner: Mutex::new(None),
        })
    }

    fn event_is_eligible(filter: &GlobSet, exclude_prefixes: &[String], event: &Event) -> bool {
        // Touches surface as metadata-only modifications and must still
        // trigger a rescan, so every create/modify/remove counts.
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }
        event.paths.iter().any(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| {
                    filter.is_match(Path::new(name))
                        && !exclude_prefixes.iter().any(|p| name.starts_with(p.as_str()))
                })
                .unwrap_or(false)
        })
    }
}

#[async_trait]
impl PluginSourceWatcher for FileSystemWatcher {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Ok(());
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let filter = self.filter.clone();
        let exclude = self.exclude_prefixes.clone();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if Self::event_is_eligible(&filter, &exclude, &event) {
                        let _ = event_tx.send(event);
                    }
                }
                Err(error) => warn!(%error, "filesystem watch error"),
            },
        )?;

        for path in &self.paths {
            match watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => info!(path = %path.display(), "watching directory"),
                Err(error) => warn!(path = %path.display(), %error, "cannot watch directory"),
            }
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let trigger_tx = self.trigger_tx.clone();
        let debounce = self.debounce;

        let task = tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                let timer = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => {
                            debug!(paths = ?event.paths, "eligible filesystem event");
                            // First event arms the timer; the window never
                            // extends past its original expiry.
                            deadline.get_or_insert_with(|| Instant::now() + debounce);
                        }
                        None => break,
                    },
                    _ = timer => {
                        deadline = None;
                        debug!("debounce window elapsed, requesting rescan");
                        if trigger_tx.send(ReloadTrigger::rescan()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("filesystem watcher task stopped");
        });

        *inner = Some(WatchInner {
            _watcher: watcher,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    async fn stop(&self) {
        let inner = self.inner.lock().take();
        if let Some(inner) = inner {
            let _ = inner.shutdown_tx.send(true);
            drop(inner._watcher);
            let _ = inner.task.await;
            info!("filesystem watcher stopped");
        }
    }
}
