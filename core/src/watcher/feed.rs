//! Remote package-feed poller
//!
//! Periodically queries a package feed for the configured package ids,
//! downloads versions newer than the last known one into the staging root,
//! and emits a trigger naming the downloaded artifacts. Consecutive poll
//! failures open a circuit breaker that suspends polling for a cooldown;
//! a missing package (404) is not a failure, the package simply is not
//! published yet.

use super::breaker::CircuitBreaker;
use super::{PluginSourceWatcher, ReloadTrigger};
use crate::artifact::Artifact;
use crate::config::FeedConfig;
use crate::error::{ReplugError, Result};
use crate::version::PackageVersion;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Query term used when no package filters are configured.
const DEFAULT_QUERY: &str = "replug";

/// Maximum search results fetched per query term.
const QUERY_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationIndex {
    #[serde(default)]
    items: Vec<RegistrationPage>,
}

#[derive(Debug, Deserialize)]
struct RegistrationPage {
    #[serde(default)]
    items: Vec<RegistrationLeaf>,
}

#[derive(Debug, Deserialize)]
struct RegistrationLeaf {
    #[serde(rename = "catalogEntry")]
    catalog_entry: CatalogEntry,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[allow(dead_code)]
    id: String,
    version: String,
}

struct FeedShared {
    config: FeedConfig,
    http: reqwest::Client,
    breaker: Mutex<CircuitBreaker>,
    last_known: Mutex<HashMap<String, PackageVersion>>,
    trigger_tx: mpsc::Sender<ReloadTrigger>,
}

struct PollInner {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Polling plugin source backed by a package feed.
pub struct FeedPoller {
    shared: std::sync::Arc<FeedShared>,
    inner: Mutex<Option<PollInner>>,
}

impl FeedPoller {
    /// Create a poller; triggers are sent on `trigger_tx`.
    pub fn new(config: FeedConfig, trigger_tx: mpsc::Sender<ReloadTrigger>) -> Result<Self> {
        if config.url.is_empty() {
            return Err(ReplugError::InvalidConfiguration(
                "feed URL must not be empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let breaker = CircuitBreaker::new(config.failure_threshold, config.circuit_cooldown);

        Ok(Self {
            shared: std::sync::Arc::new(FeedShared {
                config,
                http,
                breaker: Mutex::new(breaker),
                last_known: Mutex::new(HashMap::new()),
                trigger_tx,
            }),
            inner: Mutex::new(None),
        })
    }

    /// Versions currently remembered per package.
    pub fn last_known_versions(&self) -> HashMap<String, PackageVersion> {
        self.shared.last_known.lock().clone()
    }
}

impl FeedShared {
    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.get(url);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }
        request
    }

    async fn discover_package_ids(&self) -> Result<Vec<String>> {
        let terms: Vec<String> = if self.config.package_filters.is_empty() {
            vec![DEFAULT_QUERY.to_string()]
        } else {
            self.config.package_filters.clone()
        };

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for term in terms {
            let url = format!("{}/query?q={}&take={}", self.config.url, term, QUERY_PAGE_SIZE);
            let response = self.get(&url).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                continue;
            }
            let body: SearchResponse = response.error_for_status()?.json().await?;
            for entry in body.data {
                if seen.insert(entry.id.clone()) {
                    ids.push(entry.id);
                }
            }
        }
        Ok(ids)
    }

    /// Latest published version of a package; `None` when the package does
    /// not exist yet.
    async fn latest_version(&self, id: &str) -> Result<Option<PackageVersion>> {
        let url = format!(
            "{}/registration/{}/index.json",
            self.config.url,
            id.to_lowercase()
        );
        let response = self.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let index: RegistrationIndex = response.error_for_status()?.json().await?;

        let latest = index
            .items
            .iter()
            .flat_map(|page| page.items.iter())
            .filter_map(|leaf| leaf.catalog_entry.version.parse::<PackageVersion>().ok())
            .max();
        Ok(latest)
    }

    async fn download(&self, id: &str, version: &PackageVersion) -> Result<PathBuf> {
        let id_lower = id.to_lowercase();
        let version_lower = version.to_string().to_lowercase();
        let url = format!(
            "{}/flatcontainer/{id_lower}/{version_lower}/{id_lower}.{version_lower}.zip",
            self.config.url
        );

        let response = self.get(&url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        let dir = self
            .config
            .download_path
            .join(id)
            .join(version.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let file = dir.join(format!("{id}.{version}.zip"));
        tokio::fs::write(&file, &bytes).await?;

        info!(package = %id, version = %version, path = %file.display(), "package downloaded");
        Ok(file)
    }

    async fn poll_once(&self) -> Result<Vec<Artifact>> {
        let ids = self.discover_package_ids().await?;
        debug!(packages = ids.len(), "feed poll");

        let mut artifacts = Vec::new();
        for id in ids {
            let Some(version) = self.latest_version(&id).await? else {
                continue;
            };

            let already_known = {
                let known = self.last_known.lock();
                known.get(&id).map(|k| *k >= version).unwrap_or(false)
            };
            if already_known {
                continue;
            }

            let path = self.download(&id, &version).await?;
            self.last_known.lock().insert(id.clone(), version.clone());
            artifacts.push(Artifact::new(id, version, path));
        }
        Ok(artifacts)
    }

    /// Remove staged package-version directories past the retention window.
    ///
    /// Runs on the poll task itself, so it can never race a download in
    /// flight.
    fn cleanup_stale(&self) {
        let root = &self.config.download_path;
        if !root.is_dir() {
            return;
        }
        let Ok(packages) = std::fs::read_dir(root) else {
            return;
        };
        let now = SystemTime::now();

        for package in packages.filter_map(|e| e.ok()) {
            let Ok(versions) = std::fs::read_dir(package.path()) else {
                continue;
            };
            for version_dir in versions.filter_map(|e| e.ok()) {
                let path = version_dir.path();
                if !path.is_dir() {
                    continue;
                }
                let stale = std::fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .map(|age| age >= self.config.retention)
                    .unwrap_or(false);
                if stale {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => info!(path = %path.display(), "removed stale staged package"),
                        Err(error) => {
                            warn!(path = %path.display(), %error, "cannot remove stale package")
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PluginSourceWatcher for FeedPoller {
    fn name(&self) -> &'static str {
        "artifactory-feed"
    }

    async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();

        let task = tokio::spawn(async move {
            info!(
                feed = %shared.config.url,
                interval = ?shared.config.poll_interval,
                "feed poller started"
            );
            loop {
                // The timer re-arms only after the previous poll returns, so
                // at most one poll is in flight.
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                }

                if shared.breaker.lock().is_open(Instant::now()) {
                    debug!("feed circuit breaker open, skipping poll");
                    continue;
                }

                shared.cleanup_stale();

                match shared.poll_once().await {
                    Ok(artifacts) => {
                        shared.breaker.lock().record_success();
                        if !artifacts.is_empty() {
                            if shared
                                .trigger_tx
                                .send(ReloadTrigger::with_artifacts(artifacts))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Err(error) => {
                        warn!(%error, "feed poll failed");
                        if shared.breaker.lock().record_failure(Instant::now()) {
                            warn!(
                                cooldown = ?shared.config.circuit_cooldown,
                                "feed circuit breaker open, suspending polling"
                            );
                        }
                    }
                }
            }
            debug!("feed poller task stopped");
        });

        *inner = Some(PollInner { shutdown_tx, task });
        Ok(())
    }

    async fn stop(&self) {
        let inner = self.inner.lock().take();
        if let Some(inner) = inner {
            let _ = inner.shutdown_tx.send(true);
            let _ = inner.task.await;
            info!("feed poller stopped");
        }
    }
}
