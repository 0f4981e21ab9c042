//! Process configuration
//!
//! All settings are read from the environment once at startup and passed
//! explicitly to each subsystem. Nothing in the core reads the environment
//! after construction.

use crate::error::{ReplugError, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which plugin sources emit reload triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HotReloadMode {
    /// Watch configured directories for module changes.
    #[default]
    FileSystem,
    /// Poll a remote package feed for new versions.
    ArtifactoryFeed,
    /// Both of the above.
    Both,
}

impl HotReloadMode {
    /// True when the filesystem watcher should run.
    pub fn includes_filesystem(&self) -> bool {
        matches!(self, Self::FileSystem | Self::Both)
    }

    /// True when the feed poller should run.
    pub fn includes_feed(&self) -> bool {
        matches!(self, Self::ArtifactoryFeed | Self::Both)
    }
}

impl FromStr for HotReloadMode {
    type Err = ReplugError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filesystem" => Ok(Self::FileSystem),
            "artifactoryfeed" => Ok(Self::ArtifactoryFeed),
            "both" => Ok(Self::Both),
            other => Err(ReplugError::InvalidConfiguration(format!(
                "Unknown HOT_RELOAD_MODE '{other}' (expected FileSystem, ArtifactoryFeed or Both)"
            ))),
        }
    }
}

/// Remote package feed settings.
#[derive(Clone)]
pub struct FeedConfig {
    /// Feed base URL.
    pub url: String,
    /// Basic-auth user name.
    pub username: Option<String>,
    /// Basic-auth password. Never logged.
    pub password: Option<String>,
    /// Interval between polls.
    pub poll_interval: Duration,
    /// Package-id search terms. Empty means the default query.
    pub package_filters: Vec<String>,
    /// Root directory for downloaded archives.
    pub download_path: PathBuf,
    /// Staged package directories older than this are removed.
    pub retention: Duration,
    /// Consecutive failures before the circuit breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open.
    pub circuit_cooldown: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: None,
            password: None,
            poll_interval: Duration::from_secs(30),
            package_filters: Vec::new(),
            download_path: default_download_path(),
            retention: Duration::from_secs(24 * 60 * 60),
            failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

impl std::fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("poll_interval", &self.poll_interval)
            .field("package_filters", &self.package_filters)
            .field("download_path", &self.download_path)
            .field("retention", &self.retention)
            .finish()
    }
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// host:port of the orchestration service.
    pub server: String,
    /// Task queue this worker polls.
    pub task_queue: String,
    /// Human-readable worker name for registration.
    pub worker_name: Option<String>,
    /// Master switch for the watcher/coordinator stack.
    pub hot_reload_enabled: bool,
    /// Which watcher variants run.
    pub mode: HotReloadMode,
    /// Directories watched for module changes.
    pub watch_paths: Vec<PathBuf>,
    /// Glob matched against module file names.
    pub file_filter: String,
    /// Debounce window for filesystem bursts.
    pub debounce: Duration,
    /// Delay between a trigger and the load, letting writers finish.
    pub quiesce_delay: Duration,
    /// File-name prefixes never loaded as plugin modules.
    pub exclude_prefixes: Vec<String>,
    /// Extra directories scanned recursively for loose modules.
    pub cache_roots: Vec<PathBuf>,
    /// Archive subtree holding modules: `lib/<framework_tag>/`.
    pub framework_tag: String,
    /// Feed settings; present when the mode includes the feed.
    pub feed: Option<FeedConfig>,
    /// Health endpoint port. 0 disables the endpoint.
    pub health_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "localhost:7233".to_string(),
            task_queue: "default".to_string(),
            worker_name: None,
            hot_reload_enabled: true,
            mode: HotReloadMode::default(),
            watch_paths: Vec::new(),
            file_filter: default_file_filter(),
            debounce: Duration::from_millis(1000),
            quiesce_delay: Duration::from_millis(1000),
            exclude_prefixes: default_exclude_prefixes(),
            cache_roots: default_cache_roots(),
            framework_tag: "replug1".to_string(),
            feed: None,
            health_port: 8080,
        }
    }
}

impl Config {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(server) = env_string("TEMPORAL_SERVER") {
            config.server = server;
        }
        if let Some(queue) = env_string("TASK_QUEUE") {
            config.task_queue = queue;
        }
        config.worker_name = env_string("WORKER_NAME");
        if let Some(enabled) = env_string("HOT_RELOAD_ENABLED") {
            config.hot_reload_enabled = parse_bool("HOT_RELOAD_ENABLED", &enabled)?;
        }
        if let Some(mode) = env_string("HOT_RELOAD_MODE") {
            config.mode = mode.parse()?;
        }
        if let Some(paths) = env_string("HOT_RELOAD_WATCH_PATHS") {
            config.watch_paths = parse_paths(&paths);
        }
        if let Some(filter) = env_string("HOT_RELOAD_FILE_FILTER") {
            config.file_filter = filter;
        }
        if let Some(ms) = env_string("HOT_RELOAD_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(parse_number("HOT_RELOAD_DEBOUNCE_MS", &ms)?);
        }
        if let Some(port) = env_string("HEALTH_PORT") {
            config.health_port = parse_number::<u16>("HEALTH_PORT", &port)?;
        }

        if config.hot_reload_enabled && config.mode.includes_feed() {
            let url = env_string("ARTIFACTORY_FEED_URL").ok_or_else(|| {
                ReplugError::InvalidConfiguration(
                    "ARTIFACTORY_FEED_URL is required when HOT_RELOAD_MODE includes the feed"
                        .to_string(),
                )
            })?;

            let mut feed = FeedConfig {
                url: url.trim_end_matches('/').to_string(),
                username: env_string("ARTIFACTORY_USERNAME"),
                password: env_string("ARTIFACTORY_PASSWORD"),
                ..FeedConfig::default()
            };
            if let Some(secs) = env_string("ARTIFACTORY_POLL_INTERVAL_SECONDS") {
                feed.poll_interval =
                    Duration::from_secs(parse_number("ARTIFACTORY_POLL_INTERVAL_SECONDS", &secs)?);
            }
            if let Some(filters) = env_string("ARTIFACTORY_PACKAGE_FILTERS") {
                feed.package_filters = filters
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(path) = env_string("ARTIFACTORY_DOWNLOAD_PATH") {
                feed.download_path = PathBuf::from(path);
            }
            config.feed = Some(feed);
        }

        Ok(config)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ReplugError::InvalidConfiguration(format!(
            "{key} must be true or false, got '{other}'"
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        ReplugError::InvalidConfiguration(format!("{key} must be a number, got '{value}'"))
    })
}

fn parse_paths(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn default_file_filter() -> String {
    format!("*.{}", std::env::consts::DLL_EXTENSION)
}

fn default_download_path() -> PathBuf {
    std::env::temp_dir().join("replug").join("packages")
}

fn default_cache_roots() -> Vec<PathBuf> {
    // The process's own installation directory is a conventional drop spot
    // for loose plugin modules.
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .into_iter()
        .collect()
}

fn default_exclude_prefixes() -> Vec<String> {
    ["libstd-", "libc.", "libgcc", "libssl", "libcrypto", "replug", "libreplug"]
        .into_iter()
        .map(String::from)
        .collect()
}
