//! Artifact loader
//!
//! Turns artifacts into a fresh [`CodeContainer`] plus the
//! [`RegistrationSet`] their modules contribute. Archives are extracted to a
//! unique staging directory and modules located under `lib/<framework_tag>/`;
//! loose modules are additionally gathered from the watch paths and cache
//! roots. A failure staging one artifact or loading one module never aborts
//! the whole pass; it is counted and skipped.

use crate::artifact::Artifact;
use crate::config::Config;
use crate::container::CodeContainer;
use crate::error::{ReplugError, Result};
use crate::plugin::{
    PluginDeclaration, PluginRegistrar, PluginTask, PluginWorkflow, CORE_VERSION,
    DECLARATION_SYMBOL, RUSTC_VERSION,
};
use crate::registry::{RegistrationSet, TaskHandle, WorkflowTypeHandle};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use libloading::Library;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Loader settings, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Directories scanned for loose modules on every pass.
    pub watch_paths: Vec<PathBuf>,
    /// Additional recursively scanned roots.
    pub cache_roots: Vec<PathBuf>,
    /// Archive subtree holding modules: `lib/<framework_tag>/`.
    pub framework_tag: String,
    /// Glob matched against module file names.
    pub module_filter: String,
    /// File-name prefixes never loaded.
    pub exclude_prefixes: Vec<String>,
    /// Base directory for archive extraction.
    pub extract_root: PathBuf,
}

impl LoaderConfig {
    /// Derive loader settings from the process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            watch_paths: config.watch_paths.clone(),
            cache_roots: config.cache_roots.clone(),
            framework_tag: config.framework_tag.clone(),
            module_filter: config.file_filter.clone(),
            exclude_prefixes: config.exclude_prefixes.clone(),
            extract_root: std::env::temp_dir().join("replug").join("extract"),
        }
    }
}

/// Outcome of one load pass.
pub struct LoadOutcome {
    /// Container holding the loaded modules; `None` when nothing loaded.
    pub container: Option<Arc<CodeContainer>>,
    /// Registrations the modules contributed.
    pub set: RegistrationSet,
    /// Artifacts that staged successfully this pass.
    pub artifacts_loaded: Vec<Artifact>,
    /// Artifacts that failed to stage.
    pub artifact_errors: usize,
    /// Modules that failed to load or register.
    pub module_errors: usize,
}

/// The loading seam the coordinator drives.
#[async_trait]
pub trait ArtifactLoad: Send + Sync {
    /// Load the given artifacts plus every loose module currently on disk
    /// into a fresh container for `generation`.
    async fn load_generation(&self, generation: u64, artifacts: Vec<Artifact>)
        -> Result<LoadOutcome>;

    /// Best-effort release of a superseded container. The caller must have
    /// ensured no current worker references it.
    fn unload(&self, container: Arc<CodeContainer>);
}

/// Filesystem- and dlopen-backed loader.
#[derive(Clone)]
pub struct ArtifactLoader {
    config: LoaderConfig,
    filter: GlobSet,
    extract_seq: Arc<AtomicU64>,
}

impl ArtifactLoader {
    /// Build a loader; fails on an invalid module filter glob.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let glob = Glob::new(&config.module_filter).map_err(|e| {
            ReplugError::InvalidConfiguration(format!(
                "invalid module filter '{}': {e}",
                config.module_filter
            ))
        })?;
        let mut builder = GlobSetBuilder::new();
        builder.add(glob);
        let filter = builder.build().map_err(|e| {
            ReplugError::InvalidConfiguration(format!("module filter build failed: {e}"))
        })?;

        Ok(Self {
            config,
            filter,
            extract_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// True when a file name passes the module glob and no exclusion prefix.
    fn eligible(&self, file_name: &str) -> bool {
        if !self.filter.is_match(Path::new(file_name)) {
            return false;
        }
        !self
            .config
            .exclude_prefixes
            .iter()
            .any(|prefix| file_name.starts_with(prefix.as_str()))
    }

    /// Recursively gather eligible module files under `root`.
    fn collect_modules(&self, root: &Path) -> Vec<PathBuf> {
        if !root.exists() {
            return Vec::new();
        }
        let mut modules: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| self.eligible(name))
                    .unwrap_or(false)
            })
            .map(|entry| entry.into_path())
            .collect();
        modules.sort();
        modules
    }

    /// Extract an archive to a unique staging directory and return it.
    fn extract_archive(&self, artifact: &Artifact) -> Result<PathBuf> {
        let seq = self.extract_seq.fetch_add(1, Ordering::SeqCst);
        let dest = self
            .config
            .extract_root
            .join(format!("{}-{}-{}", artifact.name, artifact.version, seq));
        std::fs::create_dir_all(&dest)?;

        let file = File::open(&artifact.path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(relative) = entry.enclosed_name() else {
                continue;
            };
            let target = dest.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                std::io::copy(&mut entry, &mut out)?;
            }
        }

        debug!(artifact = %artifact, dest = %dest.display(), "archive extracted");
        Ok(dest)
    }

    /// Stage one artifact and return the module files it contributes.
    fn stage_artifact(&self, artifact: &Artifact) -> Result<Vec<PathBuf>> {
        let root = if artifact.is_archive() {
            let extracted = self.extract_archive(artifact)?;
            let subtree = extracted.join("lib").join(&self.config.framework_tag);
            if !subtree.is_dir() {
                return Err(ReplugError::BadArtifact {
                    artifact: artifact.to_string(),
                    reason: format!("missing lib/{} subtree", self.config.framework_tag),
                });
            }
            subtree
        } else {
            let subtree = artifact.path.join("lib").join(&self.config.framework_tag);
            if subtree.is_dir() {
                subtree
            } else {
                artifact.path.clone()
            }
        };

        let modules = self.collect_modules(&root);
        if modules.is_empty() {
            return Err(ReplugError::BadArtifact {
                artifact: artifact.to_string(),
                reason: "no eligible modules".to_string(),
            });
        }
        Ok(modules)
    }

    /// Load one module and collect its registrations.
    ///
    /// # Safety
    /// Runs the module's registration entry point; the declaration's version
    /// fields gate the call to same-toolchain builds.
    unsafe fn load_module(
        &self,
        path: &Path,
        collected: &mut CollectedRegistrations,
    ) -> Result<Library> {
        let library = Library::new(path)?;
        let declaration = library
            .get::<*const PluginDeclaration>(DECLARATION_SYMBOL)?
            .read();

        if declaration.rustc_version != RUSTC_VERSION {
            return Err(ReplugError::IncompatiblePlugin(format!(
                "{} built with {}, host uses {}",
                path.display(),
                declaration.rustc_version,
                RUSTC_VERSION
            )));
        }
        if declaration.core_version != CORE_VERSION {
            return Err(ReplugError::IncompatiblePlugin(format!(
                "{} built against core {}, host is {}",
                path.display(),
                declaration.core_version,
                CORE_VERSION
            )));
        }

        (declaration.register)(collected);
        Ok(library)
    }

    fn load_generation_sync(&self, generation: u64, artifacts: &[Artifact]) -> Result<LoadOutcome> {
        let mut module_paths: Vec<PathBuf> = Vec::new();
        let mut artifacts_loaded = Vec::new();
        let mut artifact_errors = 0usize;

        for artifact in artifacts {
            match self.stage_artifact(artifact) {
                Ok(paths) => {
                    artifacts_loaded.push(artifact.clone());
                    module_paths.extend(paths);
                }
                Err(error) => {
                    warn!(artifact = %artifact, %error, "skipping artifact");
                    artifact_errors += 1;
                }
            }
        }

        for root in self
            .config
            .watch_paths
            .iter()
            .chain(self.config.cache_roots.iter())
        {
            module_paths.extend(self.collect_modules(root));
        }

        // Dedup by canonical path; the same module reachable through two
        // roots loads once.
        let mut seen: HashSet<PathBuf> = HashSet::new();
        module_paths.retain(|path| {
            let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
            seen.insert(canonical)
        });

        let mut container = CodeContainer::new(generation);
        let mut collected = CollectedRegistrations::default();
        let mut module_errors = 0usize;

        for path in &module_paths {
            match unsafe { self.load_module(path, &mut collected) } {
                Ok(library) => {
                    debug!(module = %path.display(), generation, "module loaded");
                    container.adopt(library, path);
                }
                Err(error) => {
                    warn!(module = %path.display(), %error, "skipping module");
                    module_errors += 1;
                }
            }
        }

        let (container, set) = if container.module_count() > 0 {
            let container = Arc::new(container);
            let mut set = RegistrationSet::new();
            for task in collected.tasks {
                set.insert_task(TaskHandle::new(task, container.clone()));
            }
            for workflow in collected.workflows {
                set.insert_workflow(WorkflowTypeHandle::new(workflow, container.clone()));
            }
            (Some(container), set)
        } else {
            (None, RegistrationSet::new())
        };

        Ok(LoadOutcome {
            container,
            set,
            artifacts_loaded,
            artifact_errors,
            module_errors,
        })
    }
}

#[async_trait]
impl ArtifactLoad for ArtifactLoader {
    async fn load_generation(
        &self,
        generation: u64,
        artifacts: Vec<Artifact>,
    ) -> Result<LoadOutcome> {
        let loader = self.clone();
        tokio::task::spawn_blocking(move || loader.load_generation_sync(generation, &artifacts))
            .await
            .map_err(|e| ReplugError::Other(format!("loader task failed: {e}")))?
    }

    fn unload(&self, container: Arc<CodeContainer>) {
        container.request_unload();
        // Libraries unmap once the last handle referencing the container is
        // dropped; nothing further to trigger here.
        drop(container);
    }
}

/// Accumulates registrations handed over by plugin entry points.
#[derive(Default)]
struct CollectedRegistrations {
    tasks: Vec<Box<dyn PluginTask>>,
    workflows: Vec<Box<dyn PluginWorkflow>>,
}

impl PluginRegistrar for CollectedRegistrations {
    fn register_task(&mut self, task: Box<dyn PluginTask>) {
        self.tasks.push(task);
    }

    fn register_workflow(&mut self, workflow: Box<dyn PluginWorkflow>) {
        self.workflows.push(workflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::PackageVersion;
    use std::io::Write;
    use tempfile::TempDir;

    fn version(s: &str) -> PackageVersion {
        s.parse().unwrap()
    }

    fn test_loader(tmp: &TempDir, watch: Vec<PathBuf>) -> ArtifactLoader {
        ArtifactLoader::new(LoaderConfig {
            watch_paths: watch,
            cache_roots: Vec::new(),
            framework_tag: "replug1".to_string(),
            module_filter: "*.so".to_string(),
            exclude_prefixes: vec!["libstd-".to_string(), "libssl".to_string()],
            extract_root: tmp.path().join("extract"),
        })
        .unwrap()
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, bytes) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_eligible_names() {
        let tmp = TempDir::new().unwrap();
        let loader = test_loader(&tmp, vec![]);

        assert!(loader.eligible("notifications.so"));
        assert!(!loader.eligible("notifications.txt"));
        assert!(!loader.eligible("libstd-abcdef.so"));
        assert!(!loader.eligible("libssl.so"));
    }

    #[test]
    fn test_collect_modules_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("plugins");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("b.so"), b"junk").unwrap();
        std::fs::write(dir.join("nested").join("a.so"), b"junk").unwrap();
        std::fs::write(dir.join("libstd-xyz.so"), b"junk").unwrap();
        std::fs::write(dir.join("readme.txt"), b"docs").unwrap();

        let loader = test_loader(&tmp, vec![]);
        let modules = loader.collect_modules(&dir);
        let names: Vec<_> = modules
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b.so", "a.so"]);
    }

    #[test]
    fn test_collect_modules_missing_root() {
        let tmp = TempDir::new().unwrap();
        let loader = test_loader(&tmp, vec![]);
        assert!(loader.collect_modules(Path::new("/does/not/exist")).is_empty());
    }

    #[tokio::test]
    async fn test_archive_extraction_locates_subtree() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("notifications.1.0.2.zip");
        write_zip(
            &archive,
            &[
                ("lib/replug1/notifications.so", b"not a real module"),
                ("lib/replug1/libstd-123.so", b"excluded"),
                ("readme.md", b"docs"),
            ],
        );

        let loader = test_loader(&tmp, vec![]);
        let artifact = Artifact::new("notifications", version("1.0.2"), &archive);
        let outcome = loader.load_generation(1, vec![artifact]).await.unwrap();

        // Staging succeeded; the junk module fails to dlopen and is skipped.
        assert_eq!(outcome.artifacts_loaded.len(), 1);
        assert_eq!(outcome.artifact_errors, 0);
        assert_eq!(outcome.module_errors, 1);
        assert!(outcome.set.is_empty());
        assert!(outcome.container.is_none());
    }

    #[tokio::test]
    async fn test_archive_without_subtree_is_bad_artifact() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("empty.1.0.0.zip");
        write_zip(&archive, &[("docs/readme.md", b"nothing here")]);

        let loader = test_loader(&tmp, vec![]);
        let artifact = Artifact::new("empty", version("1.0.0"), &archive);
        let outcome = loader.load_generation(1, vec![artifact]).await.unwrap();

        assert_eq!(outcome.artifact_errors, 1);
        assert!(outcome.artifacts_loaded.is_empty());
        assert!(outcome.set.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_bad_artifact() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("corrupt.1.0.0.zip");
        std::fs::write(&archive, b"definitely not a zip archive").unwrap();

        let loader = test_loader(&tmp, vec![]);
        let artifact = Artifact::new("corrupt", version("1.0.0"), &archive);
        let outcome = loader.load_generation(1, vec![artifact]).await.unwrap();

        assert_eq!(outcome.artifact_errors, 1);
        assert_eq!(outcome.module_errors, 0);
        assert!(outcome.set.is_empty());
    }

    #[tokio::test]
    async fn test_loose_modules_from_watch_paths() {
        let tmp = TempDir::new().unwrap();
        let watch = tmp.path().join("watched");
        std::fs::create_dir_all(&watch).unwrap();
        std::fs::write(watch.join("reporting.so"), b"junk module").unwrap();
        std::fs::write(watch.join("notes.txt"), b"ignored").unwrap();

        let loader = test_loader(&tmp, vec![watch]);
        let outcome = loader.load_generation(2, vec![]).await.unwrap();

        // The junk file is a candidate but fails to load; the pass still
        // completes with an empty set and no container.
        assert_eq!(outcome.module_errors, 1);
        assert_eq!(outcome.artifact_errors, 0);
        assert!(outcome.set.is_empty());
        assert!(outcome.container.is_none());
    }

    #[tokio::test]
    async fn test_clean_empty_scan() {
        let tmp = TempDir::new().unwrap();
        let watch = tmp.path().join("empty");
        std::fs::create_dir_all(&watch).unwrap();

        let loader = test_loader(&tmp, vec![watch]);
        let outcome = loader.load_generation(3, vec![]).await.unwrap();

        assert_eq!(outcome.module_errors, 0);
        assert_eq!(outcome.artifact_errors, 0);
        assert!(outcome.set.is_empty());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let result = ArtifactLoader::new(LoaderConfig {
            watch_paths: vec![],
            cache_roots: vec![],
            framework_tag: "replug1".to_string(),
            module_filter: "*.{so".to_string(),
            exclude_prefixes: vec![],
            extract_root: std::env::temp_dir(),
        });
        assert!(matches!(result, Err(ReplugError::InvalidConfiguration(_))));
    }
}
