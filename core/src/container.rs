//! Code containers: isolation units for one generation of loaded plugin code

use libloading::Library;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Modules loaded; handles may be dispatched.
    Live,
    /// Unload requested; the container must not receive new references.
    Unloading,
}

/// Owns the dynamic libraries of one plugin generation.
///
/// A container is filled by the loader before publication and treated as
/// immutable afterward. It is never reused: every reload allocates a fresh
/// container with the next generation number. Requesting unload flips the
/// state; the libraries themselves are unmapped when the last strong
/// reference (held by the registry or by in-flight task handles) is dropped,
/// so code belonging to a draining worker stays mapped until that work
/// completes.
pub struct CodeContainer {
    generation: u64,
    libraries: Vec<Library>,
    module_paths: Vec<PathBuf>,
    state: Mutex<ContainerState>,
}

impl CodeContainer {
    /// Create an empty container for the given generation.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            libraries: Vec::new(),
            module_paths: Vec::new(),
            state: Mutex::new(ContainerState::Live),
        }
    }

    /// Generation this container belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    /// True until unload has been requested.
    pub fn is_live(&self) -> bool {
        self.state() == ContainerState::Live
    }

    /// Take ownership of a loaded library. Loader-only, pre-publication.
    pub(crate) fn adopt(&mut self, library: Library, path: &Path) {
        self.libraries.push(library);
        self.module_paths.push(path.to_path_buf());
    }

    /// Number of modules held.
    pub fn module_count(&self) -> usize {
        self.libraries.len()
    }

    /// Paths of the modules held.
    pub fn module_paths(&self) -> &[PathBuf] {
        &self.module_paths
    }

    /// Mark the container as unloading. Idempotent.
    ///
    /// The caller must have ensured no current worker references it; memory
    /// is reclaimed once every outstanding handle is dropped.
    pub fn request_unload(&self) {
        let mut state = self.state.lock();
        if *state == ContainerState::Live {
            *state = ContainerState::Unloading;
            debug!(
                generation = self.generation,
                modules = self.libraries.len(),
                "container unload requested"
            );
        }
    }
}

impl Drop for CodeContainer {
    fn drop(&mut self) {
        debug!(
            generation = self.generation,
            modules = self.libraries.len(),
            "container dropped, unmapping modules"
        );
    }
}

impl std::fmt::Debug for CodeContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeContainer")
            .field("generation", &self.generation)
            .field("modules", &self.module_paths)
            .field("state", &self.state())
            .finish()
    }
}
