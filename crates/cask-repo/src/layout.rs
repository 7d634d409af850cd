use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_ROOT: &str = "/var/lib/cask";
const DEFAULT_RUN_ROOT: &str = "/run/cask";

/// Filesystem layout of one repo installation.
///
/// `CASK_ROOT` overrides the install root, `CASK_RUN_ROOT` the runtime
/// directory that holds the lock sentinel and container state files.
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
    run_root: PathBuf,
}

impl RepoLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, run_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_root: run_root.into(),
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        let root = env::var_os("CASK_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        let run_root = env::var_os("CASK_RUN_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUN_ROOT));
        Self { root, run_root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.run_root.join("lock")
    }

    #[must_use]
    pub fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    #[must_use]
    pub fn layer_dir(&self, commit: &str) -> PathBuf {
        self.layers_dir().join(commit)
    }

    #[must_use]
    pub fn merged_dir(&self) -> PathBuf {
        self.root.join("merged")
    }

    #[must_use]
    pub fn merged_layer_dir(&self, commit: &str) -> PathBuf {
        self.merged_dir().join(commit)
    }

    #[must_use]
    pub fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    #[must_use]
    pub fn layer_cache_dir(&self, commit: &str) -> PathBuf {
        self.cache_dir().join(commit)
    }

    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    #[must_use]
    pub fn index_file(&self) -> PathBuf {
        self.root.join("index.json")
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }
}
