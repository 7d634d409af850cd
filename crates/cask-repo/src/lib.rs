//! Content-addressed layer repository.
//!
//! Layers live under `<root>/layers/<commit>` where `<commit>` is the
//! sha256 of the layer tree. A JSON index tracks which
//! `(reference, module, sub_ref)` each commit realizes, together with the
//! deferred-delete marker. Everything mutating goes through [`Repo`];
//! cross-process exclusion is the caller's job via [`RepoLock`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use cask_domain::api::RepoConfig;
use cask_domain::{Architecture, Error, FuzzyReference, Module, PackageInfo, Reference};

pub mod containers;
mod export;
mod fsutil;
mod index;
mod layout;
mod lock;
mod remote;

pub use fsutil::{copy_tree, tree_digest};
pub use index::{LayerItem, LayerQuery};
pub use layout::RepoLayout;
pub use lock::RepoLock;
pub use remote::{DirRemote, RemoteSource, INFO_FILE};

use index::LayerIndex;

/// Where a fuzzy reference may be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveScope {
    Local,
    LocalThenRemote,
    Remote,
}

/// Receives progress while a layer is transferred.
///
/// Long-running facade calls are suspension points for the task engine;
/// the observer is how a task watches them and how cancellation is polled.
pub trait PullObserver {
    fn progress(&self, message: &str);

    fn is_canceled(&self) -> bool {
        false
    }
}

/// Observer for internal transfers nobody watches (rollback re-pulls).
pub struct SilentObserver;

impl PullObserver for SilentObserver {
    fn progress(&self, _message: &str) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub scanned: usize,
    pub reclaimed: usize,
    pub reclaimed_bytes: u64,
}

/// The repo facade the package manager core drives.
pub struct Repo {
    layout: RepoLayout,
    config: Mutex<RepoConfig>,
    index: Mutex<LayerIndex>,
    remote: Box<dyn RemoteSource>,
}

impl Repo {
    /// Open (creating on first use) the repo at `layout`.
    pub fn open(layout: RepoLayout, remote: Box<dyn RemoteSource>) -> Result<Self> {
        fs::create_dir_all(layout.layers_dir())?;
        fs::create_dir_all(layout.merged_dir())?;
        fs::create_dir_all(layout.entries_dir())?;
        fs::create_dir_all(layout.cache_dir())?;
        fs::create_dir_all(layout.tmp_dir())?;

        let config = load_or_init_config(&layout.config_file())?;
        let index = LayerIndex::load(&layout.index_file())?;
        Ok(Self {
            layout,
            config: Mutex::new(config),
            index: Mutex::new(index),
            remote,
        })
    }

    #[must_use]
    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    #[must_use]
    pub fn config(&self) -> RepoConfig {
        self.config.lock().expect("repo config poisoned").clone()
    }

    pub fn set_config(&self, config: RepoConfig) -> Result<()> {
        let path = self.layout.config_file();
        fs::write(&path, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        *self.config.lock().expect("repo config poisoned") = config;
        Ok(())
    }

    /// Resolve a fuzzy reference to exactly one concrete reference.
    pub fn clear_reference(
        &self,
        fuzzy: &FuzzyReference,
        scope: ResolveScope,
        module: Option<&Module>,
    ) -> Result<Reference, Error> {
        match scope {
            ResolveScope::Local => self.resolve_local(fuzzy, module),
            ResolveScope::Remote => self.resolve_remote(fuzzy, module),
            ResolveScope::LocalThenRemote => self
                .resolve_local(fuzzy, module)
                .or_else(|_| self.resolve_remote(fuzzy, module)),
        }
    }

    fn resolve_local(
        &self,
        fuzzy: &FuzzyReference,
        module: Option<&Module>,
    ) -> Result<Reference, Error> {
        let index = self.index.lock().expect("layer index poisoned");
        let mut best: Option<Reference> = None;
        for item in index.all() {
            if item.deleted {
                continue;
            }
            if let Some(module) = module {
                if item.module() != *module {
                    continue;
                }
            }
            let Ok(reference) = item.reference() else {
                continue;
            };
            if !fuzzy.matches(&reference) {
                continue;
            }
            let better = best
                .as_ref()
                .map(|current| reference.version > current.version)
                .unwrap_or(true);
            if better {
                best = Some(reference);
            }
        }
        best.ok_or_else(|| Error::NotFound(fuzzy.to_string()))
    }

    fn resolve_remote(
        &self,
        fuzzy: &FuzzyReference,
        module: Option<&Module>,
    ) -> Result<Reference, Error> {
        let host = fuzzy.arch.clone().unwrap_or_else(Architecture::host);
        let candidates = self
            .remote
            .list(fuzzy)
            .map_err(|err| Error::RemoteUnavailable(err.to_string()))?;

        let mut best: Option<Reference> = None;
        for info in candidates {
            if let Some(module) = module {
                if Module::new(info.module.clone()) != *module {
                    continue;
                }
            }
            let Ok(reference) = Reference::from_info(&info) else {
                continue;
            };
            if reference.arch != host {
                continue;
            }
            let better = best
                .as_ref()
                .map(|current| reference.version > current.version)
                .unwrap_or(true);
            if better {
                best = Some(reference);
            }
        }
        best.ok_or_else(|| Error::NotFound(fuzzy.to_string()))
    }

    /// Every installed layer, deferred-deleted ones included.
    #[must_use]
    pub fn list_local(&self) -> Vec<PackageInfo> {
        let index = self.index.lock().expect("layer index poisoned");
        index.all().iter().map(|item| item.info.clone()).collect()
    }

    #[must_use]
    pub fn list_local_by(&self, query: &LayerQuery) -> Vec<LayerItem> {
        let index = self.index.lock().expect("layer index poisoned");
        index.list_by(query)
    }

    pub fn list_remote(&self, fuzzy: &FuzzyReference) -> Result<Vec<PackageInfo>> {
        self.remote.list(fuzzy)
    }

    /// Modules of `reference` present and not deferred-deleted, deduplicated
    /// across the binary/runtime alias.
    #[must_use]
    pub fn module_list(&self, reference: &Reference) -> Vec<Module> {
        let index = self.index.lock().expect("layer index poisoned");
        let mut modules: Vec<Module> = Vec::new();
        for item in index.items_for(reference) {
            if item.deleted {
                continue;
            }
            let module = item.module();
            if !modules.contains(&module) {
                modules.push(module);
            }
        }
        modules
    }

    /// Intersection of `desired` with the modules the remote offers for
    /// `reference`, keeping the caller's spelling.
    pub fn remote_module_list(
        &self,
        reference: &Reference,
        desired: &[Module],
    ) -> Result<Vec<Module>> {
        let fuzzy = FuzzyReference::new(
            Some(reference.channel.clone()),
            reference.id.clone(),
            Some(reference.version.clone()),
            Some(reference.arch.clone()),
        )
        .context("reference does not form a valid query")?;
        let available: Vec<Module> = self
            .remote
            .list(&fuzzy)?
            .into_iter()
            .map(|info| Module::new(info.module))
            .collect();
        Ok(desired
            .iter()
            .filter(|module| available.contains(module))
            .cloned()
            .collect())
    }

    /// Transfer a layer from the remote into the repo. Idempotent: a layer
    /// already present is left untouched.
    pub fn pull(
        &self,
        observer: &dyn PullObserver,
        reference: &Reference,
        module: &Module,
    ) -> Result<()> {
        if observer.is_canceled() {
            return Ok(());
        }
        {
            let index = self.index.lock().expect("layer index poisoned");
            if index.find(reference, module, None).is_some() {
                debug!(%reference, %module, "layer already present, skipping pull");
                return Ok(());
            }
        }

        observer.progress(&format!("pulling {reference}/{module}"));
        let staging = tempfile::tempdir_in(self.layout.tmp_dir())?;
        self.remote
            .fetch(reference, module, staging.path())
            .with_context(|| format!("failed to fetch {reference}/{module}"))?;

        let info = read_layer_info(staging.path())?;
        let fetched = Reference::from_info(&info)?;
        if fetched != *reference {
            bail!("remote delivered {fetched} while pulling {reference}");
        }

        self.commit_staged(staging.path(), info, None)?;
        observer.progress(&format!("pulled {reference}/{module}"));
        Ok(())
    }

    /// Commit a pre-unpacked directory as a layer. `overlays` are merged on
    /// top of `dir`; `sub_ref` tags a minified variant.
    pub fn import_layer_dir(
        &self,
        dir: &Path,
        overlays: &[PathBuf],
        sub_ref: Option<&str>,
    ) -> Result<Reference> {
        let staging = tempfile::tempdir_in(self.layout.tmp_dir())?;
        fsutil::copy_tree(dir, staging.path())?;
        for overlay in overlays {
            fsutil::copy_tree(overlay, staging.path())?;
        }
        let info = read_layer_info(staging.path())?;
        let reference = Reference::from_info(&info)?;
        self.commit_staged(staging.path(), info, sub_ref)?;
        Ok(reference)
    }

    fn commit_staged(
        &self,
        staged: &Path,
        info: PackageInfo,
        sub_ref: Option<&str>,
    ) -> Result<()> {
        let commit = fsutil::tree_digest(staged)?;
        let layer_dir = self.layout.layer_dir(&commit);
        if !layer_dir.exists() {
            fsutil::copy_tree(staged, &layer_dir)?;
        }

        let mut index = self.index.lock().expect("layer index poisoned");
        index.insert(LayerItem {
            commit,
            info,
            sub_ref: sub_ref.map(str::to_string),
            deleted: false,
        })
    }

    /// Physically delete one layer.
    pub fn remove(
        &self,
        reference: &Reference,
        module: &Module,
        sub_ref: Option<&str>,
    ) -> Result<()> {
        let mut index = self.index.lock().expect("layer index poisoned");
        let removed = index.remove(reference, module, sub_ref)?;
        if !index.commit_in_use(&removed.commit) {
            for dir in [
                self.layout.layer_dir(&removed.commit),
                self.layout.merged_layer_dir(&removed.commit),
            ] {
                if dir.exists() {
                    if let Err(err) = fs::remove_dir_all(&dir) {
                        warn!(path = %dir.display(), %err, "failed to remove layer directory");
                    }
                }
            }
        }
        Ok(())
    }

    /// Set or clear the deferred-delete marker without touching objects.
    pub fn mark_deleted(
        &self,
        reference: &Reference,
        deleted: bool,
        module: &Module,
    ) -> Result<()> {
        let mut index = self.index.lock().expect("layer index poisoned");
        index.set_deleted(reference, module, deleted)
    }

    /// The principal layer item of `reference`.
    pub fn layer_item(&self, reference: &Reference) -> Result<LayerItem, Error> {
        let index = self.index.lock().expect("layer index poisoned");
        index
            .find(reference, &Module::binary(), None)
            .cloned()
            .ok_or_else(|| Error::NotFound(reference.to_string()))
    }

    /// On-disk directory of one layer.
    pub fn layer_dir(
        &self,
        reference: &Reference,
        module: Option<&Module>,
        sub_ref: Option<&str>,
    ) -> Result<PathBuf, Error> {
        let binary = Module::binary();
        let module = module.unwrap_or(&binary);
        let index = self.index.lock().expect("layer index poisoned");
        index
            .find(reference, module, sub_ref)
            .map(|item| self.layout.layer_dir(&item.commit))
            .ok_or_else(|| Error::NotFound(format!("{reference}/{module}")))
    }

    /// Run content-addressed garbage collection over layer directories no
    /// index item references anymore.
    pub fn prune(&self) -> Result<PruneSummary> {
        let index = self.index.lock().expect("layer index poisoned");
        let mut summary = PruneSummary::default();

        for parent in [
            self.layout.layers_dir(),
            self.layout.merged_dir(),
            self.layout.cache_dir(),
        ] {
            if !parent.exists() {
                continue;
            }
            for entry in fs::read_dir(&parent)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let commit = entry.file_name().to_string_lossy().to_string();
                summary.scanned += 1;
                if index.commit_in_use(&commit) {
                    continue;
                }
                let size = fsutil::tree_size(&entry.path());
                fs::remove_dir_all(entry.path()).with_context(|| {
                    format!("failed to prune {}", entry.path().display())
                })?;
                summary.reclaimed += 1;
                summary.reclaimed_bytes += size;
            }
        }

        debug!(
            scanned = summary.scanned,
            reclaimed = summary.reclaimed,
            reclaimed_bytes = summary.reclaimed_bytes,
            "repo prune complete"
        );
        Ok(summary)
    }
}

fn read_layer_info(dir: &Path) -> Result<PackageInfo> {
    let path = dir.join(INFO_FILE);
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("layer has no metadata at {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("malformed layer metadata at {}", path.display()))
}

fn load_or_init_config(path: &Path) -> Result<RepoConfig> {
    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return serde_json::from_str(&contents)
            .with_context(|| format!("malformed repo config at {}", path.display()));
    }
    let config = RepoConfig {
        version: 1,
        default_repo: "main".to_string(),
        repos: [("main".to_string(), String::new())].into_iter().collect(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&config)?)?;
    Ok(config)
}

#[cfg(test)]
mod tests;
