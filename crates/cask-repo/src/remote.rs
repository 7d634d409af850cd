use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

use cask_domain::{FuzzyReference, Module, PackageInfo, Reference};

use crate::fsutil;

pub const INFO_FILE: &str = "info.json";

/// Remote side of the object store: list candidates, fetch layer trees.
///
/// The wire transport is not this crate's concern; implementations range
/// from a mounted mirror tree to a network-backed store.
pub trait RemoteSource: Send + Sync {
    /// Enumerate remote candidates matching `fuzzy`.
    fn list(&self, fuzzy: &FuzzyReference) -> Result<Vec<PackageInfo>>;

    /// Materialize the layer for `(reference, module)` into `dest`.
    fn fetch(&self, reference: &Reference, module: &Module, dest: &Path) -> Result<()>;
}

/// A remote backed by a directory tree laid out as
/// `<root>/<channel>/<id>/<version>/<arch>/<module>/`.
#[derive(Debug, Clone)]
pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn module_dir(&self, reference: &Reference, module: &Module) -> PathBuf {
        self.root
            .join(&reference.channel)
            .join(&reference.id)
            .join(reference.version.as_str())
            .join(reference.arch.as_str())
            .join(module.as_str())
    }

    /// Add a layer to the remote tree. `payload` entries become files
    /// relative to the layer root, next to the generated `info.json`.
    pub fn add_layer(&self, info: &PackageInfo, payload: &[(&str, &[u8])]) -> Result<Reference> {
        let reference = Reference::from_info(info)?;
        let dir = self.module_dir(&reference, &Module::new(info.module.clone()));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(INFO_FILE), serde_json::to_string_pretty(info)?)?;
        for (rel, bytes) in payload {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, bytes)?;
        }
        Ok(reference)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

impl RemoteSource for DirRemote {
    fn list(&self, fuzzy: &FuzzyReference) -> Result<Vec<PackageInfo>> {
        let channels = match &fuzzy.channel {
            Some(channel) => vec![self.root.join(channel)],
            None => subdirs(&self.root)?,
        };

        let mut found = Vec::new();
        for channel_dir in channels {
            let id_dir = channel_dir.join(&fuzzy.id);
            for version_dir in subdirs(&id_dir)? {
                for arch_dir in subdirs(&version_dir)? {
                    for module_dir in subdirs(&arch_dir)? {
                        let info_path = module_dir.join(INFO_FILE);
                        if !info_path.exists() {
                            continue;
                        }
                        let contents = fs::read_to_string(&info_path)?;
                        let info: PackageInfo =
                            serde_json::from_str(&contents).with_context(|| {
                                format!("malformed layer metadata at {}", info_path.display())
                            })?;
                        let Ok(reference) = Reference::from_info(&info) else {
                            debug!(path = %info_path.display(), "skipping unparsable remote entry");
                            continue;
                        };
                        if fuzzy.matches(&reference) {
                            found.push(info);
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    fn fetch(&self, reference: &Reference, module: &Module, dest: &Path) -> Result<()> {
        let dir = self.module_dir(reference, module);
        if !dir.join(INFO_FILE).exists() {
            // The principal module may be published under its alias.
            let alias = if module.as_str() == Module::BINARY {
                Some(Module::new(Module::RUNTIME))
            } else if module.as_str() == Module::RUNTIME {
                Some(Module::new(Module::BINARY))
            } else {
                None
            };
            let aliased = alias.map(|alias| self.module_dir(reference, &alias));
            match aliased {
                Some(aliased) if aliased.join(INFO_FILE).exists() => {
                    return fsutil::copy_tree(&aliased, dest);
                }
                _ => bail!("remote has no layer for {reference}/{module}"),
            }
        }
        fsutil::copy_tree(&dir, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_domain::Kind;

    fn info(id: &str, version: &str, module: &str, kind: Kind) -> PackageInfo {
        PackageInfo {
            kind,
            id: id.into(),
            name: id.into(),
            channel: "stable".into(),
            version: version.into(),
            arch: "x86_64".into(),
            module: module.into(),
            base: "org.example.base/23".into(),
            runtime: None,
            uuid: None,
            description: None,
        }
    }

    #[test]
    fn lists_candidates_matching_fuzzy() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirRemote::new(dir.path());
        remote
            .add_layer(&info("org.example.editor", "1.0.0", "binary", Kind::App), &[])
            .unwrap();
        remote
            .add_layer(&info("org.example.editor", "1.1.0", "binary", Kind::App), &[])
            .unwrap();
        remote
            .add_layer(&info("org.example.other", "2.0.0", "binary", Kind::App), &[])
            .unwrap();

        let fuzzy = FuzzyReference::parse("org.example.editor").unwrap();
        let found = remote.list(&fuzzy).unwrap();
        assert_eq!(found.len(), 2);

        let pinned = FuzzyReference::parse("org.example.editor/1.1.0").unwrap();
        assert_eq!(remote.list(&pinned).unwrap().len(), 1);
    }

    #[test]
    fn fetch_copies_layer_tree() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirRemote::new(dir.path());
        let info = info("org.example.editor", "1.0.0", "binary", Kind::App);
        let reference = remote
            .add_layer(&info, &[("files/bin/editor", b"#!".as_slice())])
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        remote
            .fetch(&reference, &Module::binary(), dest.path())
            .unwrap();
        assert!(dest.path().join(INFO_FILE).exists());
        assert!(dest.path().join("files/bin/editor").exists());
    }

    #[test]
    fn fetch_falls_back_to_principal_alias() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirRemote::new(dir.path());
        let info = info("org.example.runtime", "20", "runtime", Kind::Runtime);
        let reference = remote.add_layer(&info, &[]).unwrap();

        let dest = tempfile::tempdir().unwrap();
        remote
            .fetch(&reference, &Module::binary(), dest.path())
            .unwrap();
        assert!(dest.path().join(INFO_FILE).exists());
    }
}
