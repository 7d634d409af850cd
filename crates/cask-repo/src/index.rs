use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use cask_domain::{Module, PackageInfo, Reference};

const INDEX_FORMAT_VERSION: u32 = 1;

/// One installed layer: the on-disk realization of a
/// `(Reference, Module, sub_ref?)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerItem {
    /// Content address of the layer directory.
    pub commit: String,
    pub info: PackageInfo,
    /// Bundle uuid for minified variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_ref: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl LayerItem {
    pub fn reference(&self) -> Result<Reference, cask_domain::Error> {
        Reference::from_info(&self.info)
    }

    #[must_use]
    pub fn module(&self) -> Module {
        Module::new(self.info.module.clone())
    }

    fn matches(&self, reference: &Reference, module: &Module, sub_ref: Option<&str>) -> bool {
        self.module() == *module
            && self.sub_ref.as_deref() == sub_ref
            && self
                .reference()
                .map(|candidate| candidate == *reference)
                .unwrap_or(false)
    }
}

/// Filter over the installed layer set.
#[derive(Debug, Clone, Default)]
pub struct LayerQuery {
    pub id: Option<String>,
    pub channel: Option<String>,
    pub version: Option<String>,
    pub deleted: Option<bool>,
}

impl LayerQuery {
    fn matches(&self, item: &LayerItem) -> bool {
        if let Some(id) = &self.id {
            if &item.info.id != id {
                return false;
            }
        }
        if let Some(channel) = &self.channel {
            if &item.info.channel != channel {
                return false;
            }
        }
        if let Some(version) = &self.version {
            if &item.info.version != version {
                return false;
            }
        }
        if let Some(deleted) = self.deleted {
            if item.deleted != deleted {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    items: Vec<LayerItem>,
}

/// The persisted set of installed layers.
///
/// Loaded once at repo open; every mutation rewrites the document through a
/// temp file so a crash never leaves a torn index behind.
#[derive(Debug)]
pub struct LayerIndex {
    path: PathBuf,
    items: Vec<LayerItem>,
}

impl LayerIndex {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                items: Vec::new(),
            });
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read layer index {}", path.display()))?;
        let doc: IndexDocument = serde_json::from_str(&contents)
            .with_context(|| format!("layer index {} is corrupt", path.display()))?;
        if doc.version != INDEX_FORMAT_VERSION {
            bail!(
                "layer index format {} is not supported (expected {})",
                doc.version,
                INDEX_FORMAT_VERSION
            );
        }
        Ok(Self {
            path: path.to_path_buf(),
            items: doc.items,
        })
    }

    fn persist(&self) -> Result<()> {
        let doc = IndexDocument {
            version: INDEX_FORMAT_VERSION,
            items: self.items.clone(),
        };
        let parent = self
            .path
            .parent()
            .context("layer index path has no parent")?;
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(serde_json::to_string_pretty(&doc)?.as_bytes())?;
        tmp.persist(&self.path)
            .map_err(|err| anyhow::anyhow!("failed to persist layer index: {err}"))?;
        Ok(())
    }

    /// Insert a new item. At most one item may exist per
    /// `(Reference, Module, sub_ref)`.
    pub fn insert(&mut self, item: LayerItem) -> Result<()> {
        let reference = item.reference()?;
        if self
            .find(&reference, &item.module(), item.sub_ref.as_deref())
            .is_some()
        {
            bail!(
                "layer {}/{} is already present in the repo",
                reference,
                item.info.module
            );
        }
        self.items.push(item);
        self.persist()
    }

    #[must_use]
    pub fn find(
        &self,
        reference: &Reference,
        module: &Module,
        sub_ref: Option<&str>,
    ) -> Option<&LayerItem> {
        self.items
            .iter()
            .find(|item| item.matches(reference, module, sub_ref))
    }

    pub fn remove(
        &mut self,
        reference: &Reference,
        module: &Module,
        sub_ref: Option<&str>,
    ) -> Result<LayerItem> {
        let pos = self
            .items
            .iter()
            .position(|item| item.matches(reference, module, sub_ref))
            .with_context(|| format!("layer {reference}/{module} is not in the repo"))?;
        let removed = self.items.remove(pos);
        self.persist()?;
        Ok(removed)
    }

    pub fn set_deleted(
        &mut self,
        reference: &Reference,
        module: &Module,
        deleted: bool,
    ) -> Result<()> {
        let mut touched = false;
        for item in &mut self.items {
            let matches = item.module() == *module
                && item
                    .reference()
                    .map(|candidate| candidate == *reference)
                    .unwrap_or(false);
            if matches {
                item.deleted = deleted;
                touched = true;
            }
        }
        if !touched {
            bail!("layer {reference}/{module} is not in the repo");
        }
        self.persist()
    }

    #[must_use]
    pub fn list_by(&self, query: &LayerQuery) -> Vec<LayerItem> {
        self.items
            .iter()
            .filter(|item| query.matches(item))
            .cloned()
            .collect()
    }

    /// Every item realizing any module of `reference`, minified variants
    /// included.
    #[must_use]
    pub fn items_for(&self, reference: &Reference) -> Vec<LayerItem> {
        self.items
            .iter()
            .filter(|item| {
                item.reference()
                    .map(|candidate| candidate == *reference)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn all(&self) -> &[LayerItem] {
        &self.items
    }

    /// Whether any other item still references `commit`.
    #[must_use]
    pub fn commit_in_use(&self, commit: &str) -> bool {
        self.items.iter().any(|item| item.commit == commit)
    }
}
