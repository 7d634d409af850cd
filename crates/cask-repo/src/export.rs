//! Desktop-visible entry points and merged module views.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

use cask_domain::{Error, Module, Reference};

use crate::{fsutil, Repo};

impl Repo {
    /// Publish the application's entry points: `<root>/entries/<id>` points
    /// into the principal layer of `reference`.
    ///
    /// At most one version per application id is exported; exporting
    /// replaces any previous target.
    pub fn export_reference(&self, reference: &Reference) -> Result<()> {
        let item = self
            .layer_item(reference)
            .with_context(|| format!("cannot export {reference}"))?;
        let link = self.layout().entries_dir().join(&reference.id);
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link)?;
        }
        symlink(self.layout().layer_dir(&item.commit), &link)
            .with_context(|| format!("failed to export {reference}"))?;
        Ok(())
    }

    /// Retract the application's entry points.
    pub fn unexport_reference(&self, reference: &Reference) -> Result<()> {
        let link = self.layout().entries_dir().join(&reference.id);
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link)
                .with_context(|| format!("failed to unexport {reference}"))?;
        }
        Ok(())
    }

    /// Whether `reference` is the currently exported version of its id.
    #[must_use]
    pub fn is_exported(&self, reference: &Reference) -> bool {
        let Ok(item) = self.layer_item(reference) else {
            return false;
        };
        let link = self.layout().entries_dir().join(&reference.id);
        fs::read_link(&link)
            .map(|target| target == self.layout().layer_dir(&item.commit))
            .unwrap_or(false)
    }

    /// Rebuild the merged overlay views: for every reference with more than
    /// one installed module, `<root>/merged/<commit>` combines all module
    /// layers, principal first.
    pub fn merge_modules(&self) -> Result<()> {
        let merged_root = self.layout().merged_dir();
        if merged_root.exists() {
            fs::remove_dir_all(&merged_root)?;
        }
        fs::create_dir_all(&merged_root)?;

        let mut groups: HashMap<String, Vec<crate::LayerItem>> = HashMap::new();
        for info in self.list_local() {
            let Ok(reference) = Reference::from_info(&info) else {
                continue;
            };
            let items: Vec<_> = self
                .list_local_by(&crate::LayerQuery {
                    id: Some(reference.id.clone()),
                    channel: Some(reference.channel.clone()),
                    version: Some(reference.version.as_str().to_string()),
                    deleted: Some(false),
                })
                .into_iter()
                .filter(|item| item.sub_ref.is_none())
                .collect();
            groups.entry(reference.to_string()).or_insert(items);
        }

        for (reference, mut items) in groups {
            if items.len() < 2 {
                continue;
            }
            // Principal module is copied last so its files win the overlay.
            items.sort_by_key(|item| item.module().is_principal());
            let Some(principal) = items.iter().find(|item| item.module().is_principal()) else {
                continue;
            };
            let view = self.layout().merged_layer_dir(&principal.commit);
            fs::create_dir_all(&view)?;
            for item in &items {
                if let Err(err) = fsutil::copy_tree(&self.layout().layer_dir(&item.commit), &view)
                {
                    warn!(%reference, module = %item.info.module, %err, "failed to merge module");
                }
            }
        }
        Ok(())
    }

    /// The overlay view combining all installed modules of `reference`,
    /// falling back to the principal layer when nothing was merged.
    pub fn merged_module_dir(&self, reference: &Reference) -> Result<PathBuf, Error> {
        let item = self.layer_item(reference)?;
        let view = self.layout().merged_layer_dir(&item.commit);
        if view.exists() {
            Ok(view)
        } else {
            self.layer_dir(reference, Some(&Module::binary()), None)
        }
    }
}
