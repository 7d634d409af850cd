use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use cask_domain::{FuzzyReference, Kind, Module, PackageInfo, Reference};
use cask_repo::{containers, LayerItem, LayerQuery, RepoLock, ResolveScope, SilentObserver};

use crate::manager::ManagerInner;
use crate::transaction::Transaction;

impl ManagerInner {
    /// Retire `old_ref` after `new_ref` landed.
    ///
    /// A reference still used by a running container is only marked for
    /// deferred deletion; the periodic pass reaps it once the container is
    /// gone. Otherwise the old layers are removed immediately and the new
    /// reference takes over the exported entry points.
    pub(crate) fn remove_after_install(
        self: &Arc<Self>,
        old_ref: &Reference,
        new_ref: &Reference,
        modules: &[Module],
    ) -> Result<()> {
        let _lock = RepoLock::acquire(&self.repo.layout().lock_file())?;
        let busy = containers::is_ref_busy(self.repo.layout().run_root(), old_ref)?;

        let mut tx = Transaction::new();
        if busy {
            for module in modules {
                self.repo
                    .mark_deleted(old_ref, true, module)
                    .with_context(|| {
                        format!("failed to mark {old_ref}/{module} for deferred deletion")
                    })?;
                let inner = Arc::clone(self);
                let reference = old_ref.clone();
                let module = module.clone();
                tx.add_rollback(move || {
                    if let Err(err) = inner.repo.mark_deleted(&reference, false, &module) {
                        warn!(%reference, %module, %err, "failed to roll back deferred-delete mark");
                    }
                });
            }
            tx.commit();
            return Ok(());
        }

        self.repo
            .unexport_reference(old_ref)
            .with_context(|| format!("failed to unexport {old_ref}"))?;
        {
            let inner = Arc::clone(self);
            let reference = old_ref.clone();
            tx.add_rollback(move || {
                if let Err(err) = inner.repo.export_reference(&reference) {
                    warn!(%reference, %err, "failed to re-export during rollback");
                }
            });
        }

        for module in modules {
            if module.is_principal() {
                self.remove_cache(old_ref);
            }
            self.repo
                .remove(old_ref, module, None)
                .with_context(|| format!("failed to remove {old_ref}/{module}"))?;

            let inner = Arc::clone(self);
            let reference = old_ref.clone();
            let module = module.clone();
            tx.add_rollback(move || {
                if let Err(err) = inner.repo.pull(&SilentObserver, &reference, &module) {
                    warn!(%reference, %module, %err, "failed to restore layer during rollback");
                    return;
                }
                if module.is_principal() {
                    if let Err(err) = inner.generate_cache(&reference) {
                        error!(%reference, %err, "failed to regenerate cache during rollback");
                    }
                }
            });
        }

        if let Err(err) = self.repo.merge_modules() {
            error!(%err, "merge modules failed");
        }
        self.repo
            .export_reference(new_ref)
            .with_context(|| format!("failed to export {new_ref}"))?;

        tx.commit();
        Ok(())
    }

    /// The deferred-GC pass: reap every marked-deleted reference that no
    /// running container uses anymore, then re-export the latest surviving
    /// version of each affected application.
    pub(crate) fn deferred_gc(&self) {
        let _lock = match RepoLock::acquire(&self.repo.layout().lock_file()) {
            Ok(lock) => lock,
            Err(err) => {
                error!(%err, "skipping deferred reap, failed to lock repo");
                return;
            }
        };

        let deleted = self.repo.list_local_by(&LayerQuery {
            deleted: Some(true),
            ..LayerQuery::default()
        });

        let mut groups: HashMap<String, Vec<LayerItem>> = HashMap::new();
        for item in deleted {
            let Ok(reference) = item.reference() else {
                error!(id = %item.info.id, "layer index entry is unparsable, skipping");
                continue;
            };
            groups.entry(reference.to_string()).or_default().push(item);
        }
        if groups.is_empty() {
            return;
        }

        let running = match containers::busy_refs(self.repo.layout().run_root()) {
            Ok(running) => running,
            Err(err) => {
                error!(%err, "skipping deferred reap, failed to list running containers");
                return;
            }
        };
        groups.retain(|reference, _| !running.contains(reference));
        if groups.is_empty() {
            return;
        }

        for (ref_string, items) in groups {
            let Ok(reference) = Reference::parse(&ref_string) else {
                error!(%ref_string, "grouped reference is unparsable, skipping");
                continue;
            };
            debug!(%reference, "reaping deferred-deleted reference");

            if let Err(err) = self.repo.unexport_reference(&reference) {
                warn!(%reference, %err, "failed to unexport while reaping");
            }
            for item in items {
                if item.module().is_principal() {
                    self.remove_cache(&reference);
                }
                if let Err(err) =
                    self.repo
                        .remove(&reference, &item.module(), item.sub_ref.as_deref())
                {
                    error!(%reference, module = %item.info.module, %err, "failed to reap layer");
                    continue;
                }
            }

            if let Err(err) = self.repo.merge_modules() {
                error!(%err, "merge modules failed");
            }

            // A downgrade-by-deletion must leave the remaining version
            // visible on the desktop.
            let survivor = self.repo.clear_reference(
                &reference.to_fuzzy_latest(),
                ResolveScope::Local,
                None,
            );
            match survivor {
                Ok(latest) => {
                    if let Err(err) = self.repo.export_reference(&latest) {
                        warn!(reference = %latest, %err, "failed to export surviving version");
                    }
                }
                Err(_) => debug!(%reference, "no surviving version to export"),
            }
        }
    }

    /// Reference-count reachability over installed principal layers:
    /// remove every base/runtime nothing depends on. Returns the removed
    /// layers' metadata.
    pub(crate) fn prune_packages(&self) -> Result<Vec<PackageInfo>> {
        let _lock = RepoLock::acquire(&self.repo.layout().lock_file())?;
        let installed = self.repo.list_local();

        let mut counts: HashMap<Reference, usize> = HashMap::new();
        for info in &installed {
            if !Module::new(info.module.clone()).is_principal() {
                continue;
            }

            if info.kind != Kind::App {
                // Keep unless nobody claims it.
                if let Ok(reference) = Reference::from_info(info) {
                    counts.entry(reference).or_insert(0);
                }
                continue;
            }

            if let Some(declared) = &info.runtime {
                self.count_dependency(declared, &mut counts);
            }
            if !info.base.is_empty() {
                self.count_dependency(&info.base, &mut counts);
            }
        }

        let mut removed = Vec::new();
        for (reference, count) in &counts {
            if *count != 0 {
                continue;
            }
            // An unreferenced principal takes its sibling modules with it.
            for item in self.repo.list_local_by(&LayerQuery {
                id: Some(reference.id.clone()),
                channel: Some(reference.channel.clone()),
                version: Some(reference.version.as_str().to_string()),
                deleted: None,
            }) {
                if item.module().is_principal() {
                    self.remove_cache(reference);
                }
                removed.push(item.info.clone());
                self.repo
                    .remove(reference, &item.module(), item.sub_ref.as_deref())
                    .with_context(|| format!("failed to prune {reference}"))?;
            }
        }

        if !counts.is_empty() {
            if let Err(err) = self.repo.merge_modules() {
                error!(%err, "merge modules failed");
            }
        }
        self.repo.prune()?;
        Ok(removed)
    }

    fn count_dependency(&self, declared: &str, counts: &mut HashMap<Reference, usize>) {
        let fuzzy = match FuzzyReference::parse(declared) {
            Ok(fuzzy) => fuzzy,
            Err(err) => {
                warn!(%declared, %err, "ignoring unparsable dependency");
                return;
            }
        };
        match self.repo.clear_reference(&fuzzy, ResolveScope::Local, None) {
            Ok(reference) => *counts.entry(reference).or_insert(0) += 1,
            Err(err) => warn!(%declared, %err, "declared dependency is not installed"),
        }
    }
}
