use std::sync::Arc;

use tracing::{error, info};

use cask_domain::api::{CommonResult, TaskResult, UpdateParameters};
use cask_domain::{codes, Kind, Module, Reference};
use cask_repo::ResolveScope;

use crate::manager::{reject, reject_message, ManagerInner, PackageManager};
use crate::task::{State, TaskHandle};

impl PackageManager {
    /// Update a batch of installed packages to their newest remote
    /// versions. The whole batch runs as one task; each pair reports
    /// `PartCompleted` as it lands.
    pub fn update(&self, params: UpdateParameters) -> Result<TaskResult, CommonResult> {
        let mut upgrades: Vec<(Reference, Reference)> = Vec::new();
        let mut ref_specs = Vec::new();
        let default_repo = self.inner().default_repo_name();

        for package in &params.packages {
            let fuzzy = package.to_fuzzy().map_err(reject)?;
            let installed = self
                .inner()
                .repo
                .clear_reference(&fuzzy, ResolveScope::Local, None)
                .map_err(|_| {
                    reject_message(codes::NOT_INSTALLED, format!("{fuzzy} is not installed"))
                })?;

            let item = self
                .inner()
                .repo
                .layer_item(&installed)
                .map_err(reject)?;

            let new_ref = self
                .inner()
                .latest_remote_reference(item.info.kind, fuzzy)
                .map_err(reject)?;

            if new_ref.version <= installed.version {
                return Err(reject_message(
                    codes::ALREADY_INSTALLED,
                    format!(
                        "remote version is {}, the latest version {} is already installed",
                        new_ref.version, installed.version
                    ),
                ));
            }

            ref_specs.push(self.inner().ref_spec(
                &default_repo,
                &installed,
                &Module::binary(),
            ));
            upgrades.push((installed, new_ref));
        }

        let inner = Arc::clone(self.inner());
        let task = self
            .inner()
            .engine
            .submit(ref_specs, move |task| {
                for (old_ref, new_ref) in &upgrades {
                    if task.is_done() {
                        return;
                    }
                    info!(%old_ref, %new_ref, "upgrading");
                    inner.update_pair(task, old_ref, new_ref);
                }
            })
            .map_err(reject)?;

        self.inner().sink.task_added(task.object_path());
        task.update_state(State::Queued, "queued to update");
        Ok(TaskResult {
            task_object_path: task.object_path().to_string(),
            code: 0,
            message: "updating".into(),
        })
    }
}

impl ManagerInner {
    pub(crate) fn update_pair(
        self: &Arc<Self>,
        task: &TaskHandle,
        old_ref: &Reference,
        new_ref: &Reference,
    ) {
        task.update_state(State::Processing, format!("start to update {old_ref}"));

        let modules = self.repo.module_list(old_ref);
        let install_modules = match self.repo.remote_module_list(new_ref, &modules) {
            Ok(modules) => modules,
            Err(err) => {
                task.fail(err.to_string());
                return;
            }
        };
        if install_modules.is_empty() {
            let wanted: Vec<_> = modules.iter().map(Module::as_str).collect();
            task.fail(format!(
                "these modules do not exist remotely: {}",
                wanted.join(", ")
            ));
            return;
        }

        self.install_ref(task, new_ref, install_modules);
        if task.is_done() {
            return;
        }

        task.update_state(
            State::PartCompleted,
            format!("upgrade {old_ref} to {new_ref} success"),
        );

        if let Ok(true) = self.is_ref_busy(old_ref) {
            task.annotate_deferred(
                "Please restart the application after saving your data \
                 to experience the new version.",
            );
        }

        // The newer version is installed; nothing below may fail the task
        // except a broken cache for an app layer.
        let new_item = match self.repo.layer_item(new_ref) {
            Ok(item) => item,
            Err(err) => {
                error!(%new_ref, %err, "failed to load layer item after upgrade");
                return;
            }
        };

        if new_item.info.kind == Kind::App {
            if let Err(err) = self.remove_after_install(old_ref, new_ref, &modules) {
                error!(%old_ref, %new_ref, %err, "failed to retire old reference");
                return;
            }
            if let Err(err) = self.generate_cache(new_ref) {
                task.fail(format!("failed to generate cache: {err}"));
                return;
            }
        }

        if let Err(err) = self.repo.merge_modules() {
            error!(%err, "merge modules failed");
        }
    }
}
