use std::sync::Arc;

use tracing::{error, warn};

use cask_domain::api::{
    CommonResult, InstallParameters, InteractionContext, InteractionMessageType, TaskResult,
};
use cask_domain::{codes, Kind, Module, PackageInfo, Reference};
use cask_repo::{LayerQuery, ResolveScope};

use crate::manager::{reject, reject_message, ManagerInner, PackageManager};
use crate::task::{State, SubState, TaskHandle, WaitOutcome};
use crate::transaction::Transaction;

impl PackageManager {
    /// Install an application (or one of its extra modules) from the
    /// remote.
    pub fn install(&self, params: InstallParameters) -> Result<TaskResult, CommonResult> {
        let fuzzy = params.package.to_fuzzy().map_err(reject)?;
        let cur_module = Module::new(
            params
                .package
                .module
                .clone()
                .unwrap_or_else(|| Module::BINARY.to_string()),
        );

        if !cur_module.is_principal() {
            // Extra modules track the installed application's version.
            if fuzzy.version.is_some() {
                return Err(reject_message(
                    codes::INVALID_ARGS,
                    "cannot specify a version when installing a module",
                ));
            }

            let inner = Arc::clone(self.inner());
            let module = cur_module.clone();
            let query = fuzzy.clone();
            let task = self
                .inner()
                .engine
                .submit(vec![fuzzy.to_string()], move |task| {
                    let local =
                        match inner.repo.clear_reference(&query, ResolveScope::Local, None) {
                            Ok(local) => local,
                            Err(_) => {
                                task.fail(
                                    "to install the module, one must first install the application",
                                );
                                return;
                            }
                        };
                    if inner.repo.module_list(&local).contains(&module) {
                        task.fail(format!("module {module} is already installed"));
                        return;
                    }
                    inner.install(task, local, None, vec![module]);
                })
                .map_err(reject)?;

            self.inner().sink.task_added(task.object_path());
            task.update_state(State::Queued, "queued to install from remote");
            return Ok(TaskResult {
                task_object_path: task.object_path().to_string(),
                code: 0,
                message: "installing".into(),
            });
        }

        // A pinned version that is already installed is rejected up front.
        if fuzzy.version.is_some() {
            if let Ok(installed) =
                self.inner()
                    .repo
                    .clear_reference(&fuzzy, ResolveScope::Local, None)
            {
                return Err(reject_message(
                    codes::ALREADY_INSTALLED,
                    format!("{installed} is already installed"),
                ));
            }
        }

        // The upgrade decision needs the latest local line, whatever
        // version the caller pinned.
        let mut latest = fuzzy.clone();
        latest.version = None;
        let local_ref = self
            .inner()
            .repo
            .clear_reference(&latest, ResolveScope::Local, None)
            .ok();

        let remote_ref = self
            .inner()
            .repo
            .clear_reference(&fuzzy, ResolveScope::Remote, Some(&cur_module))
            .map_err(reject)?;

        let mut message_type = InteractionMessageType::Install;
        if let Some(local) = &local_ref {
            if remote_ref.version == local.version {
                return Err(reject_message(
                    codes::ALREADY_INSTALLED,
                    format!("{local} is already installed"),
                ));
            }
            if remote_ref.version > local.version {
                message_type = InteractionMessageType::Upgrade;
            } else if !params.options.force {
                return Err(reject_message(
                    codes::ALREADY_INSTALLED,
                    format!(
                        "The latest version has been installed. If you want to replace it, \
                         try using 'cask install {}/{} --force'",
                        remote_ref.id, remote_ref.version
                    ),
                ));
            }
        }

        let context = InteractionContext {
            local_ref: local_ref.as_ref().map(Reference::to_string),
            remote_ref: Some(remote_ref.to_string()),
        };
        let ref_spec =
            self.inner()
                .ref_spec(&self.inner().default_repo_name(), &remote_ref, &cur_module);

        let inner = Arc::clone(self.inner());
        let skip_interaction = params.options.skip_interaction;
        let task_local = local_ref.clone();
        let result_message = format!("{remote_ref} is now installing");
        let task = self
            .inner()
            .engine
            .submit(vec![ref_spec], move |task| {
                if message_type == InteractionMessageType::Upgrade && !skip_interaction {
                    match task.request_interaction(message_type, &context) {
                        WaitOutcome::Reply(reply) if reply.accepted() => {}
                        _ => task.update_state(State::Canceled, "canceled"),
                    }
                }
                if task.is_done() {
                    return;
                }

                let modules = match &task_local {
                    Some(local) => inner.repo.module_list(local),
                    None => vec![Module::new(cur_module.as_str())],
                };
                inner.install(task, remote_ref, task_local, modules);
            })
            .map_err(reject)?;

        self.inner().sink.task_added(task.object_path());
        task.update_state(State::Queued, "queued to install from remote");
        Ok(TaskResult {
            task_object_path: task.object_path().to_string(),
            code: 0,
            message: result_message,
        })
    }
}

impl ManagerInner {
    /// Install `new_ref` for `modules`, replacing `old_ref` when present.
    /// All-or-nothing: a failure on any step unwinds what was installed.
    pub(crate) fn install(
        self: &Arc<Self>,
        task: &TaskHandle,
        new_ref: Reference,
        old_ref: Option<Reference>,
        modules: Vec<Module>,
    ) {
        task.update_state(State::Processing, format!("installing {new_ref}"));

        let install_modules = match self.repo.remote_module_list(&new_ref, &modules) {
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

        let mut tx = Transaction::new();
        {
            let inner = Arc::clone(self);
            let reference = new_ref.clone();
            let rollback_modules = install_modules.clone();
            tx.add_rollback(move || {
                inner.remove_modules_quiet(&reference, &rollback_modules);
            });
        }

        self.install_ref(task, &new_ref, install_modules);
        if task.is_done() {
            return;
        }

        task.update_sub_state(SubState::PostAction, "processing after install");
        if let Err(err) = self.repo.merge_modules() {
            error!(%err, "merge modules failed");
        }

        let layer = match self.repo.layer_item(&new_ref) {
            Ok(layer) => layer,
            Err(err) => {
                task.fail(err.to_string());
                return;
            }
        };

        if layer.info.kind == Kind::App {
            if let Some(old_ref) = &old_ref {
                if let Err(err) = self.remove_after_install(old_ref, &new_ref, &modules) {
                    task.fail(format!(
                        "failed to remove old reference {old_ref} after install {new_ref}: {err}"
                    ));
                    return;
                }
            } else if let Err(err) = self.repo.export_reference(&new_ref) {
                warn!(%new_ref, %err, "failed to export reference");
            }

            if let Err(err) = self.generate_cache(&new_ref) {
                task.fail(format!("failed to generate cache: {err}"));
                return;
            }
        }

        tx.commit();
        task.update_state(State::Succeed, format!("install {new_ref} success"));
    }

    /// Bring the layers of `reference` into the repo: unmark deferred
    /// deletes where possible, pull the rest, then pull the principal
    /// module's declared dependencies.
    pub(crate) fn install_ref(
        self: &Arc<Self>,
        task: &TaskHandle,
        reference: &Reference,
        mut modules: Vec<Module>,
    ) {
        task.update_sub_state(SubState::PreAction, "beginning to install");

        let host = cask_domain::Architecture::host();
        if reference.arch != host {
            task.fail(format!(
                "package architecture {} does not match host architecture {host}",
                reference.arch
            ));
            return;
        }

        task.update_sub_state(
            SubState::InstallApplication,
            format!("installing application {reference}"),
        );

        let deleted = self.repo.list_local_by(&LayerQuery {
            id: Some(reference.id.clone()),
            channel: Some(reference.channel.clone()),
            version: Some(reference.version.as_str().to_string()),
            deleted: Some(true),
        });

        let mut tx = Transaction::new();

        // A marked-deleted layer of the same version is resurrected instead
        // of pulled again.
        for item in deleted {
            if task.is_done() {
                return;
            }
            let Some(pos) = modules.iter().position(|module| *module == item.module()) else {
                continue;
            };
            if let Err(err) = self.repo.mark_deleted(reference, false, &item.module()) {
                error!(%reference, %err, "failed to unmark deferred delete");
                task.fail("install failed");
                return;
            }
            {
                let inner = Arc::clone(self);
                let reference = reference.clone();
                let module = item.module();
                tx.add_rollback(move || {
                    if let Err(err) = inner.repo.mark_deleted(&reference, true, &module) {
                        warn!(%reference, %err, "failed to roll back deferred-delete unmark");
                    }
                });
            }
            modules.remove(pos);
        }

        for module in modules {
            if task.is_done() {
                return;
            }
            if let Err(err) = self.repo.pull(task, reference, &module) {
                task.fail(format!("failed to pull {reference}/{module}: {err}"));
                return;
            }
            if task.is_done() {
                return;
            }
            {
                let inner = Arc::clone(self);
                let reference = reference.clone();
                let module = module.clone();
                tx.add_rollback(move || {
                    if let Err(err) = inner.repo.remove(&reference, &module, None) {
                        error!(%reference, %module, %err, "failed to roll back pull");
                    }
                });
            }

            if !module.is_principal() {
                continue;
            }

            let info = match self.repo.layer_item(reference) {
                Ok(item) => item.info,
                Err(err) => {
                    task.fail(err.to_string());
                    return;
                }
            };
            // Dependencies are always pulled as their principal module,
            // whatever spelling the application itself used.
            self.pull_dependency(task, &info, &Module::binary());
            if task.is_done() {
                return;
            }
        }

        tx.commit();
    }

    /// Resolve and pull the runtime (if declared) and base of an app layer.
    /// Layers already present locally are used as-is.
    pub(crate) fn pull_dependency(
        self: &Arc<Self>,
        task: &TaskHandle,
        info: &PackageInfo,
        module: &Module,
    ) {
        if info.kind != Kind::App || !module.is_principal() {
            return;
        }

        let mut tx = Transaction::new();

        if let Some(declared) = &info.runtime {
            let runtime_ref = match self.resolve_dependency(declared) {
                Ok(reference) => reference,
                Err(err) => {
                    task.fail(err);
                    return;
                }
            };
            task.update_sub_state(
                SubState::InstallRuntime,
                format!("installing runtime {runtime_ref}"),
            );
            if self.repo.layer_dir(&runtime_ref, None, None).is_err() {
                if task.is_done() {
                    return;
                }
                if let Err(err) = self.repo.pull(task, &runtime_ref, module) {
                    task.fail(format!("failed to install runtime: {err}"));
                    return;
                }
                if task.is_done() {
                    return;
                }
                let inner = Arc::clone(self);
                let reference = runtime_ref.clone();
                let module = module.clone();
                tx.add_rollback(move || {
                    if let Err(err) = inner.repo.remove(&reference, &module, None) {
                        error!(%reference, %err, "failed to roll back runtime pull");
                    }
                });
            }
        }

        let base_ref = match self.resolve_dependency(&info.base) {
            Ok(reference) => reference,
            Err(err) => {
                task.fail(err);
                return;
            }
        };
        task.update_sub_state(SubState::InstallBase, format!("installing base {base_ref}"));
        if self.repo.layer_dir(&base_ref, None, None).is_err() {
            if task.is_done() {
                return;
            }
            if let Err(err) = self.repo.pull(task, &base_ref, module) {
                task.fail(format!("failed to install base: {err}"));
                return;
            }
            if task.is_done() {
                return;
            }
            let inner = Arc::clone(self);
            let reference = base_ref.clone();
            let module = module.clone();
            tx.add_rollback(move || {
                if let Err(err) = inner.repo.remove(&reference, &module, None) {
                    error!(%reference, %err, "failed to roll back base pull");
                }
            });
        }

        tx.commit();
    }

    fn resolve_dependency(&self, declared: &str) -> Result<Reference, String> {
        let fuzzy = cask_domain::FuzzyReference::parse(declared)
            .map_err(|err| format!("invalid dependency '{declared}': {err}"))?;
        self.repo
            .clear_reference(&fuzzy, ResolveScope::LocalThenRemote, None)
            .map_err(|err| format!("dependency {declared} is unavailable: {err}"))
    }

    /// Best-effort removal used when an install unwinds.
    pub(crate) fn remove_modules_quiet(&self, reference: &Reference, modules: &[Module]) {
        for module in modules {
            if module.is_principal() {
                self.remove_cache(reference);
            }
            if let Err(err) = self.repo.remove(reference, module, None) {
                error!(%reference, %module, %err, "rollback removal failed");
            }
        }
        if let Err(err) = self.repo.merge_modules() {
            error!(%err, "merge modules failed during rollback");
        }
    }
}
