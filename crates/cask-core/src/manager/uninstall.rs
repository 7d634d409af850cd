use std::sync::Arc;

use tracing::{error, warn};

use cask_domain::api::{CommonResult, TaskResult, UninstallParameters};
use cask_domain::{codes, Module, Reference};
use cask_repo::{ResolveScope, SilentObserver};

use crate::manager::{reject, reject_message, ManagerInner, PackageManager};
use crate::task::{State, SubState, TaskHandle};
use crate::transaction::Transaction;

impl PackageManager {
    /// Uninstall an application or one of its modules.
    pub fn uninstall(&self, params: UninstallParameters) -> Result<TaskResult, CommonResult> {
        let fuzzy = params.package.to_fuzzy().map_err(reject)?;
        let reference = self
            .inner()
            .repo
            .clear_reference(&fuzzy, ResolveScope::Local, None)
            .map_err(|_| {
                reject_message(codes::NOT_INSTALLED, format!("{fuzzy} is not installed"))
            })?;

        let busy = self
            .inner()
            .is_ref_busy(&reference)
            .map_err(|err| reject_message(codes::IO_ERROR, err.to_string()))?;
        if busy {
            return Err(reject_message(
                codes::BUSY,
                "The application is currently running and cannot be uninstalled. \
                 Please close the application and try again.",
            )
            .notification());
        }

        let cur_module = Module::new(
            params
                .package
                .module
                .clone()
                .unwrap_or_else(|| Module::BINARY.to_string()),
        );
        let ref_spec =
            self.inner()
                .ref_spec(&self.inner().default_repo_name(), &reference, &cur_module);

        let inner = Arc::clone(self.inner());
        let task_ref = reference.clone();
        let task = self
            .inner()
            .engine
            .submit(vec![ref_spec], move |task| {
                if task.is_done() {
                    return;
                }
                inner.uninstall_task(task, &task_ref, &cur_module);
            })
            .map_err(reject)?;

        self.inner().sink.task_added(task.object_path());
        task.update_state(State::Queued, "queued to uninstall");
        Ok(TaskResult {
            task_object_path: task.object_path().to_string(),
            code: 0,
            message: format!("{reference} is now uninstalling"),
        })
    }
}

impl ManagerInner {
    pub(crate) fn uninstall_task(
        self: &Arc<Self>,
        task: &TaskHandle,
        reference: &Reference,
        module: &Module,
    ) {
        task.update_state(State::Processing, "start to uninstall package");
        task.update_sub_state(SubState::PreAction, "prepare uninstalling package");

        let mut removed_modules = vec![module.clone()];
        let mut tx = Transaction::new();

        if module.is_principal() {
            // Dropping the principal takes every other module with it, and
            // the application disappears from the desktop first.
            removed_modules = self.repo.module_list(reference);
            if let Err(err) = self.repo.unexport_reference(reference) {
                warn!(%reference, %err, "failed to unexport reference");
            }
            let inner = Arc::clone(self);
            let restore = reference.clone();
            tx.add_rollback(move || {
                if let Err(err) = inner.repo.export_reference(&restore) {
                    warn!(reference = %restore, %err, "failed to re-export during rollback");
                }
            });
        }

        self.uninstall_ref(task, reference, &removed_modules);
        if task.is_done() {
            return;
        }

        tx.commit();
        task.update_state(State::Succeed, format!("uninstall {reference} success"));

        if let Err(err) = self.repo.merge_modules() {
            error!(%err, "merge modules failed");
        }
    }

    /// Remove the given modules of `reference`; each removal records a
    /// rollback that re-pulls the layer and regenerates its caches.
    pub(crate) fn uninstall_ref(
        self: &Arc<Self>,
        task: &TaskHandle,
        reference: &Reference,
        modules: &[Module],
    ) {
        if task.is_done() {
            return;
        }
        task.update_sub_state(SubState::Uninstall, "remove layer files");

        let mut tx = Transaction::new();
        for module in modules {
            if module.is_principal() {
                self.remove_cache(reference);
            }
            if let Err(err) = self.repo.remove(reference, module, None) {
                task.fail(format!("failed to remove {reference}/{module}: {err}"));
                return;
            }

            let inner = Arc::clone(self);
            let restore_ref = reference.clone();
            let restore_module = module.clone();
            tx.add_rollback(move || {
                if let Err(err) =
                    inner
                        .repo
                        .pull(&SilentObserver, &restore_ref, &restore_module)
                {
                    error!(reference = %restore_ref, module = %restore_module, %err,
                        "failed to restore layer during rollback");
                    return;
                }
                if restore_module.is_principal() {
                    if let Err(err) = inner.generate_cache(&restore_ref) {
                        error!(reference = %restore_ref, %err,
                            "failed to regenerate cache during rollback");
                    }
                }
            });
        }

        tx.commit();
    }
}
