use std::path::Path;
use std::sync::Arc;

use tracing::error;

use cask_domain::api::{
    CommonOptions, CommonResult, InteractionContext, InteractionMessageType, TaskResult,
};
use cask_domain::{codes, Architecture, Kind, Module, PackageInfo, Reference};
use cask_repo::ResolveScope;

use crate::bundle::{LayerFile, UabFile};
use crate::manager::{reject, reject_message, PackageManager};
use crate::task::{State, SubState, WaitOutcome};
use crate::transaction::Transaction;

fn ensure_host_arch(info: &PackageInfo) -> Result<(), CommonResult> {
    let host = Architecture::host();
    if info.arch != host.as_str() {
        return Err(reject_message(
            codes::ARCH_MISMATCH,
            format!(
                "package architecture {} does not match host architecture {host}",
                info.arch
            ),
        ));
    }
    Ok(())
}

impl PackageManager {
    /// Install from a local package file. `file_type` picks the flavor:
    /// a single `.layer` or a multi-layer `.uab` bundle.
    pub fn install_from_file(
        &self,
        path: &Path,
        file_type: &str,
        options: CommonOptions,
    ) -> Result<TaskResult, CommonResult> {
        match file_type {
            "layer" => self.install_from_layer_file(path, options),
            "uab" => self.install_from_uab(path, options),
            other => Err(reject_message(
                codes::NOT_SUPPORTED,
                format!("{other} is an unsupported file type"),
            )),
        }
    }

    /// Shared upgrade/downgrade decision for file installs: which prompt to
    /// show, and which installed reference the file replaces.
    fn file_install_decision(
        &self,
        new_ref: &Reference,
        module: &Module,
        force: bool,
        artifact: &str,
    ) -> Result<(InteractionMessageType, Option<Reference>), CommonResult> {
        let fuzzy = cask_domain::FuzzyReference::new(None, new_ref.id.clone(), None, None)
            .map_err(reject)?;
        let local_ref = self
            .inner()
            .repo
            .clear_reference(&fuzzy, ResolveScope::Local, None)
            .ok()
            .filter(|local| {
                self.inner()
                    .repo
                    .layer_dir(local, Some(module), None)
                    .is_ok()
            });

        let Some(local) = local_ref else {
            return Ok((InteractionMessageType::Install, None));
        };

        if new_ref.version == local.version {
            return Err(reject_message(
                codes::ALREADY_INSTALLED,
                format!("{local} is already installed"),
            ));
        }
        if new_ref.version > local.version {
            return Ok((InteractionMessageType::Upgrade, Some(local)));
        }
        if !force {
            return Err(reject_message(
                codes::ALREADY_INSTALLED,
                format!(
                    "The latest version has been installed. If you want to replace it, \
                     try using 'cask install {artifact} --force'"
                ),
            ));
        }
        Ok((InteractionMessageType::Install, Some(local)))
    }

    fn install_from_layer_file(
        &self,
        path: &Path,
        options: CommonOptions,
    ) -> Result<TaskResult, CommonResult> {
        let layer = LayerFile::open(path)
            .map_err(|err| reject_message(codes::LOAD_DATA_FAILED, err.to_string()))?;
        let info = layer.info().clone();
        let module = Module::new(info.module.clone());
        if !module.is_principal() {
            return Err(reject_message(
                codes::NOT_SUPPORTED,
                "installing extra modules from a layer file is not supported",
            ));
        }
        ensure_host_arch(&info)?;

        let new_ref = Reference::from_info(&info).map_err(reject)?;
        let artifact = format!(
            "{}_{}_{}_{}.layer",
            new_ref.id, new_ref.version, new_ref.arch, module
        );
        let (message_type, local_ref) =
            self.file_install_decision(&new_ref, &module, options.force, &artifact)?;

        let context = InteractionContext {
            local_ref: local_ref.as_ref().map(Reference::to_string),
            remote_ref: Some(new_ref.to_string()),
        };
        let ref_spec = self.inner().ref_spec("local", &new_ref, &module);
        let file_name = path.display().to_string();
        let skip_interaction = options.skip_interaction;
        let inner = Arc::clone(self.inner());

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

                task.update_state(State::Processing, "installing layer");
                task.update_sub_state(SubState::PreAction, "preparing environment");

                let mut tx = Transaction::new();
                // The unpacked tree lives as long as `layer`; it is released
                // when the closure returns, on every path.
                if let Err(err) = inner.repo.import_layer_dir(layer.dir(), &[], None) {
                    task.fail(format!("failed to import layer: {err}"));
                    return;
                }
                {
                    let inner = Arc::clone(&inner);
                    let reference = new_ref.clone();
                    let module = module.clone();
                    tx.add_rollback(move || {
                        if let Err(err) = inner.repo.remove(&reference, &module, None) {
                            error!(%reference, %err, "failed to roll back layer import");
                        }
                    });
                }

                inner.pull_dependency(task, &info, &module);
                if task.is_done() {
                    return;
                }

                if info.kind == Kind::App {
                    match &local_ref {
                        None => {
                            if let Err(err) = inner.repo.export_reference(&new_ref) {
                                task.fail(format!("failed to export {new_ref}: {err}"));
                                return;
                            }
                            if let Err(err) = inner.generate_cache(&new_ref) {
                                task.fail(format!("failed to generate cache: {err}"));
                                return;
                            }
                        }
                        Some(local) => {
                            if inner.repo.module_list(local).contains(&module) {
                                if let Err(err) = inner.generate_cache(&new_ref) {
                                    task.fail(format!("failed to generate cache: {err}"));
                                    return;
                                }
                                if let Err(err) =
                                    inner.remove_after_install(local, &new_ref, &[module.clone()])
                                {
                                    error!(old = %local, new = %new_ref, %err,
                                        "failed to retire old reference after layer install");
                                }
                            }
                        }
                    }
                }

                tx.commit();
                task.update_state(State::Succeed, "install layer successfully");
            })
            .map_err(reject)?;

        self.inner().sink.task_added(task.object_path());
        task.update_state(State::Queued, "queued to install from layer file");
        Ok(TaskResult {
            task_object_path: task.object_path().to_string(),
            code: 0,
            message: format!("{file_name} is now installing"),
        })
    }

    fn install_from_uab(
        &self,
        path: &Path,
        options: CommonOptions,
    ) -> Result<TaskResult, CommonResult> {
        let uab = UabFile::open(path)
            .map_err(|err| reject_message(codes::LOAD_DATA_FAILED, err.to_string()))?;
        uab.verify()
            .map_err(|err| reject_message(codes::VERIFICATION, err.to_string()))?;

        let mut layers = uab.meta().layers.clone();
        let app_pos = layers
            .iter()
            .position(|layer| layer.info.kind == Kind::App)
            .ok_or_else(|| {
                reject_message(
                    codes::LOAD_DATA_FAILED,
                    "couldn't find an application layer in this bundle",
                )
            })?;
        // The app layer installs first; its failure aborts the bundle
        // before any dependency layer lands.
        let app_layer = layers.remove(app_pos);
        layers.insert(0, app_layer.clone());

        ensure_host_arch(&app_layer.info)?;
        let app_ref = Reference::from_info(&app_layer.info).map_err(reject)?;
        let app_module = Module::new(app_layer.info.module.clone());
        let artifact = format!(
            "{}_{}_{}_{}.uab",
            app_ref.id, app_ref.version, app_ref.arch, app_module
        );
        let (message_type, local_ref) =
            self.file_install_decision(&app_ref, &app_module, options.force, &artifact)?;

        let context = InteractionContext {
            local_ref: local_ref.as_ref().map(Reference::to_string),
            remote_ref: Some(app_ref.to_string()),
        };
        let ref_spec = self.inner().ref_spec("local", &app_ref, &app_module);
        let file_name = path.display().to_string();
        let skip_interaction = options.skip_interaction;
        let inner = Arc::clone(self.inner());

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

                task.update_state(State::Processing, "installing bundle");
                task.update_sub_state(SubState::PreAction, "preparing environment");

                let uuid = uab.meta().uuid.clone();
                let mut tx = Transaction::new();
                for layer in &layers {
                    if task.is_done() {
                        return;
                    }

                    let layer_dir = uab.layer_dir(&layer.info);
                    let reference = match Reference::from_info(&layer.info) {
                        Ok(reference) => reference,
                        Err(err) => {
                            task.fail(err.to_string());
                            return;
                        }
                    };
                    let module = Module::new(layer.info.module.clone());

                    let is_app = layer.info.kind == Kind::App;
                    let mut overlays = Vec::new();
                    let mut sub_ref = layer.minified.then(|| uuid.clone());
                    if is_app {
                        // Minification is meaningless for the app layer
                        // itself; it only carries the signature overlay.
                        sub_ref = None;
                        if let Some(sign_dir) = uab.sign_data_dir() {
                            overlays.push(sign_dir);
                        }
                    } else {
                        // An identical dependency version that is already
                        // installed is reused as-is.
                        let already = inner
                            .repo
                            .layer_dir(&reference, Some(&module), None)
                            .is_ok();
                        if already {
                            continue;
                        }
                    }

                    if let Err(err) =
                        inner
                            .repo
                            .import_layer_dir(&layer_dir, &overlays, sub_ref.as_deref())
                    {
                        task.fail(format!(
                            "failed to import {}/{}: {err}",
                            layer.info.id, layer.info.module
                        ));
                        return;
                    }
                    let inner = Arc::clone(&inner);
                    let rollback_ref = reference.clone();
                    let rollback_module = module.clone();
                    tx.add_rollback(move || {
                        if let Err(err) = inner.repo.remove(
                            &rollback_ref,
                            &rollback_module,
                            sub_ref.as_deref(),
                        ) {
                            error!(reference = %rollback_ref, %err,
                                "failed to roll back bundle layer import");
                        }
                    });
                }
                if task.is_done() {
                    return;
                }

                if let Some(local) = &local_ref {
                    let modules = inner.repo.module_list(local);
                    if let Err(err) = inner.remove_after_install(local, &app_ref, &modules) {
                        error!(old = %local, new = %app_ref, %err,
                            "failed to retire old reference after bundle install");
                    }
                } else {
                    if let Err(err) = inner.repo.merge_modules() {
                        error!(%err, "merge modules failed");
                    }
                    if let Err(err) = inner.repo.export_reference(&app_ref) {
                        task.fail(format!("failed to export {app_ref}: {err}"));
                        return;
                    }
                    if let Err(err) = inner.generate_cache(&app_ref) {
                        task.fail(format!("failed to generate cache: {err}"));
                        return;
                    }
                }

                tx.commit();
                task.update_state(State::Succeed, "install bundle successfully");
            })
            .map_err(reject)?;

        self.inner().sink.task_added(task.object_path());
        task.update_state(State::Queued, "queued to install from bundle");
        Ok(TaskResult {
            task_object_path: task.object_path().to_string(),
            code: 0,
            message: format!("{file_name} is now installing"),
        })
    }
}
