use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};

use cask_core::PackageManager;
use cask_domain::api::{
    CommonOptions, CommonResult, InstallParameters, InteractionReply, RepoConfig,
    SearchParameters, UninstallParameters, UpdateParameters,
};
use cask_domain::codes;

/// Method dispatch for the RPC boundary: the transport hands in a method
/// name and its parameters, and gets the reply document back. Everything
/// bus-specific (marshalling, signatures, object registration) stays on
/// the transport's side.
pub struct Service {
    pm: PackageManager,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallFromFileParameters {
    path: PathBuf,
    file_type: String,
    #[serde(default)]
    options: CommonOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyInteractionParameters {
    object_path: String,
    reply: InteractionReply,
}

fn invalid_args(err: impl std::fmt::Display) -> Value {
    reply_value(&CommonResult {
        code: codes::INVALID_ARGS,
        message: format!("invalid arguments: {err}"),
        reply_type: Default::default(),
    })
}

fn reply_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("reply types serialize")
}

impl Service {
    pub fn new(pm: PackageManager) -> Self {
        Self { pm }
    }

    pub fn package_manager(&self) -> &PackageManager {
        &self.pm
    }

    /// Handle one method call. Unknown methods report `NotSupported`.
    pub fn dispatch(&self, method: &str, params: Value) -> Value {
        match method {
            "Install" => match serde_json::from_value::<InstallParameters>(params) {
                Ok(params) => match self.pm.install(params) {
                    Ok(result) => reply_value(&result),
                    Err(reject) => reply_value(&reject),
                },
                Err(err) => invalid_args(err),
            },
            "InstallFromFile" => {
                match serde_json::from_value::<InstallFromFileParameters>(params) {
                    Ok(params) => match self.pm.install_from_file(
                        &params.path,
                        &params.file_type,
                        params.options,
                    ) {
                        Ok(result) => reply_value(&result),
                        Err(reject) => reply_value(&reject),
                    },
                    Err(err) => invalid_args(err),
                }
            }
            "Uninstall" => match serde_json::from_value::<UninstallParameters>(params) {
                Ok(params) => match self.pm.uninstall(params) {
                    Ok(result) => reply_value(&result),
                    Err(reject) => reply_value(&reject),
                },
                Err(err) => invalid_args(err),
            },
            "Update" => match serde_json::from_value::<UpdateParameters>(params) {
                Ok(params) => match self.pm.update(params) {
                    Ok(result) => reply_value(&result),
                    Err(reject) => reply_value(&reject),
                },
                Err(err) => invalid_args(err),
            },
            "Search" => match serde_json::from_value::<SearchParameters>(params) {
                Ok(params) => match self.pm.search(params) {
                    Ok(job) => reply_value(&job),
                    Err(reject) => reply_value(&reject),
                },
                Err(err) => invalid_args(err),
            },
            "Prune" => reply_value(&self.pm.prune()),
            "GenerateCache" => match params.get("reference").and_then(Value::as_str) {
                Some(reference) => match self.pm.generate_cache(reference) {
                    Ok(job) => reply_value(&job),
                    Err(reject) => reply_value(&reject),
                },
                None => invalid_args("missing reference"),
            },
            "ReplyInteraction" => {
                match serde_json::from_value::<ReplyInteractionParameters>(params) {
                    Ok(params) => {
                        self.pm.reply_interaction(&params.object_path, params.reply);
                        json!({ "code": codes::SUCCESS, "message": "" })
                    }
                    Err(err) => invalid_args(err),
                }
            }
            "GetConfiguration" => reply_value(&self.pm.get_configuration()),
            "SetConfiguration" => match serde_json::from_value::<RepoConfig>(params) {
                Ok(config) => match self.pm.set_configuration(config) {
                    Ok(()) => json!({ "code": codes::SUCCESS, "message": "" }),
                    Err(reject) => reply_value(&reject),
                },
                Err(err) => invalid_args(err),
            },
            other => reply_value(&CommonResult {
                code: codes::NOT_SUPPORTED,
                message: format!("{other} is not a known method"),
                reply_type: Default::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cask_core::{CommandCacheRunner, NullSink, PackageManager};
    use cask_repo::{DirRemote, Repo, RepoLayout};

    fn service() -> (tempfile::TempDir, Service) {
        let root = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(root.path().join("repo"), root.path().join("run"));
        let remote = DirRemote::new(root.path().join("remote"));
        let repo = Arc::new(Repo::open(layout, Box::new(remote)).unwrap());
        let pm = PackageManager::new(
            repo,
            Box::new(CommandCacheRunner::from_env()),
            Arc::new(NullSink),
        );
        (root, Service::new(pm))
    }

    #[test]
    fn unknown_method_is_not_supported() {
        let (_root, service) = service();
        let reply = service.dispatch("Frobnicate", json!({}));
        assert_eq!(reply["code"], codes::NOT_SUPPORTED);
    }

    #[test]
    fn malformed_parameters_are_invalid_args() {
        let (_root, service) = service();
        let reply = service.dispatch("Install", json!({ "package": 42 }));
        assert_eq!(reply["code"], codes::INVALID_ARGS);
    }

    #[test]
    fn get_configuration_reports_default_repo() {
        let (_root, service) = service();
        let reply = service.dispatch("GetConfiguration", json!({}));
        assert_eq!(reply["defaultRepo"], "main");
    }

    #[test]
    fn install_of_unknown_package_reports_not_found() {
        let (_root, service) = service();
        let reply = service.dispatch(
            "Install",
            json!({ "package": { "id": "org.example.absent" } }),
        );
        assert_eq!(reply["code"], codes::NOT_FOUND);
    }

    #[test]
    fn set_configuration_round_trips() {
        let (_root, service) = service();
        let mut config = service.package_manager().get_configuration();
        config
            .repos
            .insert("mirror".into(), "file:///srv/mirror".into());
        let reply = service.dispatch("SetConfiguration", reply_value(&config));
        assert_eq!(reply["code"], codes::SUCCESS);
        assert_eq!(
            service.package_manager().get_configuration().repos["mirror"],
            "file:///srv/mirror"
        );
    }
}
