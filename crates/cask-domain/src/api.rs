//! Wire types crossing the RPC boundary.
//!
//! Serialization format is the transport's concern; these types define the
//! field names and shapes it must carry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{codes, Error};
use crate::info::PackageInfo;
use crate::reference::FuzzyReference;
use crate::version::Version;

/// Options shared by the install entry points.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommonOptions {
    pub force: bool,
    pub skip_interaction: bool,
}

/// One package slot in install/uninstall/update parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl PackageRequest {
    pub fn to_fuzzy(&self) -> Result<FuzzyReference, Error> {
        let version = self.version.as_deref().map(Version::parse).transpose()?;
        FuzzyReference::new(self.channel.clone(), self.id.clone(), version, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallParameters {
    pub package: PackageRequest,
    #[serde(default)]
    pub options: CommonOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallParameters {
    pub package: PackageRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParameters {
    pub packages: Vec<PackageRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParameters {
    pub id: String,
}

/// How the client should surface a failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyType {
    #[default]
    Display,
    Notification,
}

/// Synchronous reply for methods that do not start a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonResult {
    pub code: i32,
    pub message: String,
    #[serde(rename = "type", default)]
    pub reply_type: ReplyType,
}

impl CommonResult {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: codes::SUCCESS,
            message: message.into(),
            reply_type: ReplyType::Display,
        }
    }

    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            reply_type: ReplyType::Display,
        }
    }

    #[must_use]
    pub fn notification(mut self) -> Self {
        self.reply_type = ReplyType::Notification;
        self
    }
}

/// Reply for methods that enqueued a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_object_path: String,
    pub code: i32,
    pub message: String,
}

/// Reply for methods that started an asynchronous job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub packages: Vec<PackageInfo>,
    pub code: i32,
    pub message: String,
}

/// What an interactive prompt is asking the user about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionMessageType {
    Install,
    Upgrade,
    Downgrade,
    Uninstall,
}

/// Context shipped with a `RequestInteraction` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InteractionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<String>,
}

/// The caller's answer to a pending interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionReply {
    pub action: String,
}

impl InteractionReply {
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.action == "yes"
    }
}

/// One JSON state file per live container under `<run-root>/<user>/<pid>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateInfo {
    /// Reference string of the application the container runs.
    pub app: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// Persisted repo configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    pub version: u32,
    pub default_repo: String,
    /// Repo name to remote location.
    pub repos: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_when_absent() {
        let params: InstallParameters =
            serde_json::from_str(r#"{"package": {"id": "org.example.editor"}}"#).unwrap();
        assert!(!params.options.force);
        assert!(!params.options.skip_interaction);
        assert_eq!(params.package.id, "org.example.editor");
    }

    #[test]
    fn reply_type_serializes_as_type_field() {
        let result = CommonResult::ok("done").notification();
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["type"], "notification");
    }

    #[test]
    fn interaction_reply_accepts_only_yes() {
        assert!(InteractionReply {
            action: "yes".into()
        }
        .accepted());
        assert!(!InteractionReply {
            action: "no".into()
        }
        .accepted());
    }
}
