use serde::{Deserialize, Serialize};

use crate::error::Error;

/// What a layer contains, and therefore how the manager treats it.
///
/// Only `app` layers are exported to the desktop and get generated caches;
/// `base` and `runtime` layers exist to be depended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    App,
    Runtime,
    Base,
}

impl Kind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Runtime => "runtime",
            Self::Base => "base",
        }
    }
}

impl TryFrom<&str> for Kind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "app" => Ok(Self::App),
            "runtime" => Ok(Self::Runtime),
            "base" => Ok(Self::Base),
            other => Err(Error::LoadData(format!("unknown package kind '{other}'"))),
        }
    }
}

/// Metadata embedded in every layer (`info.json` at the layer root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub kind: Kind,
    pub id: String,
    pub name: String,
    pub channel: String,
    pub version: String,
    pub arch: String,
    /// Module this layer realizes (`binary`, `develop`, ...).
    pub module: String,
    /// Fuzzy reference of the base this package runs on; empty for layers
    /// that are themselves a base.
    #[serde(default)]
    pub base: String,
    /// Fuzzy reference of an optional runtime dependency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Set on minified layers: the uuid of the bundle that owns them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_string_roundtrip() {
        for kind in [Kind::App, Kind::Runtime, Kind::Base] {
            assert_eq!(Kind::try_from(kind.as_str()).unwrap(), kind);
        }
        assert!(Kind::try_from("plugin").is_err());
    }

    #[test]
    fn info_deserializes_with_optional_fields_absent() {
        let raw = r#"{
            "kind": "app",
            "id": "org.example.editor",
            "name": "Editor",
            "channel": "stable",
            "version": "1.0.0",
            "arch": "x86_64",
            "module": "binary",
            "base": "org.example.base/23"
        }"#;
        let info: PackageInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.kind, Kind::App);
        assert!(info.runtime.is_none());
        assert!(info.uuid.is_none());
    }
}
