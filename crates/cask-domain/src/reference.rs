use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::info::PackageInfo;
use crate::version::Version;

/// CPU architecture tag carried by every installable reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Architecture(String);

impl Architecture {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains(['/', ':']) {
            return Err(Error::InvalidArgs(format!("invalid architecture '{raw}'")));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The architecture of the running host, using the repo's historical
    /// spellings where they differ from Rust's.
    #[must_use]
    pub fn host() -> Self {
        let name = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            "loongarch64" => "loong64",
            other => other,
        };
        Self(name.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully qualified installable identity.
///
/// The string form `channel:id/version/arch` is injective and is the key
/// used by the running-container state files and task ref-specs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub channel: String,
    pub id: String,
    pub version: Version,
    pub arch: Architecture,
}

impl Reference {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let fuzzy = FuzzyReference::parse(raw)?;
        let (Some(channel), Some(version), Some(arch)) =
            (fuzzy.channel.clone(), fuzzy.version.clone(), fuzzy.arch.clone())
        else {
            return Err(Error::InvalidArgs(format!(
                "'{raw}' is not a complete reference"
            )));
        };
        Ok(Self {
            channel,
            id: fuzzy.id,
            version,
            arch,
        })
    }

    /// Build the reference a layer's metadata describes.
    pub fn from_info(info: &PackageInfo) -> Result<Self, Error> {
        Ok(Self {
            channel: info.channel.clone(),
            id: info.id.clone(),
            version: Version::parse(&info.version)?,
            arch: Architecture::parse(&info.arch)?,
        })
    }

    /// Forget version and architecture, keeping the identity slots used to
    /// ask "what is the latest installed line of this application".
    #[must_use]
    pub fn to_fuzzy_latest(&self) -> FuzzyReference {
        FuzzyReference {
            channel: Some(self.channel.clone()),
            id: self.id.clone(),
            version: None,
            arch: Some(self.arch.clone()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.channel, self.id, self.version, self.arch
        )
    }
}

/// A partially specified identity used to query local or remote state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzyReference {
    pub channel: Option<String>,
    pub id: String,
    pub version: Option<Version>,
    pub arch: Option<Architecture>,
}

impl FuzzyReference {
    pub fn new(
        channel: Option<String>,
        id: impl Into<String>,
        version: Option<Version>,
        arch: Option<Architecture>,
    ) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidArgs("package id must not be empty".into()));
        }
        if id.contains(['/', ':']) {
            return Err(Error::InvalidArgs(format!("invalid package id '{id}'")));
        }
        Ok(Self {
            channel,
            id,
            version,
            arch,
        })
    }

    /// Parse `[channel:]id[/version[/arch]]`.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        let (channel, rest) = match trimmed.split_once(':') {
            Some((channel, rest)) => {
                if channel.is_empty() {
                    return Err(Error::InvalidArgs(format!("invalid reference '{raw}'")));
                }
                (Some(channel.to_string()), rest)
            }
            None => (None, trimmed),
        };

        let mut parts = rest.split('/');
        let id = parts.next().unwrap_or_default();
        let version = parts.next().map(Version::parse).transpose()?;
        let arch = parts.next().map(Architecture::parse).transpose()?;
        if parts.next().is_some() {
            return Err(Error::InvalidArgs(format!(
                "reference '{raw}' has trailing segments"
            )));
        }

        Self::new(channel, id, version, arch)
    }

    /// Whether a concrete reference satisfies every specified slot.
    #[must_use]
    pub fn matches(&self, reference: &Reference) -> bool {
        if self.id != reference.id {
            return false;
        }
        if let Some(channel) = &self.channel {
            if channel != &reference.channel {
                return false;
            }
        }
        if let Some(version) = &self.version {
            if version != &reference.version {
                return false;
            }
        }
        if let Some(arch) = &self.arch {
            if arch != &reference.arch {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for FuzzyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(channel) = &self.channel {
            write!(f, "{channel}:")?;
        }
        f.write_str(&self.id)?;
        if let Some(version) = &self.version {
            write!(f, "/{version}")?;
        }
        if let Some(arch) = &self.arch {
            if self.version.is_none() {
                f.write_str("/unknown")?;
            }
            write!(f, "/{arch}")?;
        }
        Ok(())
    }
}
