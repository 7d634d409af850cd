use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A named slice of a package (`binary`, `runtime`, `develop`, ...).
///
/// `binary` and `runtime` are two historical names for the principal
/// module; they compare equal and hash identically. The name the caller
/// used is kept for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Module(String);

impl Module {
    pub const BINARY: &'static str = "binary";
    pub const RUNTIME: &'static str = "runtime";

    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn binary() -> Self {
        Self(Self::BINARY.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name used for equality: `runtime` collapses onto `binary`.
    #[must_use]
    pub fn canonical(&self) -> &str {
        if self.0 == Self::RUNTIME {
            Self::BINARY
        } else {
            &self.0
        }
    }

    /// Whether this module owns the application's existence.
    #[must_use]
    pub fn is_principal(&self) -> bool {
        self.0 == Self::BINARY || self.0 == Self::RUNTIME
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Module {}

impl Hash for Module {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Module {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
