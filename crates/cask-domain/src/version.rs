use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A package version.
///
/// Versions are dotted strings (`1.2.0`, `23.1`, `20`). Ordering is
/// lexicographic over the dotted segments, which keeps comparison total
/// without imposing a numeric scheme on channels that never adopted one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidArgs("version must not be empty".into()));
        }
        if trimmed.split('.').any(|seg| seg.is_empty()) {
            return Err(Error::InvalidArgs(format!(
                "version '{raw}' contains an empty segment"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(other.segments())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(raw: &str) -> Version {
        Version::parse(raw).unwrap()
    }

    #[test]
    fn ordering_is_segment_lexicographic() {
        assert!(v("1.0.0") < v("1.1.0"));
        assert!(v("1.1.0") < v("2.0.0"));
        assert!(v("20") < v("23"));
        assert_eq!(v("1.0.0"), v("1.0.0"));
    }

    #[test]
    fn longer_version_with_equal_prefix_orders_after() {
        assert!(v("1.0") < v("1.0.1"));
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1..0").is_err());
        assert!(Version::parse(".1").is_err());
    }
}
