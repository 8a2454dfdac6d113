//! Release version type and tag naming

use crate::core::config::VersionField;
use crate::core::error::{RailError, RailResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A released version: `major.minor.patch[-pre]`
///
/// Ordered by (major, minor, patch); for an equal triple a pre-release sorts
/// before the plain release. Build metadata is not part of a release version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReleaseVersion {
  pub major: u64,
  pub minor: u64,
  pub patch: u64,
  pub pre: Option<String>,
}

impl ReleaseVersion {
  pub fn new(major: u64, minor: u64, patch: u64) -> Self {
    Self {
      major,
      minor,
      patch,
      pre: None,
    }
  }

  pub fn with_pre(mut self, label: impl Into<String>) -> Self {
    let label = label.into();
    self.pre = if label.is_empty() { None } else { Some(label) };
    self
  }

  /// Value written for a manifest field
  pub fn field(&self, field: VersionField) -> String {
    match field {
      VersionField::Full => self.to_string(),
      VersionField::Major => self.major.to_string(),
      VersionField::Minor => self.minor.to_string(),
      VersionField::Patch => self.patch.to_string(),
    }
  }

  /// Tag name with the configured prefix
  pub fn tag(&self, prefix: &str) -> String {
    format!("{}{}", prefix, self)
  }

  /// Parse a tag name carrying `prefix`; other tags yield None
  pub fn from_tag(tag: &str, prefix: &str) -> Option<Self> {
    tag.strip_prefix(prefix)?.parse().ok()
  }
}

impl Ord for ReleaseVersion {
  fn cmp(&self, other: &Self) -> Ordering {
    (self.major, self.minor, self.patch)
      .cmp(&(other.major, other.minor, other.patch))
      .then_with(|| match (&self.pre, &other.pre) {
        (None, None) => Ordering::Equal,
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (Some(a), Some(b)) => compare_prerelease(a, b),
      })
  }
}

impl PartialOrd for ReleaseVersion {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// Semver pre-release precedence; falls back to string order when unparsable
fn compare_prerelease(a: &str, b: &str) -> Ordering {
  match (semver::Prerelease::new(a), semver::Prerelease::new(b)) {
    (Ok(pa), Ok(pb)) => pa.cmp(&pb),
    _ => a.cmp(b),
  }
}

impl fmt::Display for ReleaseVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
    if let Some(pre) = &self.pre {
      write!(f, "-{}", pre)?;
    }
    Ok(())
  }
}

impl FromStr for ReleaseVersion {
  type Err = RailError;

  fn from_str(s: &str) -> RailResult<Self> {
    let parsed = semver::Version::parse(s.trim())?;
    Ok(Self::from(parsed))
  }
}

impl From<semver::Version> for ReleaseVersion {
  fn from(v: semver::Version) -> Self {
    let pre = if v.pre.is_empty() { None } else { Some(v.pre.to_string()) };
    Self {
      major: v.major,
      minor: v.minor,
      patch: v.patch,
      pre,
    }
  }
}

impl Serialize for ReleaseVersion {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for ReleaseVersion {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(serde::de::Error::custom)
  }
}
