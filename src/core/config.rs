use crate::core::error::{ConfigError, RailError, RailResult, ResultExt};
use crate::pipeline::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for release-rail
/// Searched in order: rail.toml, .rail.toml, .config/rail.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailConfig {
  #[serde(default)]
  pub release: ReleaseSettings,
  #[serde(default)]
  pub manifests: Vec<ManifestPattern>,
  #[serde(default)]
  pub channels: Vec<ChannelConfig>,
  #[serde(default)]
  pub retry: RetryConfig,
}

/// Mainline, tagging and bookkeeping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSettings {
  /// Prefix in front of the version in tag names (default: "v")
  #[serde(default = "default_tag_prefix")]
  pub tag_prefix: String,

  /// Branch releases are cut from (default: "main")
  #[serde(default = "default_mainline")]
  pub mainline: String,

  /// Remote to push the release commit and tag to. Local-only when unset.
  #[serde(default)]
  pub remote: Option<String>,

  /// Long-lived branch rebased onto mainline after every release
  #[serde(default)]
  pub secondary_branch: Option<String>,

  /// Release commit message; `{version}` and `{tag}` are substituted
  #[serde(default = "default_commit_message")]
  pub commit_message: String,

  /// Version assumed when no release tag exists yet
  #[serde(default = "default_initial_version")]
  pub initial_version: String,

  /// Pre-release label attached to every resolved version (e.g. "rc.1")
  #[serde(default)]
  pub prerelease: Option<String>,

  /// Parallel job workers
  #[serde(default = "default_workers")]
  pub workers: usize,

  /// Directory for the release log, publish ledger and staging sets
  #[serde(default = "default_state_dir")]
  pub state_dir: PathBuf,
}

fn default_tag_prefix() -> String {
  "v".to_string()
}

fn default_mainline() -> String {
  "main".to_string()
}

fn default_commit_message() -> String {
  "build: release {version} [skip ci]".to_string()
}

fn default_initial_version() -> String {
  "0.0.0".to_string()
}

fn default_workers() -> usize {
  4
}

fn default_state_dir() -> PathBuf {
  PathBuf::from(".rail")
}

impl Default for ReleaseSettings {
  fn default() -> Self {
    Self {
      tag_prefix: default_tag_prefix(),
      mainline: default_mainline(),
      remote: None,
      secondary_branch: None,
      commit_message: default_commit_message(),
      initial_version: default_initial_version(),
      prerelease: None,
      workers: default_workers(),
      state_dir: default_state_dir(),
    }
  }
}

impl ReleaseSettings {
  pub fn validate(&self) -> RailResult<()> {
    if self.workers == 0 {
      return Err(RailError::Config(ConfigError::InvalidField {
        field: "release.workers".to_string(),
        reason: "must be at least 1".to_string(),
      }));
    }

    if self.mainline.trim().is_empty() {
      return Err(RailError::Config(ConfigError::MissingField {
        field: "release.mainline".to_string(),
      }));
    }

    if self.secondary_branch.as_deref() == Some(self.mainline.as_str()) {
      return Err(RailError::Config(ConfigError::InvalidField {
        field: "release.secondary_branch".to_string(),
        reason: "must differ from the mainline".to_string(),
      }));
    }

    if semver::Version::parse(&self.initial_version).is_err() {
      return Err(RailError::Config(ConfigError::InvalidField {
        field: "release.initial_version".to_string(),
        reason: format!("'{}' is not a semantic version", self.initial_version),
      }));
    }

    Ok(())
  }

  /// Path of the JSON release log
  pub fn release_log_path(&self, root: &Path) -> PathBuf {
    root.join(&self.state_dir).join("releases.json")
  }

  /// Path of the registry publish ledger
  pub fn ledger_path(&self, root: &Path) -> PathBuf {
    root.join(&self.state_dir).join("publish-ledger.json")
  }

  /// Root of the per-channel staging directories
  pub fn staging_root(&self, root: &Path) -> PathBuf {
    root.join(&self.state_dir).join("staging")
  }

  /// Root of the per-shard build output directories
  pub fn build_root(&self, root: &Path) -> PathBuf {
    root.join(&self.state_dir).join("build")
  }
}

/// Which part of the version a manifest pattern receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionField {
  Full,
  Major,
  Minor,
  Patch,
}

/// One version location in a manifest file
///
/// ```toml
/// [[manifests]]
/// file = "include/lib/lib.h"
/// pattern = '#define LIB_VERSION_MAJOR (?P<version>\d+)'
/// field = "major"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPattern {
  /// File path relative to the repository root
  pub file: PathBuf,

  /// Regex locating the version; the `version` group (or group 1) is replaced
  pub pattern: String,

  /// Value written into the located region
  #[serde(default = "default_field")]
  pub field: VersionField,
}

fn default_field() -> VersionField {
  VersionField::Full
}

/// Whether a channel uploads or only validates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishMode {
  #[default]
  DryRun,
  Publish,
}

/// A (platform, architecture[, target]) selector used by exclusions,
/// optional-shard lists and derived shard prerequisites
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSelector {
  pub platform: String,
  pub architecture: String,
  /// Matches every target when unset
  #[serde(default)]
  pub target: Option<String>,
}

/// Extra shard built from other shards of the same channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedShardConfig {
  pub platform: String,
  pub architecture: String,
  #[serde(default)]
  pub target: Option<String>,
  /// Prerequisite shards whose artifacts feed this one
  pub requires: Vec<ShardSelector>,
  /// A failed optional shard does not block the channel
  #[serde(default)]
  pub optional: bool,
}

/// Matrix axes of a channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
  pub platforms: Vec<String>,
  pub architectures: Vec<String>,
  /// Target-version axis; a single implicit target when empty
  #[serde(default)]
  pub targets: Vec<String>,
  #[serde(default)]
  pub exclude: Vec<ShardSelector>,
  /// Shards whose failure does not block aggregation
  #[serde(default)]
  pub optional: Vec<ShardSelector>,
  #[serde(default)]
  pub derived: Vec<DerivedShardConfig>,
}

/// One distribution channel
///
/// Command templates understand `{version}`, `{platform}`, `{arch}`,
/// `{target}`, `{out_dir}` and, for uploads, `{artifacts}` (expands to one
/// argument per staged file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
  pub name: String,

  /// Registry identity (e.g. "pypi", "npm", "crates-io")
  pub registry: String,

  #[serde(default)]
  pub mode: PublishMode,

  /// Name of the environment variable holding this channel's token
  #[serde(default)]
  pub credential: Option<String>,

  pub matrix: MatrixConfig,

  /// Build command run once per shard
  pub build: Vec<String>,

  /// Globs (relative to the shard output dir) selecting produced artifacts
  #[serde(default = "default_artifact_globs")]
  pub artifacts: Vec<String>,

  /// Per-shard time budget
  #[serde(default, with = "humantime_serde")]
  pub timeout: Option<Duration>,

  /// Upload command run once with the staged artifact set
  #[serde(default)]
  pub upload: Vec<String>,

  /// Environment variable the upload command reads the token from
  #[serde(default)]
  pub upload_token_env: Option<String>,

  /// Optional command exiting 0 when `{version}` is already on the registry
  #[serde(default)]
  pub published_check: Vec<String>,

  /// Extra variables passed to build commands (never credentials)
  #[serde(default)]
  pub build_env: Vec<String>,
}

fn default_artifact_globs() -> Vec<String> {
  vec!["*".to_string()]
}

impl ChannelConfig {
  pub fn validate(&self) -> RailResult<()> {
    if self.matrix.platforms.is_empty() || self.matrix.architectures.is_empty() {
      return Err(RailError::with_help(
        format!("Channel '{}' needs at least one platform and one architecture", self.name),
        "Fill in [channels.matrix] platforms and architectures",
      ));
    }

    if self.build.is_empty() {
      return Err(RailError::Config(ConfigError::MissingField {
        field: format!("build command for channel '{}'", self.name),
      }));
    }

    if self.mode == PublishMode::Publish && self.upload.is_empty() {
      return Err(RailError::Config(ConfigError::MissingField {
        field: format!("upload command for publishing channel '{}'", self.name),
      }));
    }

    if self.upload_token_env.is_some() && self.credential.is_none() {
      return Err(RailError::Config(ConfigError::InvalidField {
        field: format!("channels.{}.upload_token_env", self.name),
        reason: "set `credential` to the variable holding the token".to_string(),
      }));
    }

    let secrets = [self.credential.as_deref(), self.upload_token_env.as_deref()];
    if let Some(leak) = self.build_env.iter().find(|name| secrets.contains(&Some(name.as_str()))) {
      return Err(RailError::Config(ConfigError::InvalidField {
        field: format!("channels.{}.build_env", self.name),
        reason: format!("'{}' holds the channel credential and cannot reach build shards", leak),
      }));
    }

    for pattern in &self.artifacts {
      glob::Pattern::new(pattern).with_context(|| format!("Channel '{}' artifact glob", self.name))?;
    }

    Ok(())
  }
}

impl RailConfig {
  /// Find config file in search order: rail.toml, .rail.toml, .config/rail.toml
  pub fn find_config_path(path: &Path) -> Option<PathBuf> {
    let candidates = vec![
      path.join("rail.toml"),
      path.join(".rail.toml"),
      path.join(".config").join("rail.toml"),
    ];

    candidates.into_iter().find(|p| p.exists())
  }

  /// Load config from rail.toml (searches multiple locations)
  pub fn load(path: &Path) -> RailResult<Self> {
    let config_path = Self::find_config_path(path).ok_or_else(|| {
      RailError::Config(ConfigError::NotFound {
        workspace_root: path.to_path_buf(),
      })
    })?;

    let content = fs::read_to_string(&config_path)
      .with_context(|| format!("Failed to read config from {}", config_path.display()))?;

    Self::parse(&content).with_context(|| format!("Invalid configuration in {}", config_path.display()))
  }

  /// Parse and validate configuration text
  pub fn parse(content: &str) -> RailResult<Self> {
    let config: RailConfig = toml_edit::de::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> RailResult<()> {
    self.release.validate()?;
    self.retry.validate()?;

    if !self.manifests.iter().any(|m| m.field == VersionField::Full) {
      return Err(RailError::Config(ConfigError::MissingField {
        field: "[[manifests]] entry with field = \"full\"".to_string(),
      }));
    }

    for manifest in &self.manifests {
      regex::Regex::new(&manifest.pattern)
        .with_context(|| format!("Manifest pattern for {}", manifest.file.display()))?;
    }

    let mut seen = HashSet::new();
    for channel in &self.channels {
      if !seen.insert(channel.name.as_str()) {
        return Err(RailError::Config(ConfigError::InvalidField {
          field: "channels".to_string(),
          reason: format!("channel '{}' is defined twice", channel.name),
        }));
      }
      channel.validate()?;
    }

    // No build shard may see any channel's token
    let secrets: HashSet<&str> = self
      .channels
      .iter()
      .flat_map(|c| [c.credential.as_deref(), c.upload_token_env.as_deref()])
      .flatten()
      .collect();
    for channel in &self.channels {
      if let Some(leak) = channel.build_env.iter().find(|name| secrets.contains(name.as_str())) {
        return Err(RailError::Config(ConfigError::InvalidField {
          field: format!("channels.{}.build_env", channel.name),
          reason: format!("'{}' holds a channel credential and cannot reach build shards", leak),
        }));
      }
    }

    Ok(())
  }

  /// Find a channel by name
  pub fn channel(&self, name: &str) -> RailResult<&ChannelConfig> {
    self
      .channels
      .iter()
      .find(|c| c.name == name)
      .ok_or_else(|| RailError::Config(ConfigError::ChannelNotFound { name: name.to_string() }))
  }
}
