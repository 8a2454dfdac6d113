//! Matrix expansion: channel axes to concrete build shards
//!
//! platforms × architectures × (targets, or one implicit target), minus
//! exclusions, plus derived shards that consume other shards' artifacts.

use crate::core::config::{ChannelConfig, MatrixConfig, ShardSelector};
use crate::core::error::{ConfigError, RailError, RailResult};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Identity of one build shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ShardKey {
  pub channel: String,
  pub platform: String,
  pub arch: String,
  pub target: Option<String>,
}

impl ShardKey {
  pub fn new(channel: &str, platform: &str, arch: &str, target: Option<&str>) -> Self {
    Self {
      channel: channel.to_string(),
      platform: platform.to_string(),
      arch: arch.to_string(),
      target: target.map(str::to_string),
    }
  }

  /// Channel-local name: `platform-arch[-target]`
  pub fn shard_name(&self) -> String {
    match &self.target {
      Some(target) => format!("{}-{}-{}", self.platform, self.arch, target),
      None => format!("{}-{}", self.platform, self.arch),
    }
  }

  /// A selector without a target matches every target
  pub fn matches(&self, selector: &ShardSelector) -> bool {
    self.platform == selector.platform
      && self.arch == selector.architecture
      && match &selector.target {
        None => true,
        Some(t) => self.target.as_deref() == Some(t.as_str()),
      }
  }
}

impl fmt::Display for ShardKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.channel, self.shard_name())
  }
}

/// A shard together with its scheduling attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shard {
  pub key: ShardKey,
  /// Shards whose artifacts this one consumes (derived shards only)
  pub requires: Vec<ShardKey>,
  /// Whether the channel can be aggregated without this shard
  pub required: bool,
  pub derived: bool,
}

/// All shards of one channel, base shards first in axis order
#[derive(Debug, Clone, Serialize)]
pub struct ShardMatrix {
  pub channel: String,
  pub shards: Vec<Shard>,
}

impl ShardMatrix {
  /// Expand a channel's matrix
  pub fn expand(channel: &ChannelConfig) -> RailResult<Self> {
    let matrix = &channel.matrix;
    check_axis(&channel.name, "platforms", &matrix.platforms)?;
    check_axis(&channel.name, "architectures", &matrix.architectures)?;
    check_axis(&channel.name, "targets", &matrix.targets)?;

    let mut shards: Vec<Shard> = base_keys(&channel.name, matrix)
      .into_iter()
      .map(|key| Shard {
        required: !matrix.optional.iter().any(|s| key.matches(s)),
        key,
        requires: Vec::new(),
        derived: false,
      })
      .collect();

    let mut seen: HashSet<ShardKey> = shards.iter().map(|s| s.key.clone()).collect();

    for derived in &matrix.derived {
      let key = ShardKey::new(
        &channel.name,
        &derived.platform,
        &derived.architecture,
        derived.target.as_deref(),
      );

      let mut requires = Vec::new();
      for selector in &derived.requires {
        let found: Vec<ShardKey> = shards
          .iter()
          .filter(|s| !s.derived && s.key.matches(selector))
          .map(|s| s.key.clone())
          .collect();
        if found.is_empty() {
          return Err(RailError::Config(ConfigError::InvalidField {
            field: format!("channels.{}.matrix.derived", channel.name),
            reason: format!(
              "{} requires {}-{} which is not in the matrix",
              key.shard_name(),
              selector.platform,
              selector.architecture
            ),
          }));
        }
        requires.extend(found);
      }

      if !seen.insert(key.clone()) {
        return Err(RailError::Config(ConfigError::InvalidField {
          field: format!("channels.{}.matrix.derived", channel.name),
          reason: format!("shard {} is defined twice", key.shard_name()),
        }));
      }

      shards.push(Shard {
        key,
        requires,
        required: !derived.optional,
        derived: true,
      });
    }

    Ok(Self {
      channel: channel.name.clone(),
      shards,
    })
  }

  pub fn len(&self) -> usize {
    self.shards.len()
  }

  pub fn is_empty(&self) -> bool {
    self.shards.is_empty()
  }

  pub fn get(&self, key: &ShardKey) -> Option<&Shard> {
    self.shards.iter().find(|s| &s.key == key)
  }

  /// Keys the aggregator must see succeed
  pub fn required_keys(&self) -> Vec<ShardKey> {
    self.shards.iter().filter(|s| s.required).map(|s| s.key.clone()).collect()
  }
}

fn check_axis(channel: &str, axis: &str, values: &[String]) -> RailResult<()> {
  let mut seen = HashSet::new();
  for value in values {
    if !seen.insert(value.as_str()) {
      return Err(RailError::Config(ConfigError::InvalidField {
        field: format!("channels.{}.matrix.{}", channel, axis),
        reason: format!("'{}' is listed twice", value),
      }));
    }
  }
  Ok(())
}

/// Cartesian product in axis order, exclusions removed
fn base_keys(channel: &str, matrix: &MatrixConfig) -> Vec<ShardKey> {
  let targets: Vec<Option<&str>> = if matrix.targets.is_empty() {
    vec![None]
  } else {
    matrix.targets.iter().map(|t| Some(t.as_str())).collect()
  };

  let mut keys = Vec::new();
  for platform in &matrix.platforms {
    for arch in &matrix.architectures {
      for target in &targets {
        let key = ShardKey::new(channel, platform, arch, *target);
        if !matrix.exclude.iter().any(|e| key.matches(e)) {
          keys.push(key);
        }
      }
    }
  }
  keys
}
