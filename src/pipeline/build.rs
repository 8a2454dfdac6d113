//! Build shards: the procedure seam and the command-driven implementation
//!
//! A shard gets its own output directory and a context describing what to
//! build. Whatever the procedure leaves behind is hashed and recorded in the
//! artifact store under the shard key.

use crate::core::config::ChannelConfig;
use crate::core::error::{RailError, RailResult, ReleaseError, ResultExt};
use crate::pipeline::artifacts::{Artifact, ArtifactStore};
use crate::pipeline::matrix::ShardKey;
use crate::pipeline::process::run_command;
use crate::release::version::ReleaseVersion;
use crate::utils::render_template;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a build procedure may look at
#[derive(Debug, Clone)]
pub struct ShardContext {
  pub key: ShardKey,
  pub version: ReleaseVersion,
  /// Repository root (read-only for builds)
  pub source_dir: PathBuf,
  /// Empty directory owned by this shard
  pub out_dir: PathBuf,
  /// Artifacts of prerequisite shards (derived shards only)
  pub inputs: Vec<Artifact>,
}

/// Turns source into artifacts for one shard
pub trait BuildProcedure: Send + Sync {
  /// Build into `ctx.out_dir` and return the produced files
  fn build(&self, ctx: &ShardContext) -> RailResult<Vec<PathBuf>>;
}

/// Runs the channel's build command once per shard
///
/// The command sees `RAIL_VERSION`, `RAIL_PLATFORM`, `RAIL_ARCH`,
/// `RAIL_TARGET`, `RAIL_OUT_DIR` and `RAIL_INPUTS`, plus the channel's
/// `build_env` allow-list. Credentials are never passed.
#[derive(Debug, Clone)]
pub struct CommandBuild {
  argv: Vec<String>,
  artifact_globs: Vec<String>,
  timeout: Option<Duration>,
  passthrough: Vec<String>,
}

impl CommandBuild {
  pub fn new(argv: Vec<String>) -> Self {
    Self {
      argv,
      artifact_globs: vec!["*".to_string()],
      timeout: None,
      passthrough: Vec::new(),
    }
  }

  pub fn from_channel(channel: &ChannelConfig) -> Self {
    Self {
      argv: channel.build.clone(),
      artifact_globs: channel.artifacts.clone(),
      timeout: channel.timeout,
      passthrough: channel.build_env.clone(),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  fn env(&self, ctx: &ShardContext) -> RailResult<Vec<(String, String)>> {
    let inputs = std::env::join_paths(ctx.inputs.iter().map(|a| a.path.as_path()))
      .map_err(|e| RailError::message(format!("Invalid input artifact path: {}", e)))?;

    let mut env = vec![
      ("RAIL_VERSION".to_string(), ctx.version.to_string()),
      ("RAIL_CHANNEL".to_string(), ctx.key.channel.clone()),
      ("RAIL_PLATFORM".to_string(), ctx.key.platform.clone()),
      ("RAIL_ARCH".to_string(), ctx.key.arch.clone()),
      ("RAIL_TARGET".to_string(), ctx.key.target.clone().unwrap_or_default()),
      ("RAIL_OUT_DIR".to_string(), ctx.out_dir.to_string_lossy().to_string()),
      ("RAIL_INPUTS".to_string(), inputs.to_string_lossy().to_string()),
    ];
    for name in &self.passthrough {
      if let Ok(value) = std::env::var(name) {
        env.push((name.clone(), value));
      }
    }
    Ok(env)
  }
}

impl BuildProcedure for CommandBuild {
  fn build(&self, ctx: &ShardContext) -> RailResult<Vec<PathBuf>> {
    let version = ctx.version.to_string();
    let out_dir = ctx.out_dir.to_string_lossy().to_string();
    let target = ctx.key.target.clone().unwrap_or_default();
    let vars = [
      ("version", version.as_str()),
      ("platform", ctx.key.platform.as_str()),
      ("arch", ctx.key.arch.as_str()),
      ("target", target.as_str()),
      ("out_dir", out_dir.as_str()),
      ("channel", ctx.key.channel.as_str()),
    ];
    let argv: Vec<String> = self.argv.iter().map(|a| render_template(a, &vars)).collect();

    tracing::debug!(shard = %ctx.key, command = ?argv, "running build");
    let output = run_command(&argv, &ctx.source_dir, &self.env(ctx)?, self.timeout)?;

    if output.timed_out {
      let limit = self.timeout.map(humantime::format_duration).map(|d| d.to_string());
      return Err(
        ReleaseError::ShardTimeout {
          shard: ctx.key.to_string(),
          timeout: limit.unwrap_or_default(),
        }
        .into(),
      );
    }

    if !output.success() {
      return Err(RailError::message(format!(
        "Build for {} exited with code {}: {}",
        ctx.key,
        output.exit_code,
        output.summary()
      )));
    }

    collect_artifacts(&ctx.out_dir, &self.artifact_globs)
  }
}

/// Files under `dir` matching any of `patterns`, sorted and deduplicated
pub fn collect_artifacts(dir: &Path, patterns: &[String]) -> RailResult<Vec<PathBuf>> {
  let base = glob::Pattern::escape(&dir.to_string_lossy());
  let mut found = BTreeSet::new();

  for pattern in patterns {
    let full = format!("{}/{}", base, pattern);
    for entry in glob::glob(&full)? {
      let path = entry.map_err(|e| RailError::message(format!("Failed to read artifact: {}", e)))?;
      if path.is_file() {
        found.insert(path);
      }
    }
  }

  Ok(found.into_iter().collect())
}

/// Run one shard end to end and record its artifacts
///
/// The shard's output directory is recreated empty first. A build may
/// produce nothing; the shard then records an empty artifact list.
pub fn run_shard(procedure: &dyn BuildProcedure, ctx: &ShardContext, store: &ArtifactStore) -> RailResult<usize> {
  if ctx.out_dir.exists() {
    fs::remove_dir_all(&ctx.out_dir).with_context(|| format!("Failed to clear {}", ctx.out_dir.display()))?;
  }
  fs::create_dir_all(&ctx.out_dir)?;

  let produced = procedure.build(ctx)?;
  let artifacts = produced
    .iter()
    .map(|path| Artifact::from_file(&ctx.key, path))
    .collect::<RailResult<Vec<_>>>()?;
  let count = artifacts.len();
  store.record(&ctx.key, artifacts)?;
  Ok(count)
}
