//! Repository context - build once, pass everywhere
//!
//! ```text
//! main.rs:
//!   RunContext::build() -> &RunContext
//!   |
//!   v
//! commands/run.rs, plan.rs, etc:
//!   fn run_*(ctx: &RunContext, ...)
//! ```

use crate::core::config::RailConfig;
use crate::core::error::{ConfigError, RailError, RailResult};
use crate::core::vcs::SystemGit;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Repository root, git handle and configuration
#[derive(Clone)]
pub struct RunContext {
  /// Repository root (absolute path)
  pub root: PathBuf,

  pub git: SystemGit,

  /// Rail configuration (rail.toml). Kept as the load result so commands
  /// report the real parse error instead of "not found".
  config: Result<Arc<RailConfig>, String>,
}

impl RunContext {
  /// Open the repository containing `path` and load its rail.toml
  pub fn build(path: &Path) -> RailResult<Self> {
    let git = SystemGit::open(path)?;
    let root = git.work_tree().to_path_buf();
    let config = match RailConfig::load(&root) {
      Ok(config) => Ok(Arc::new(config)),
      Err(RailError::Config(ConfigError::NotFound { .. })) => Err(String::new()),
      Err(e) => Err(e.to_string()),
    };

    Ok(Self { root, git, config })
  }

  /// Get config or error if it is missing or invalid
  pub fn require_config(&self) -> RailResult<&Arc<RailConfig>> {
    match &self.config {
      Ok(config) => Ok(config),
      Err(reason) if reason.is_empty() => Err(RailError::Config(ConfigError::NotFound {
        workspace_root: self.root.clone(),
      })),
      Err(reason) => Err(RailError::with_help(
        reason.clone(),
        "Run `release-rail check` after fixing rail.toml",
      )),
    }
  }

  /// Get repository root as Path reference (convenience)
  pub fn repo_root(&self) -> &Path {
    &self.root
  }
}
