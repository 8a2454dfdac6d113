//! Throwaway git worktrees
//!
//! Checked out under a temp directory and removed again on drop, so the
//! main working tree is never switched or modified.

use super::SystemGit;
use crate::core::error::RailResult;
use std::path::{Path, PathBuf};

/// A worktree that is removed when dropped, whatever the outcome
pub struct Worktree<'a> {
  git: &'a SystemGit,
  path: PathBuf,
  _dir: tempfile::TempDir,
}

impl<'a> Worktree<'a> {
  /// Check out `branch`, reset to `start`
  pub fn branch(git: &'a SystemGit, prefix: &str, branch: &str, start: &str) -> RailResult<Self> {
    let (dir, path) = Self::location(prefix)?;
    git.worktree_add(&path, branch, start)?;
    Ok(Self { git, path, _dir: dir })
  }

  /// Check out `commit` with a detached HEAD
  pub fn detached(git: &'a SystemGit, prefix: &str, commit: &str) -> RailResult<Self> {
    let (dir, path) = Self::location(prefix)?;
    git.worktree_add_detached(&path, commit)?;
    Ok(Self { git, path, _dir: dir })
  }

  fn location(prefix: &str) -> RailResult<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
    let path = dir.path().join("worktree");
    Ok((dir, path))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for Worktree<'_> {
  fn drop(&mut self) {
    if let Err(e) = self.git.worktree_remove(&self.path) {
      tracing::warn!(path = %self.path.display(), error = %e, "failed to remove worktree");
    }
  }
}
