//! Secondary branch synchronization
//!
//! The rebase runs in a throwaway worktree so the main working tree (where
//! builds may be running) is never checked out or modified.

use crate::core::error::{RailResult, ReleaseError};
use crate::core::vcs::{SystemGit, Worktree};
use serde::Serialize;

/// What happened to the secondary branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum SyncOutcome {
  /// Branch was rebased (or created) and now sits on top of mainline
  Updated {
    branch: String,
    from: Option<String>,
    to: String,
  },
  /// Branch already contained the mainline head
  UpToDate { branch: String, sha: String },
}

/// Rebases a long-lived branch onto the new mainline head
pub struct BranchSynchronizer<'a> {
  git: &'a SystemGit,
  branch: &'a str,
  remote: Option<&'a str>,
}

impl<'a> BranchSynchronizer<'a> {
  pub fn new(git: &'a SystemGit, branch: &'a str, remote: Option<&'a str>) -> Self {
    Self { git, branch, remote }
  }

  /// Current tip of the branch: remote when configured, else local
  fn current_tip(&self) -> RailResult<Option<String>> {
    match self.remote {
      Some(remote) => self.git.fetch_branch(remote, self.branch),
      None if self.git.branch_exists(self.branch)? => {
        self.git.rev_parse(&format!("refs/heads/{}", self.branch)).map(Some)
      }
      None => Ok(None),
    }
  }

  fn checkout(&self, start: &str) -> RailResult<Worktree<'a>> {
    Worktree::branch(self.git, "release-rail-sync", self.branch, start)
  }

  /// Rebase the branch onto `onto` and update it
  ///
  /// A conflicting rebase is aborted and reported as `RebaseConflict`; the
  /// branch is left exactly where it was.
  pub fn sync(&self, onto: &str) -> RailResult<SyncOutcome> {
    let previous = self.current_tip()?;
    let start = previous.clone().unwrap_or_else(|| onto.to_string());

    let worktree = self.checkout(&start)?;
    let tree = SystemGit::open(worktree.path())?;

    if let Err(detail) = tree.rebase_onto(onto)? {
      return Err(
        ReleaseError::RebaseConflict {
          branch: self.branch.to_string(),
          onto: short(onto).to_string(),
          detail: first_conflict_line(&detail),
        }
        .into(),
      );
    }

    let rebased = tree.head_commit()?;
    drop(worktree);

    if previous.as_deref() == Some(rebased.as_str()) {
      return Ok(SyncOutcome::UpToDate {
        branch: self.branch.to_string(),
        sha: rebased,
      });
    }

    if let Some(remote) = self.remote {
      self
        .git
        .force_push_with_lease(remote, self.branch, previous.as_deref())?;
    }

    tracing::info!(branch = self.branch, to = %rebased, "secondary branch synchronized");
    Ok(SyncOutcome::Updated {
      branch: self.branch.to_string(),
      from: previous,
      to: rebased,
    })
  }
}

fn short(sha: &str) -> &str {
  &sha[..sha.len().min(12)]
}

/// Keep the line naming the conflicted file when git reports one
fn first_conflict_line(detail: &str) -> String {
  detail
    .lines()
    .find(|l| l.starts_with("CONFLICT"))
    .or_else(|| detail.lines().find(|l| !l.trim().is_empty()))
    .unwrap_or("rebase failed")
    .trim()
    .to_string()
}
