pub mod system_git;
mod system_git_ops;
pub mod worktree;

pub use system_git::SystemGit;
pub use worktree::Worktree;

/// Information about a commit
#[derive(Debug, Clone)]
pub struct CommitInfo {
  pub sha: String,
  pub author: String,
  pub author_email: String,
  pub message: String,
  pub timestamp: i64,
  pub parent_shas: Vec<String>,
}

impl CommitInfo {
  /// First line of the commit message
  pub fn subject(&self) -> &str {
    self.message.lines().next().unwrap_or("")
  }
}
