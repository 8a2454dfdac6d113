//! Additional operations for SystemGit (history, tags, pushes, worktrees)

use super::CommitInfo;
use super::system_git::SystemGit;
use crate::core::error::{GitError, RailError, RailResult, ResultExt};
use crate::utils::path_to_git_format;
use std::path::{Path, PathBuf};

impl SystemGit {
    /// Commits reachable from HEAD but not from `since`, oldest first
    pub fn commit_shas_since(&self, since: Option<&str>) -> RailResult<Vec<String>> {
        let mut cmd = self.git_cmd();
        cmd.args(["rev-list", "--no-merges", "--reverse"]);

        if let Some(since_sha) = since {
            cmd.arg(format!("{}..HEAD", since_sha));
        } else {
            cmd.arg("HEAD");
        }

        let output = cmd.output().context("Failed to run git rev-list")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RailError::Git(GitError::CommandFailed {
                command: "git rev-list".to_string(),
                stderr: stderr.to_string(),
            }));
        }

        let commits = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(commits)
    }

    /// Get commit metadata for a single SHA
    pub fn get_commit(&self, sha: &str) -> RailResult<CommitInfo> {
        // %H hash, %an author, %ae email, %at author time, %P parents, %B body
        let format = "%H%n%an%n%ae%n%at%n%P%n%B";

        let output = self
            .git_cmd()
            .args(["log", "-1", &format!("--format={}", format), sha])
            .output()
            .context("Failed to get commit info")?;

        if !output.status.success() {
            return Err(RailError::Git(GitError::CommitNotFound {
                sha: sha.to_string(),
            }));
        }

        parse_commit_output(&output.stdout)
    }

    /// Full commit metadata since `since`, oldest first
    pub fn commits_since(&self, since: Option<&str>) -> RailResult<Vec<CommitInfo>> {
        let shas = self.commit_shas_since(since)?;

        use rayon::prelude::*;

        shas.par_iter().map(|sha| self.get_commit(sha)).collect()
    }

    /// All tag names in the repository
    pub fn list_tags(&self) -> RailResult<Vec<String>> {
        let output = self.run_checked(&["tag", "--list"])?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// Check whether a tag exists locally
    pub fn tag_exists(&self, tag: &str) -> RailResult<bool> {
        let output = self
            .git_cmd()
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/tags/{}", tag)])
            .output()
            .context("Failed to look up tag")?;

        Ok(output.status.success())
    }

    /// Check whether a tag exists on a remote
    pub fn remote_tag_exists(&self, remote: &str, tag: &str) -> RailResult<bool> {
        let output = self.run_checked(&["ls-remote", "--tags", remote, &format!("refs/tags/{}", tag)])?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    /// Fetch a single tag from a remote into the local tag namespace
    pub fn fetch_tag(&self, remote: &str, tag: &str) -> RailResult<()> {
        let refspec = format!("refs/tags/{0}:refs/tags/{0}", tag);
        self.run_checked(&["fetch", "--no-tags", remote, &refspec])?;
        Ok(())
    }

    /// Check whether a local branch exists
    pub fn branch_exists(&self, branch: &str) -> RailResult<bool> {
        let output = self
            .git_cmd()
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .output()
            .context("Failed to look up branch")?;

        Ok(output.status.success())
    }

    /// Commit the working-tree contents of exactly `paths` and return the new HEAD
    ///
    /// Whatever else is staged stays staged and out of the commit.
    pub fn commit_paths(&self, message: &str, paths: &[PathBuf]) -> RailResult<String> {
        if paths.is_empty() {
            return Err(RailError::message("Refusing to commit an empty path list"));
        }

        let rendered: Vec<String> = paths.iter().map(|p| path_to_git_format(p)).collect();
        let mut args = vec!["commit", "--no-verify", "--only", "-m", message, "--"];
        args.extend(rendered.iter().map(String::as_str));
        self.run_checked(&args)?;
        self.head_commit()
    }

    /// Create an annotated tag on HEAD
    pub fn create_annotated_tag(&self, tag: &str, message: &str) -> RailResult<()> {
        self.run_checked(&["tag", "-a", tag, "-m", message])?;
        Ok(())
    }

    /// Delete a local tag
    pub fn delete_tag(&self, tag: &str) -> RailResult<()> {
        self.run_checked(&["tag", "-d", tag])?;
        Ok(())
    }

    /// Move HEAD back to `sha`, keeping unrelated local changes
    pub fn reset_keep(&self, sha: &str) -> RailResult<()> {
        self.run_checked(&["reset", "--keep", sha])?;
        Ok(())
    }

    /// Push refspecs to a remote atomically
    pub fn push_refspecs(&self, remote: &str, refspecs: &[String]) -> RailResult<()> {
        let mut args = vec!["push", "--atomic", remote];
        args.extend(refspecs.iter().map(String::as_str));

        let output = self.git_cmd().args(&args).output().context("Failed to push")?;

        if !output.status.success() {
            return Err(RailError::Git(GitError::PushFailed {
                remote: remote.to_string(),
                branch: refspecs.join(" "),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }));
        }

        Ok(())
    }

    /// Force-update a remote branch, refusing if it moved since `expected`
    ///
    /// `None` means the branch must not exist on the remote yet.
    pub fn force_push_with_lease(&self, remote: &str, branch: &str, expected: Option<&str>) -> RailResult<()> {
        let lease = format!("--force-with-lease={}:{}", branch, expected.unwrap_or(""));
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);

        let output = self
            .git_cmd()
            .args(["push", &lease, remote, &refspec])
            .output()
            .context("Failed to force-push")?;

        if !output.status.success() {
            return Err(RailError::Git(GitError::PushFailed {
                remote: remote.to_string(),
                branch: branch.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }));
        }

        Ok(())
    }

    /// Fetch one branch from a remote, returning the fetched SHA if it exists
    pub fn fetch_branch(&self, remote: &str, branch: &str) -> RailResult<Option<String>> {
        let refspec = format!("+refs/heads/{0}:refs/remotes/{1}/{0}", branch, remote);
        let output = self
            .git_cmd()
            .args(["fetch", remote, &refspec])
            .output()
            .context("Failed to fetch")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("couldn't find remote ref") {
                return Ok(None);
            }
            return Err(RailError::Git(GitError::CommandFailed {
                command: "git fetch".to_string(),
                stderr: stderr.to_string(),
            }));
        }

        self.rev_parse(&format!("refs/remotes/{}/{}", remote, branch)).map(Some)
    }

    /// Check out `branch` (reset to `start`) in a separate worktree at `path`
    pub fn worktree_add(&self, path: &Path, branch: &str, start: &str) -> RailResult<()> {
        let path = path_to_git_format(path);
        self.run_checked(&["worktree", "add", "--force", "-B", branch, &path, start])?;
        Ok(())
    }

    /// Add a worktree at `path` with a detached HEAD at `commit`
    pub fn worktree_add_detached(&self, path: &Path, commit: &str) -> RailResult<()> {
        let path = path_to_git_format(path);
        self.run_checked(&["worktree", "add", "--force", "--detach", &path, commit])?;
        Ok(())
    }

    /// Remove a worktree created by `worktree_add` or `worktree_add_detached`
    pub fn worktree_remove(&self, path: &Path) -> RailResult<()> {
        let path = path_to_git_format(path);
        self.run_checked(&["worktree", "remove", "--force", &path])?;
        Ok(())
    }

    /// Rebase the checked-out branch onto `onto`
    ///
    /// On conflict the rebase is aborted and git's message is returned.
    pub fn rebase_onto(&self, onto: &str) -> RailResult<Result<(), String>> {
        let output = self
            .git_cmd()
            .args(["rebase", "--no-autostash", onto])
            .output()
            .context("Failed to run git rebase")?;

        if output.status.success() {
            return Ok(Ok(()));
        }

        let mut detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            detail.push('\n');
            detail.push_str(stderr.trim());
        }

        // Leave the branch where it was
        let abort = self
            .git_cmd()
            .args(["rebase", "--abort"])
            .output()
            .context("Failed to run git rebase --abort")?;
        if !abort.status.success() && self.rebase_in_progress()? {
            return Err(RailError::Git(GitError::CommandFailed {
                command: "git rebase --abort".to_string(),
                stderr: format!(
                    "{}\nrebase onto {} is still in progress: {}",
                    String::from_utf8_lossy(&abort.stderr).trim(),
                    onto,
                    detail
                ),
            }));
        }

        Ok(Err(detail))
    }

    /// Whether a stopped rebase is waiting in this worktree
    pub fn rebase_in_progress(&self) -> RailResult<bool> {
        for state in ["rebase-merge", "rebase-apply"] {
            let output = self.run_checked(&["rev-parse", "--git-path", state])?;
            let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
            let path = if path.is_absolute() { path } else { self.work_tree().join(path) };
            if path.exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Parse git log output into CommitInfo
///
/// Format is %H%n%an%n%ae%n%at%n%P%n%B
fn parse_commit_output(data: &[u8]) -> RailResult<CommitInfo> {
    let output = String::from_utf8_lossy(data);
    let mut lines = output.lines();

    let sha = lines.next().ok_or_else(|| RailError::message("Missing commit SHA"))?.to_string();
    let author = lines.next().ok_or_else(|| RailError::message("Missing author name"))?.to_string();
    let author_email = lines.next().ok_or_else(|| RailError::message("Missing author email"))?.to_string();
    let timestamp = lines
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RailError::message("Missing/invalid author timestamp"))?;
    let parents_line = lines.next().unwrap_or("");
    let parent_shas = parents_line.split_whitespace().map(|s| s.to_string()).collect();

    let message: Vec<&str> = lines.collect();
    let message = message.join("\n").trim().to_string();

    Ok(CommitInfo {
        sha,
        author,
        author_email,
        message,
        timestamp,
        parent_shas,
    })
}
