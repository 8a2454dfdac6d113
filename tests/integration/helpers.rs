//! Test helpers for integration tests

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// rail.toml header shared by most tests: two files, four patterns
pub const MANIFESTS: &str = r#"
[[manifests]]
file = "Cargo.toml"
pattern = '(?m)^version = "(?P<version>[^"]+)"'

[[manifests]]
file = "src/version.h"
pattern = '#define LIB_VERSION_MAJOR (\d+)'
field = "major"

[[manifests]]
file = "src/version.h"
pattern = '#define LIB_VERSION_MINOR (\d+)'
field = "minor"

[[manifests]]
file = "src/version.h"
pattern = '#define LIB_VERSION_PATCH (\d+)'
field = "patch"
"#;

/// A release repository with git history and an optional bare remote
pub struct TestWorkspace {
  _root: TempDir,
  pub path: PathBuf,
  pub remote: Option<PathBuf>,
}

impl TestWorkspace {
  /// Repository released once as v1.2.3
  pub fn new() -> Result<Self> {
    let root = TempDir::new()?;
    let path = root.path().join("repo");
    std::fs::create_dir_all(path.join("src"))?;

    // Initialize git repo with main as default branch
    git(&path, &["init", "--initial-branch=main"])?;
    git(&path, &["config", "user.name", "Test User"])?;
    git(&path, &["config", "user.email", "test@example.com"])?;

    std::fs::write(
      path.join("Cargo.toml"),
      "[package]\nname = \"numkernel\"\nversion = \"1.2.3\"\nedition = \"2021\"\n",
    )?;
    std::fs::write(
      path.join("src/version.h"),
      "#define LIB_VERSION_MAJOR 1\n#define LIB_VERSION_MINOR 2\n#define LIB_VERSION_PATCH 3\n",
    )?;
    std::fs::write(path.join(".gitignore"), ".rail/\n")?;

    git(&path, &["add", "."])?;
    git(&path, &["commit", "-m", "build: release 1.2.3"])?;
    git(&path, &["tag", "-a", "v1.2.3", "-m", "Release 1.2.3"])?;

    Ok(Self {
      _root: root,
      path,
      remote: None,
    })
  }

  /// Attach a bare `origin` and push main plus tags to it
  pub fn with_remote(mut self) -> Result<Self> {
    let remote = self.path.with_file_name("origin.git");
    git(
      self.path.parent().context("workspace has no parent")?,
      &["init", "--bare", "--initial-branch=main", "origin.git"],
    )?;
    git(&self.path, &["remote", "add", "origin", &remote.to_string_lossy()])?;
    git(&self.path, &["push", "origin", "main", "--tags"])?;
    self.remote = Some(remote);
    Ok(self)
  }

  /// Write and commit rail.toml
  pub fn write_config(&self, body: &str) -> Result<()> {
    std::fs::write(self.path.join("rail.toml"), body)?;
    git(&self.path, &["add", "rail.toml"])?;
    git(&self.path, &["commit", "-m", "chore: configure release-rail"])?;
    Ok(())
  }

  pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
    let full = self.path.join(path);
    if let Some(parent) = full.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(full, content)?;
    Ok(())
  }

  /// Commit current changes
  pub fn commit(&self, message: &str) -> Result<String> {
    git(&self.path, &["add", "."])?;
    git(&self.path, &["commit", "-m", message])?;
    self.head()
  }

  /// Commit a change to a scratch file
  pub fn change(&self, message: &str) -> Result<String> {
    let file = format!("notes/{}.txt", self.git_log(1000)?.len());
    self.write_file(&file, message)?;
    self.commit(message)
  }

  pub fn head(&self) -> Result<String> {
    self.rev_parse("HEAD")
  }

  pub fn rev_parse(&self, rev: &str) -> Result<String> {
    let output = git(&self.path, &["rev-parse", rev])?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
  }

  pub fn tags(&self) -> Result<Vec<String>> {
    let output = git(&self.path, &["tag", "--list"])?;
    Ok(String::from_utf8_lossy(&output.stdout).lines().map(String::from).collect())
  }

  /// Get git log
  pub fn git_log(&self, n: usize) -> Result<Vec<String>> {
    let output = git(&self.path, &["log", &format!("-{}", n), "--format=%s"])?;
    Ok(
      String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(String::from)
        .collect(),
    )
  }

  /// Porcelain status; empty means a clean tree
  pub fn status(&self) -> Result<String> {
    let output = git(&self.path, &["status", "--porcelain"])?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
  }

  /// Read a file
  pub fn read_file(&self, path: &str) -> Result<String> {
    Ok(std::fs::read_to_string(self.path.join(path))?)
  }
}

/// Run git command in a directory
pub fn git(cwd: &Path, args: &[&str]) -> Result<Output> {
  let output = Command::new("git")
    .current_dir(cwd)
    .args(args)
    .output()
    .context("Failed to run git command")?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    anyhow::bail!("Git command failed: git {}\n{}", args.join(" "), stderr);
  }

  Ok(output)
}

/// Run the release-rail binary; the caller inspects the exit status
pub fn run_release_rail(cwd: &Path, args: &[&str]) -> Result<Output> {
  let bin = env!("CARGO_BIN_EXE_release-rail");

  Command::new(bin)
    .current_dir(cwd)
    .args(args)
    .output()
    .context("Failed to run release-rail")
}

/// Shell build command for a channel: `sh -c <script>`
pub fn sh(script: &str) -> String {
  format!("[\"sh\", \"-c\", '{}']", script)
}
