//! Root stages end to end: resolve, propagate, publish

use crate::helpers::{MANIFESTS, TestWorkspace, git};
use anyhow::Result;
use release_rail::core::context::RunContext;
use release_rail::core::error::{RailError, RailResult, ReleaseError};
use release_rail::pipeline::build::{BuildProcedure, ShardContext};
use release_rail::pipeline::scheduler::Silent;
use release_rail::pipeline::{ChannelSetup, JobStatus, ReleasePipeline, RunOutcome, RunReport};
use release_rail::release::publish::{JsonReleaseLog, ReleaseEntry, ReleaseHost};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

fn release(ws: &TestWorkspace) -> Result<RunReport> {
  let ctx = RunContext::build(&ws.path)?;
  let config = ctx.require_config()?.clone();
  Ok(ReleasePipeline::new(&ctx.root, &config, &ctx.git).run(&Silent)?)
}

fn status(report: &RunReport, id: &str) -> JobStatus {
  report.stage(id).map(|r| r.status).unwrap_or(JobStatus::Pending)
}

#[test]
fn test_fix_commit_releases_patch_across_all_patterns() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  ws.change("fix: correct rounding in dot product")?;

  let report = release(&ws)?;

  assert_eq!(report.outcome, RunOutcome::Released);
  assert_eq!(report.exit_code(), 0);
  assert_eq!(report.tag.as_deref(), Some("v1.2.4"));
  assert!(ws.tags()?.contains(&"v1.2.4".to_string()));

  assert!(ws.read_file("Cargo.toml")?.contains("version = \"1.2.4\""));
  assert_eq!(
    ws.read_file("src/version.h")?,
    "#define LIB_VERSION_MAJOR 1\n#define LIB_VERSION_MINOR 2\n#define LIB_VERSION_PATCH 4\n"
  );

  // Release commit holds exactly the manifests and sits under the tag
  assert_eq!(ws.git_log(1)?[0], "build: release 1.2.4 [skip ci]");
  assert_eq!(ws.rev_parse("v1.2.4^{commit}")?, ws.head()?);
  assert!(ws.status()?.is_empty(), "tree not clean: {}", ws.status()?);

  let log = JsonReleaseLog::new(ws.path.join(".rail/releases.json"));
  let entries = log.entries()?;
  assert_eq!(entries.len(), 1);
  assert_eq!(entries[0].tag, "v1.2.4");
  assert!(entries[0].notes.contains(&"fix: correct rounding in dot product".to_string()));
  Ok(())
}

#[test]
fn test_feature_and_breaking_bumps() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  ws.change("fix: small thing")?;
  ws.change("feat(simd): add avx512 kernels")?;

  let report = release(&ws)?;
  assert_eq!(report.tag.as_deref(), Some("v1.3.0"));

  ws.change("refactor!: drop the legacy C API")?;
  let report = release(&ws)?;
  assert_eq!(report.tag.as_deref(), Some("v2.0.0"));
  assert_eq!(
    ws.read_file("src/version.h")?,
    "#define LIB_VERSION_MAJOR 2\n#define LIB_VERSION_MINOR 0\n#define LIB_VERSION_PATCH 0\n"
  );
  Ok(())
}

#[test]
fn test_pattern_mismatch_leaves_tree_untouched() -> Result<()> {
  let ws = TestWorkspace::new()?;
  let config = format!(
    "{}\n[[manifests]]\nfile = \"src/version.h\"\npattern = '#define LIB_VERSION_TWEAK (\\d+)'\nfield = \"patch\"\n",
    MANIFESTS
  );
  ws.write_config(&config)?;
  ws.change("fix: something")?;

  let cargo_before = ws.read_file("Cargo.toml")?;
  let header_before = ws.read_file("src/version.h")?;
  let head_before = ws.head()?;

  let report = release(&ws)?;

  assert_eq!(report.outcome, RunOutcome::Failed);
  assert_eq!(report.exit_code(), 1);
  assert_eq!(status(&report, "resolve-version"), JobStatus::Succeeded);
  assert_eq!(status(&report, "propagate-version"), JobStatus::Failed);
  assert_eq!(status(&report, "publish-release"), JobStatus::Skipped);

  let error = report.stage("propagate-version").and_then(|r| r.error.clone()).unwrap();
  assert_eq!(error.code, "PatternMismatch");
  assert!(error.message.contains("src/version.h"));
  assert!(error.message.contains("LIB_VERSION_TWEAK"));

  assert_eq!(ws.read_file("Cargo.toml")?, cargo_before);
  assert_eq!(ws.read_file("src/version.h")?, header_before);
  assert_eq!(ws.head()?, head_before);
  assert!(!ws.tags()?.contains(&"v1.2.4".to_string()));
  Ok(())
}

#[test]
fn test_nothing_to_release() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  ws.change("docs: explain the kernels")?;

  let report = release(&ws)?;
  assert_eq!(report.outcome, RunOutcome::NothingToRelease);
  assert_eq!(report.exit_code(), 0);
  assert_eq!(status(&report, "propagate-version"), JobStatus::Skipped);
  assert_eq!(ws.tags()?, vec!["v1.2.3"]);

  // A finished release is not released twice
  ws.change("fix: something")?;
  assert_eq!(release(&ws)?.outcome, RunOutcome::Released);
  assert_eq!(release(&ws)?.outcome, RunOutcome::NothingToRelease);
  Ok(())
}

#[test]
fn test_release_is_pushed_to_remote() -> Result<()> {
  let ws = TestWorkspace::new()?.with_remote()?;
  ws.write_config(&format!("[release]\nremote = \"origin\"\n{}", MANIFESTS))?;
  ws.change("fix: something")?;

  let report = release(&ws)?;
  assert_eq!(report.outcome, RunOutcome::Released);

  let remote = ws.remote.clone().unwrap();
  let remote_main = git(&remote, &["rev-parse", "refs/heads/main"])?;
  assert_eq!(String::from_utf8_lossy(&remote_main.stdout).trim(), ws.head()?);
  git(&remote, &["rev-parse", "--verify", "refs/tags/v1.2.4"])?;
  Ok(())
}

#[test]
fn test_existing_remote_tag_is_replayed() -> Result<()> {
  let ws = TestWorkspace::new()?.with_remote()?;
  ws.write_config(&format!("[release]\nremote = \"origin\"\n{}", MANIFESTS))?;
  ws.change("fix: something")?;
  release(&ws)?;
  let released = ws.head()?;

  // Lose the local release, as a fresh CI checkout of the old head would
  git(&ws.path, &["tag", "-d", "v1.2.4"])?;
  git(&ws.path, &["reset", "--hard", "HEAD~1"])?;

  let report = release(&ws)?;

  assert_eq!(report.outcome, RunOutcome::Released);
  assert_eq!(status(&report, "publish-release"), JobStatus::Succeeded);
  let note = report.stage("publish-release").and_then(|r| r.note.clone()).unwrap();
  assert!(note.contains("already exists"), "{}", note);

  // Propagated edits were restored and nothing new was committed
  assert!(ws.status()?.is_empty());
  assert_ne!(ws.head()?, released);
  assert_eq!(ws.rev_parse("v1.2.4^{commit}")?, released);
  Ok(())
}

#[test]
fn test_rejected_push_rolls_back_local_release() -> Result<()> {
  let ws = TestWorkspace::new()?.with_remote()?;
  ws.write_config(&format!("[release]\nremote = \"origin\"\n{}", MANIFESTS))?;
  let source = ws.change("fix: something")?;

  // Someone else moved the remote mainline
  git(&ws.path, &["checkout", "-b", "elsewhere", "v1.2.3"])?;
  ws.change("chore: unrelated")?;
  git(&ws.path, &["push", "--force", "origin", "elsewhere:main"])?;
  git(&ws.path, &["checkout", "main"])?;

  let report = release(&ws)?;

  assert_eq!(report.outcome, RunOutcome::Failed);
  let error = report.stage("publish-release").and_then(|r| r.error.clone()).unwrap();
  assert_eq!(error.code, "GitError");
  assert_eq!(ws.head()?, source);
  assert!(!ws.tags()?.contains(&"v1.2.4".to_string()));
  assert!(ws.read_file("Cargo.toml")?.contains("version = \"1.2.3\""));
  Ok(())
}

/// Keeps release entries in memory; optionally fails the first call
#[derive(Default)]
struct MemoryHost {
  entries: Mutex<Vec<ReleaseEntry>>,
  down_once: Mutex<bool>,
}

impl MemoryHost {
  fn down_once() -> Self {
    Self {
      down_once: Mutex::new(true),
      ..Self::default()
    }
  }
}

impl ReleaseHost for MemoryHost {
  fn create_release(&self, entry: &ReleaseEntry) -> RailResult<()> {
    let mut down = self.down_once.lock().unwrap();
    if *down {
      *down = false;
      return Err(RailError::message("release host unavailable"));
    }
    let mut entries = self.entries.lock().unwrap();
    if entries.iter().any(|e| e.tag == entry.tag) {
      return Err(ReleaseError::PublishConflict { tag: entry.tag.clone() }.into());
    }
    entries.push(entry.clone());
    Ok(())
  }
}

#[test]
fn test_custom_release_host_receives_entry() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  ws.change("perf: vectorize the inner loop")?;

  let ctx = RunContext::build(&ws.path)?;
  let config = ctx.require_config()?.clone();
  let host = Arc::new(MemoryHost::default());
  let report = ReleasePipeline::new(&ctx.root, &config, &ctx.git)
    .with_host(host.clone())
    .run(&Silent)?;

  assert_eq!(report.tag.as_deref(), Some("v1.2.4"));
  let entries = host.entries.lock().unwrap();
  assert_eq!(entries.len(), 1);
  assert_eq!(entries[0].commit, ws.head()?);
  assert_eq!(entries[0].files.len(), 2);
  assert!(!ws.path.join(".rail/releases.json").exists());
  Ok(())
}

#[test]
fn test_release_commit_leaves_other_staged_files_alone() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  ws.change("fix: something")?;
  ws.write_file("secret.txt", "not for the release\n")?;
  git(&ws.path, &["add", "secret.txt"])?;

  let report = release(&ws)?;
  assert_eq!(report.outcome, RunOutcome::Released);

  let output = git(&ws.path, &["show", "--name-only", "--format=", "HEAD"])?;
  let mut files: Vec<String> = String::from_utf8_lossy(&output.stdout)
    .lines()
    .filter(|l| !l.is_empty())
    .map(String::from)
    .collect();
  files.sort();
  assert_eq!(files, vec!["Cargo.toml", "src/version.h"]);

  // Still staged for whoever staged it
  assert_eq!(ws.status()?, "A  secret.txt\n");
  Ok(())
}

#[test]
fn test_failed_tag_rolls_back_release_commit() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  let source = ws.change("fix: something")?;

  // refs/tags/v1.2.4/blocker makes `git tag v1.2.4` impossible
  git(&ws.path, &["tag", "v1.2.4/blocker"])?;

  let report = release(&ws)?;

  assert_eq!(report.outcome, RunOutcome::Failed);
  let error = report.stage("publish-release").and_then(|r| r.error.clone()).unwrap();
  assert_eq!(error.code, "GitError");
  assert_eq!(ws.head()?, source);
  assert!(ws.status()?.is_empty(), "tree not clean: {}", ws.status()?);
  assert!(ws.read_file("Cargo.toml")?.contains("version = \"1.2.3\""));
  assert!(ws.read_file("src/version.h")?.contains("LIB_VERSION_PATCH 3"));
  Ok(())
}

#[test]
fn test_replay_records_missing_release_entry() -> Result<()> {
  let ws = TestWorkspace::new()?.with_remote()?;
  ws.write_config(&format!("[release]\nremote = \"origin\"\n{}", MANIFESTS))?;
  ws.change("fix: something")?;

  let ctx = RunContext::build(&ws.path)?;
  let config = ctx.require_config()?.clone();
  let host = Arc::new(MemoryHost::down_once());

  // Tag and push land, the release entry does not
  let report = ReleasePipeline::new(&ctx.root, &config, &ctx.git)
    .with_host(host.clone())
    .run(&Silent)?;
  assert_eq!(report.outcome, RunOutcome::Failed);
  assert!(host.entries.lock().unwrap().is_empty());
  let released = ws.rev_parse("v1.2.4^{commit}")?;

  git(&ws.path, &["tag", "-d", "v1.2.4"])?;
  git(&ws.path, &["reset", "--hard", "HEAD~1"])?;

  let report = ReleasePipeline::new(&ctx.root, &config, &ctx.git)
    .with_host(host.clone())
    .run(&Silent)?;
  assert_eq!(status(&report, "publish-release"), JobStatus::Succeeded);

  let entries = host.entries.lock().unwrap();
  assert_eq!(entries.len(), 1);
  assert_eq!(entries[0].tag, "v1.2.4");
  assert_eq!(entries[0].commit, released);
  assert_eq!(entries[0].files.len(), 2);
  Ok(())
}

/// Copies the manifest it builds against into its output
#[derive(Default)]
struct ManifestSnapshot {
  seen: Mutex<Vec<String>>,
}

impl BuildProcedure for ManifestSnapshot {
  fn build(&self, ctx: &ShardContext) -> RailResult<Vec<PathBuf>> {
    let manifest = fs::read_to_string(ctx.source_dir.join("Cargo.toml"))?;
    self.seen.lock().unwrap().push(manifest.clone());
    let path = ctx.out_dir.join("Cargo.toml.snapshot");
    fs::write(&path, manifest)?;
    Ok(vec![path])
  }
}

#[test]
fn test_replay_builds_from_the_tagged_sources() -> Result<()> {
  let ws = TestWorkspace::new()?.with_remote()?;
  let channel = "[[channels]]\nname = \"native\"\nregistry = \"npm\"\nbuild = [\"true\"]\n\n[channels.matrix]\nplatforms = [\"linux\"]\narchitectures = [\"x86_64\"]\n";
  ws.write_config(&format!("[release]\nremote = \"origin\"\n{}\n{}", MANIFESTS, channel))?;
  ws.change("fix: something")?;
  release(&ws)?;

  git(&ws.path, &["tag", "-d", "v1.2.4"])?;
  git(&ws.path, &["reset", "--hard", "HEAD~1"])?;

  let ctx = RunContext::build(&ws.path)?;
  let config = ctx.require_config()?.clone();
  let build = Arc::new(ManifestSnapshot::default());
  let setup = ChannelSetup {
    build: build.clone(),
    ..ChannelSetup::from_config(config.channel("native")?, &ws.path)
  };
  let report = ReleasePipeline::new(&ctx.root, &config, &ctx.git)
    .with_channel("native", setup)?
    .dry_run(true)
    .run(&Silent)?;

  assert_eq!(status(&report, "publish-release"), JobStatus::Succeeded);
  let seen = build.seen.lock().unwrap();
  assert_eq!(seen.len(), 1);
  assert!(seen[0].contains("version = \"1.2.4\""), "{}", seen[0]);

  // The checkout of the tag is gone and the main tree is untouched
  let output = git(&ws.path, &["worktree", "list", "--porcelain"])?;
  let worktrees = String::from_utf8_lossy(&output.stdout)
    .lines()
    .filter(|l| l.starts_with("worktree "))
    .count();
  assert_eq!(worktrees, 1);
  assert!(ws.read_file("Cargo.toml")?.contains("version = \"1.2.3\""));
  Ok(())
}
