//! Secondary branch synchronization after a release

use crate::helpers::{MANIFESTS, TestWorkspace, git};
use anyhow::Result;
use release_rail::core::context::RunContext;
use release_rail::core::vcs::SystemGit;
use release_rail::pipeline::scheduler::Silent;
use release_rail::pipeline::{JobStatus, ReleasePipeline, RunOutcome, RunReport};
use release_rail::release::sync::{BranchSynchronizer, SyncOutcome};

fn release(ws: &TestWorkspace) -> Result<RunReport> {
  let ctx = RunContext::build(&ws.path)?;
  let config = ctx.require_config()?.clone();
  Ok(ReleasePipeline::new(&ctx.root, &config, &ctx.git).run(&Silent)?)
}

fn is_ancestor(ws: &TestWorkspace, ancestor: &str, descendant: &str) -> bool {
  git(&ws.path, &["merge-base", "--is-ancestor", ancestor, descendant]).is_ok()
}

/// Workspace with a `main-dev` branch carrying one extra commit
fn with_dev_branch(ws: &TestWorkspace, file: &str, content: &str) -> Result<()> {
  git(&ws.path, &["checkout", "-b", "main-dev"])?;
  ws.write_file(file, content)?;
  ws.commit("feat: experimental kernels")?;
  git(&ws.path, &["checkout", "main"])?;
  Ok(())
}

#[test]
fn test_dev_branch_rebased_onto_release() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(&format!("[release]\nsecondary_branch = \"main-dev\"\n{}", MANIFESTS))?;
  with_dev_branch(&ws, "src/experimental.c", "int experimental(void) { return 1; }\n")?;
  ws.change("fix: something")?;

  let report = release(&ws)?;

  assert_eq!(report.outcome, RunOutcome::Released);
  assert_eq!(report.stage("sync-branch").map(|r| r.status), Some(JobStatus::Succeeded));
  assert!(is_ancestor(&ws, "v1.2.4", "main-dev"));

  let tip = git(&ws.path, &["log", "-1", "--format=%s", "main-dev"])?;
  assert_eq!(String::from_utf8_lossy(&tip.stdout).trim(), "feat: experimental kernels");

  // Main working tree stayed on main, clean
  let branch = git(&ws.path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
  assert_eq!(String::from_utf8_lossy(&branch.stdout).trim(), "main");
  assert!(ws.status()?.is_empty());
  Ok(())
}

#[test]
fn test_conflicting_rebase_is_reported_not_fatal() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(&format!("[release]\nsecondary_branch = \"main-dev\"\n{}", MANIFESTS))?;
  with_dev_branch(
    &ws,
    "Cargo.toml",
    "[package]\nname = \"numkernel\"\nversion = \"2.0.0-dev\"\nedition = \"2021\"\n",
  )?;
  let dev_before = ws.rev_parse("main-dev")?;
  ws.change("fix: something")?;

  let report = release(&ws)?;

  // The release itself went out
  assert_eq!(report.outcome, RunOutcome::Released);
  assert_eq!(report.exit_code(), 0);
  assert!(ws.tags()?.contains(&"v1.2.4".to_string()));

  let sync = report.stage("sync-branch").unwrap();
  assert_eq!(sync.status, JobStatus::Failed);
  assert_eq!(sync.error.as_ref().map(|e| e.code.as_str()), Some("RebaseConflict"));

  assert_eq!(ws.rev_parse("main-dev")?, dev_before);
  Ok(())
}

#[test]
fn test_remote_dev_branch_updated_with_lease() -> Result<()> {
  let ws = TestWorkspace::new()?.with_remote()?;
  ws.write_config(&format!(
    "[release]\nremote = \"origin\"\nsecondary_branch = \"main-dev\"\n{}",
    MANIFESTS
  ))?;
  with_dev_branch(&ws, "src/experimental.c", "int experimental(void) { return 1; }\n")?;
  git(&ws.path, &["push", "origin", "main-dev"])?;
  ws.change("fix: something")?;

  let report = release(&ws)?;
  assert_eq!(report.stage("sync-branch").map(|r| r.status), Some(JobStatus::Succeeded));

  let remote = ws.remote.clone().unwrap();
  let dev = git(&remote, &["rev-parse", "refs/heads/main-dev"])?;
  let dev = String::from_utf8_lossy(&dev.stdout).trim().to_string();
  git(&remote, &["merge-base", "--is-ancestor", "refs/tags/v1.2.4", &dev])?;
  Ok(())
}

#[test]
fn test_sync_is_idempotent() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  with_dev_branch(&ws, "src/experimental.c", "int experimental(void) { return 1; }\n")?;
  ws.change("docs: mainline moves on")?;

  let ctx = RunContext::build(&ws.path)?;
  let head = ctx.git.head_commit()?;
  let sync = BranchSynchronizer::new(&ctx.git, "main-dev", None);

  let first = sync.sync(&head)?;
  assert!(matches!(first, SyncOutcome::Updated { .. }));
  let second = sync.sync(&head)?;
  assert!(matches!(second, SyncOutcome::UpToDate { .. }));
  Ok(())
}

#[test]
fn test_stopped_rebase_is_aborted() -> Result<()> {
  let ws = TestWorkspace::new()?;
  with_dev_branch(
    &ws,
    "Cargo.toml",
    "[package]\nname = \"numkernel\"\nversion = \"2.0.0-dev\"\nedition = \"2021\"\n",
  )?;
  ws.write_file("Cargo.toml", "[package]\nname = \"numkernel\"\nversion = \"1.2.4\"\nedition = \"2021\"\n")?;
  ws.commit("fix: bump")?;
  git(&ws.path, &["checkout", "main-dev"])?;
  let dev_before = ws.head()?;

  let repo = SystemGit::open(&ws.path)?;
  let detail = repo.rebase_onto("main")?.unwrap_err();
  assert!(detail.contains("CONFLICT"), "{}", detail);
  assert!(!repo.rebase_in_progress()?);
  assert_eq!(ws.head()?, dev_before);
  assert!(ws.status()?.is_empty());

  // Nothing started, nothing to abort
  let detail = repo.rebase_onto("no-such-ref")?.unwrap_err();
  assert!(!detail.is_empty());
  assert!(!repo.rebase_in_progress()?);
  Ok(())
}
