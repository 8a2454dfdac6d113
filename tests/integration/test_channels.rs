//! Channel fan-out: matrix builds, aggregation and registry publishing

use crate::helpers::{MANIFESTS, TestWorkspace, git};
use anyhow::Result;
use release_rail::core::context::RunContext;
use release_rail::core::error::{RailError, RailResult};
use release_rail::pipeline::artifacts::StagingSet;
use release_rail::pipeline::build::{BuildProcedure, ShardContext};
use release_rail::pipeline::registry::{PublishTarget, RegistryClient, RegistryError, Secret};
use release_rail::pipeline::scheduler::Silent;
use release_rail::pipeline::{ChannelSetup, JobKind, JobStatus, ReleasePipeline, RunOutcome, RunReport};
use release_rail::release::version::ReleaseVersion;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const CHANNELS: &str = r#"
[[channels]]
name = "native"
registry = "npm"
mode = "publish"
build = ["true"]
upload = ["true"]

[channels.matrix]
platforms = ["linux", "darwin"]
architectures = ["x86_64", "arm64"]
exclude = [{ platform = "linux", architecture = "arm64" }]

[[channels]]
name = "python"
registry = "pypi"
mode = "publish"
build = ["true"]
upload = ["true"]

[channels.matrix]
platforms = ["linux"]
architectures = ["x86_64"]
"#;

const UNIVERSAL: &str = r#"
[[channels.matrix.derived]]
platform = "darwin"
architecture = "universal"
requires = [
  { platform = "darwin", architecture = "x86_64" },
  { platform = "darwin", architecture = "arm64" },
]
"#;

/// Writes one file per shard; derived shards embed their inputs' hashes
struct FakeBuild {
  fail: Vec<&'static str>,
}

impl BuildProcedure for FakeBuild {
  fn build(&self, ctx: &ShardContext) -> RailResult<Vec<PathBuf>> {
    if self.fail.contains(&ctx.key.shard_name().as_str()) {
      return Err(RailError::message("linker exploded"));
    }
    let path = ctx
      .out_dir
      .join(format!("{}-{}-{}.bin", ctx.key.channel, ctx.key.shard_name(), ctx.version));
    let mut body = ctx.key.to_string();
    for input in &ctx.inputs {
      body.push('\n');
      body.push_str(&input.sha256);
    }
    fs::write(&path, body)?;
    Ok(vec![path])
  }
}

/// Records every upload
#[derive(Default)]
struct FakeRegistry {
  uploads: Mutex<Vec<Vec<String>>>,
}

impl FakeRegistry {
  fn upload_count(&self) -> usize {
    self.uploads.lock().unwrap().len()
  }
}

impl RegistryClient for FakeRegistry {
  fn is_published(&self, _version: &ReleaseVersion) -> RailResult<bool> {
    Ok(false)
  }

  fn upload(&self, set: &StagingSet, _credential: Option<&Secret>) -> Result<(), RegistryError> {
    let names = set.artifacts().iter().map(|a| a.file_name()).collect();
    self.uploads.lock().unwrap().push(names);
    Ok(())
  }
}

struct Registries {
  native: Arc<FakeRegistry>,
  python: Arc<FakeRegistry>,
}

fn workspace(channels: &str) -> Result<TestWorkspace> {
  let ws = TestWorkspace::new()?;
  ws.write_config(&format!("[release]\nworkers = 4\n{}{}", MANIFESTS, channels))?;
  ws.change("fix: numerically stable softmax")?;
  Ok(ws)
}

fn release(ws: &TestWorkspace, fail: Vec<&'static str>, dry_run: bool) -> Result<(RunReport, Registries)> {
  let ctx = RunContext::build(&ws.path)?;
  let config = ctx.require_config()?.clone();
  let registries = Registries {
    native: Arc::new(FakeRegistry::default()),
    python: Arc::new(FakeRegistry::default()),
  };

  let report = ReleasePipeline::new(&ctx.root, &config, &ctx.git)
    .with_channel(
      "native",
      ChannelSetup {
        build: Arc::new(FakeBuild { fail }),
        registry: registries.native.clone(),
        target: PublishTarget::from_channel(config.channel("native")?),
      },
    )?
    .with_channel(
      "python",
      ChannelSetup {
        build: Arc::new(FakeBuild { fail: vec![] }),
        registry: registries.python.clone(),
        target: PublishTarget::from_channel(config.channel("python")?),
      },
    )?
    .dry_run(dry_run)
    .run(&Silent)?;

  Ok((report, registries))
}

fn status(report: &RunReport, id: &str) -> JobStatus {
  report.stage(id).map(|r| r.status).unwrap_or(JobStatus::Pending)
}

fn staged(ws: &TestWorkspace, channel: &str) -> Result<Vec<String>> {
  let mut names: Vec<String> = fs::read_dir(ws.path.join(".rail/staging").join(channel))?
    .map(|e| e.map(|e| e.file_name().to_string_lossy().to_string()))
    .collect::<std::io::Result<_>>()?;
  names.sort();
  Ok(names)
}

#[test]
fn test_all_channels_publish() -> Result<()> {
  let ws = workspace(CHANNELS)?;
  let (report, registries) = release(&ws, vec![], false)?;

  assert_eq!(report.outcome, RunOutcome::Released);
  assert_eq!(report.exit_code(), 0);
  assert_eq!(registries.native.upload_count(), 1);
  assert_eq!(registries.python.upload_count(), 1);
  assert_eq!(registries.native.uploads.lock().unwrap()[0].len(), 3);
  assert_eq!(
    staged(&ws, "native")?,
    vec![
      "native-darwin-arm64-1.2.4.bin",
      "native-darwin-x86_64-1.2.4.bin",
      "native-linux-x86_64-1.2.4.bin",
    ]
  );
  Ok(())
}

#[test]
fn test_failed_shard_blocks_only_its_channel() -> Result<()> {
  let ws = workspace(CHANNELS)?;
  let (report, registries) = release(&ws, vec!["darwin-arm64"], false)?;

  let native_shards: Vec<_> = report
    .stages
    .iter()
    .filter(|r| matches!(&r.kind, JobKind::BuildShard { shard } if shard.channel == "native"))
    .collect();
  assert_eq!(native_shards.len(), 3);
  assert_eq!(
    native_shards.iter().filter(|r| r.status == JobStatus::Failed).count(),
    1
  );
  // Siblings of the failed shard still ran
  assert_eq!(status(&report, "build:native/linux-x86_64"), JobStatus::Succeeded);
  assert_eq!(status(&report, "build:native/darwin-x86_64"), JobStatus::Succeeded);

  let aggregate = report.stage("aggregate:native").unwrap();
  assert_eq!(aggregate.status, JobStatus::Failed);
  let error = aggregate.error.as_ref().unwrap();
  assert_eq!(error.code, "IncompleteArtifactSet");
  assert!(error.message.contains("darwin-arm64"));

  assert_eq!(status(&report, "publish:native"), JobStatus::Skipped);
  assert_eq!(status(&report, "publish:python"), JobStatus::Succeeded);
  assert_eq!(registries.native.upload_count(), 0);
  assert_eq!(registries.python.upload_count(), 1);

  assert_eq!(report.outcome, RunOutcome::PartialFailure);
  assert_eq!(report.exit_code(), 4);
  assert!(ws.tags()?.contains(&"v1.2.4".to_string()));
  Ok(())
}

#[test]
fn test_derived_shard_consumes_prerequisites() -> Result<()> {
  let ws = workspace(&CHANNELS.replacen(
    "\n[[channels]]\nname = \"python\"",
    &format!("{}\n[[channels]]\nname = \"python\"", UNIVERSAL),
    1,
  ))?;
  let (report, _) = release(&ws, vec![], false)?;

  assert_eq!(report.outcome, RunOutcome::Released);
  assert_eq!(staged(&ws, "native")?.len(), 4);

  let universal = fs::read_to_string(
    ws.path
      .join(".rail/staging/native/native-darwin-universal-1.2.4.bin"),
  )?;
  // Shard key plus one hash per prerequisite
  assert_eq!(universal.lines().count(), 3);
  Ok(())
}

#[test]
fn test_failed_prerequisite_skips_derived_shard() -> Result<()> {
  let ws = workspace(&CHANNELS.replacen(
    "\n[[channels]]\nname = \"python\"",
    &format!("{}\n[[channels]]\nname = \"python\"", UNIVERSAL),
    1,
  ))?;
  let (report, _) = release(&ws, vec!["darwin-x86_64"], false)?;

  assert_eq!(status(&report, "build:native/darwin-universal"), JobStatus::Skipped);
  let error = report.stage("aggregate:native").and_then(|r| r.error.clone()).unwrap();
  assert!(error.message.contains("darwin-x86_64"));
  assert!(error.message.contains("darwin-universal"));
  assert_eq!(report.outcome, RunOutcome::PartialFailure);
  Ok(())
}

#[test]
fn test_dry_run_uploads_nothing() -> Result<()> {
  let ws = workspace(CHANNELS)?;
  let (report, registries) = release(&ws, vec![], true)?;

  assert_eq!(report.outcome, RunOutcome::Released);
  assert!(report.dry_run);
  assert_eq!(registries.native.upload_count(), 0);
  assert_eq!(registries.python.upload_count(), 0);
  let note = report.stage("publish:python").and_then(|r| r.note.clone()).unwrap();
  assert!(note.contains("dry run"), "{}", note);
  Ok(())
}

#[test]
fn test_replayed_release_is_not_uploaded_twice() -> Result<()> {
  let ws = workspace(CHANNELS)?;
  let (_, first) = release(&ws, vec![], false)?;
  assert_eq!(first.python.upload_count(), 1);

  // Re-run the same version from scratch; the publish ledger survives
  git(&ws.path, &["tag", "-d", "v1.2.4"])?;
  git(&ws.path, &["reset", "--hard", "HEAD~1"])?;

  let (report, second) = release(&ws, vec![], false)?;
  assert_eq!(report.outcome, RunOutcome::Released);
  assert_eq!(second.native.upload_count(), 0);
  assert_eq!(second.python.upload_count(), 0);
  let note = report.stage("publish:python").and_then(|r| r.note.clone()).unwrap();
  assert!(note.contains("already published"), "{}", note);
  Ok(())
}
