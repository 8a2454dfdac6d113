//! End-to-end release run: plan, schedule, report
//!
//! [`ReleasePipeline`] owns the per-channel collaborators (build procedure,
//! registry client, publish target) and evaluates the job graph. State that
//! flows between jobs lives in [`RunState`]: write-once cells for the
//! resolved version and release commit, the append-only artifact store, and
//! the staged sets handed from aggregators to publishers.

use crate::core::config::{ChannelConfig, RailConfig};
use crate::core::error::{RailError, RailResult, ReleaseError};
use crate::core::vcs::{SystemGit, Worktree};
use crate::pipeline::artifacts::{ArtifactAggregator, ArtifactStore, StagingSet};
use crate::pipeline::build::{BuildProcedure, CommandBuild, ShardContext, run_shard};
use crate::pipeline::graph::{JobKind, JobNode, JobStatus};
use crate::pipeline::matrix::ShardKey;
use crate::pipeline::plan::ReleasePlan;
use crate::pipeline::registry::{CommandRegistry, PublishLedger, PublishTarget, RegistryClient, RegistryPublisher};
use crate::pipeline::report::RunReport;
use crate::pipeline::scheduler::{Completion, JobObserver, JobRunner, Scheduler};
use crate::release::propagate::{FileDiff, VersionPropagator};
use crate::release::publish::{JsonReleaseLog, ReleaseEntry, ReleaseHost, ReleasePublisher};
use crate::release::resolve::{Resolution, VersionResolver};
use crate::release::sync::{BranchSynchronizer, SyncOutcome};
use crate::release::version::ReleaseVersion;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

/// Collaborators of one distribution channel
#[derive(Clone)]
pub struct ChannelSetup {
  pub build: Arc<dyn BuildProcedure>,
  pub registry: Arc<dyn RegistryClient>,
  pub target: PublishTarget,
}

impl ChannelSetup {
  /// Command-driven build and upload as configured in rail.toml
  pub fn from_config(channel: &ChannelConfig, root: &Path) -> Self {
    Self {
      build: Arc::new(CommandBuild::from_channel(channel)),
      registry: Arc::new(CommandRegistry::from_channel(channel, root)),
      target: PublishTarget::from_channel(channel),
    }
  }
}

/// The released commit as seen by downstream jobs
#[derive(Debug, Clone)]
struct Released {
  version: ReleaseVersion,
  tag: String,
  commit: String,
}

pub struct ReleasePipeline<'a> {
  root: PathBuf,
  config: &'a RailConfig,
  git: &'a SystemGit,
  host: Arc<dyn ReleaseHost>,
  channels: HashMap<String, ChannelSetup>,
  dry_run: bool,
}

impl<'a> ReleasePipeline<'a> {
  pub fn new(root: &Path, config: &'a RailConfig, git: &'a SystemGit) -> Self {
    let channels = config
      .channels
      .iter()
      .map(|c| (c.name.clone(), ChannelSetup::from_config(c, root)))
      .collect();
    Self {
      root: root.to_path_buf(),
      config,
      git,
      host: Arc::new(JsonReleaseLog::new(config.release.release_log_path(root))),
      channels,
      dry_run: false,
    }
  }

  pub fn with_host(mut self, host: Arc<dyn ReleaseHost>) -> Self {
    self.host = host;
    self
  }

  /// Replace the collaborators of a configured channel
  pub fn with_channel(mut self, name: &str, setup: ChannelSetup) -> RailResult<Self> {
    self.config.channel(name)?;
    self.channels.insert(name.to_string(), setup);
    Ok(self)
  }

  /// Force every channel into dry-run mode
  pub fn dry_run(mut self, dry_run: bool) -> Self {
    self.dry_run = dry_run;
    self
  }

  pub fn run<O: JobObserver>(&self, observer: &O) -> RailResult<RunReport> {
    let plan = ReleasePlan::build(self.config)?;
    tracing::info!(jobs = plan.graph.len(), workers = self.config.release.workers, "starting release run");

    let state = RunState {
      pipeline: self,
      plan: &plan,
      resolution: OnceLock::new(),
      diffs: Mutex::new(None),
      released: OnceLock::new(),
      release_tree: OnceLock::new(),
      store: ArtifactStore::new(),
      staged: Mutex::new(HashMap::new()),
      ledger: PublishLedger::new(self.config.release.ledger_path(&self.root)),
    };

    let schedule = Scheduler::new(self.config.release.workers).run(plan.graph.clone(), &state, observer)?;

    let (version, tag) = match state.released.get() {
      Some(r) => (Some(r.version.to_string()), Some(r.tag.clone())),
      None => (state.resolution.get().map(|r| r.next.to_string()), None),
    };
    Ok(RunReport::from_schedule(&schedule, version, tag, self.dry_run))
  }

  fn channel(&self, name: &str) -> RailResult<&ChannelSetup> {
    self
      .channels
      .get(name)
      .ok_or_else(|| RailError::message(format!("No collaborators registered for channel '{}'", name)))
  }
}

/// Shared state of one run
struct RunState<'p, 'a> {
  pipeline: &'p ReleasePipeline<'a>,
  plan: &'p ReleasePlan,
  resolution: OnceLock<Resolution>,
  diffs: Mutex<Option<Vec<FileDiff>>>,
  released: OnceLock<Released>,
  /// Checkout of a replayed release when HEAD is elsewhere
  release_tree: OnceLock<Worktree<'a>>,
  store: ArtifactStore,
  staged: Mutex<HashMap<String, Arc<StagingSet>>>,
  ledger: PublishLedger,
}

fn not_ready(what: &str) -> RailError {
  RailError::message(format!("{} is not available yet", what))
}

impl RunState<'_, '_> {
  fn resolve(&self) -> RailResult<Completion> {
    let settings = &self.pipeline.config.release;
    let resolver = VersionResolver::new(
      settings.tag_prefix.clone(),
      ReleaseVersion::from_str(&settings.initial_version)?,
      settings.prerelease.clone(),
    );

    let resolution = match resolver.resolve_from_repo(self.pipeline.git) {
      Ok(resolution) => resolution,
      Err(err) if matches!(err.as_release(), Some(ReleaseError::NoReleasableChange { .. })) => {
        return Ok(Completion::Halt(err.to_string()));
      }
      Err(err) => return Err(err),
    };

    let note = format!(
      "{} -> {} ({} commit(s))",
      resolution.previous,
      resolution.next,
      resolution.commits.len()
    );
    let _ = self.resolution.set(resolution);
    Ok(Completion::Continue(note))
  }

  fn version(&self) -> RailResult<&ReleaseVersion> {
    self
      .resolution
      .get()
      .map(|r| &r.next)
      .ok_or_else(|| not_ready("Resolved version"))
  }

  fn propagate(&self) -> RailResult<Completion> {
    let version = self.version()?;
    let diffs = VersionPropagator::new(&self.pipeline.root, &self.pipeline.config.manifests).apply(version)?;
    let note = format!("updated {} file(s)", diffs.len());
    *self
      .diffs
      .lock()
      .map_err(|_| RailError::message("Diff state lock poisoned"))? = Some(diffs);
    Ok(Completion::Continue(note))
  }

  fn publish_release(&self) -> RailResult<Completion> {
    let version = self.version()?.clone();
    let diffs = self
      .diffs
      .lock()
      .map_err(|_| RailError::message("Diff state lock poisoned"))?
      .take()
      .ok_or_else(|| not_ready("Propagated manifests"))?;
    let notes: Vec<String> = self
      .resolution
      .get()
      .map(|r| r.commits.iter().map(|c| c.subject.clone()).collect())
      .unwrap_or_default();
    let files: Vec<PathBuf> = diffs.iter().map(|d| d.path.clone()).collect();

    let git = self.pipeline.git;
    let publisher = ReleasePublisher::new(git, &self.pipeline.config.release, self.pipeline.host.as_ref());

    match publisher.publish(&version, diffs, notes.clone()) {
      Ok(release) => {
        tracing::info!(
          tag = release.tag(),
          source = release.source_commit(),
          files = release.diffs().len(),
          at = %release.timestamp(),
          "release published"
        );
        let note = format!("tagged {} at {}", release.tag(), &release.commit()[..12.min(release.commit().len())]);
        let _ = self.released.set(Released {
          version: release.version().clone(),
          tag: release.tag().to_string(),
          commit: release.commit().to_string(),
        });
        Ok(Completion::Continue(note))
      }
      Err(err) => match err.as_release() {
        Some(ReleaseError::PublishConflict { tag }) => {
          // Replay: downstream jobs work against the existing release
          if !git.tag_exists(tag)?
            && let Some(remote) = &self.pipeline.config.release.remote
          {
            git.fetch_tag(remote, tag)?;
          }
          let commit = git.rev_parse(tag)?;
          publisher.record_existing(&ReleaseEntry {
            tag: tag.clone(),
            version: version.clone(),
            commit: commit.clone(),
            published_at: Utc::now(),
            files,
            notes,
          })?;

          // Builds must see the tagged sources, not whatever HEAD holds now
          if git.head_commit()? != commit {
            let tree = Worktree::detached(git, "release-rail-replay", &commit)?;
            tracing::info!(tag = %tag, path = %tree.path().display(), "building from a checkout of the release tag");
            let _ = self.release_tree.set(tree);
          }

          let note = format!("{} already exists, replaying downstream jobs", tag);
          let _ = self.released.set(Released {
            version,
            tag: tag.clone(),
            commit,
          });
          Ok(Completion::Continue(note))
        }
        _ => Err(err),
      },
    }
  }

  fn released(&self) -> RailResult<&Released> {
    self.released.get().ok_or_else(|| not_ready("Release commit"))
  }

  /// Tree the build shards run in
  fn source_dir(&self) -> PathBuf {
    match self.release_tree.get() {
      Some(tree) => tree.path().to_path_buf(),
      None => self.pipeline.root.clone(),
    }
  }

  fn sync_branch(&self) -> RailResult<Completion> {
    let settings = &self.pipeline.config.release;
    let Some(branch) = settings.secondary_branch.as_deref() else {
      return Ok(Completion::Continue("no secondary branch configured".to_string()));
    };
    let released = self.released()?;

    let outcome =
      BranchSynchronizer::new(self.pipeline.git, branch, settings.remote.as_deref()).sync(&released.commit)?;
    Ok(Completion::Continue(match outcome {
      SyncOutcome::Updated { branch, to, .. } => {
        format!("{} rebased to {}", branch, &to[..12.min(to.len())])
      }
      SyncOutcome::UpToDate { branch, .. } => format!("{} already up to date", branch),
    }))
  }

  fn build_shard(&self, key: &ShardKey) -> RailResult<Completion> {
    let released = self.released()?;
    let setup = self.pipeline.channel(&key.channel)?;
    let shard = self
      .plan
      .matrix(&key.channel)
      .and_then(|m| m.get(key))
      .ok_or_else(|| RailError::message(format!("Shard {} is not in the plan", key)))?;

    let inputs = shard
      .requires
      .iter()
      .flat_map(|k| self.store.get(k).unwrap_or_default())
      .collect();

    let ctx = ShardContext {
      key: key.clone(),
      version: released.version.clone(),
      source_dir: self.source_dir(),
      out_dir: self
        .pipeline
        .config
        .release
        .build_root(&self.pipeline.root)
        .join(&key.channel)
        .join(key.shard_name()),
      inputs,
    };

    let count = run_shard(setup.build.as_ref(), &ctx, &self.store)?;
    Ok(Completion::Continue(format!("{} artifact(s)", count)))
  }

  fn aggregate(&self, channel: &str, deps: &[(JobKind, JobStatus)]) -> RailResult<Completion> {
    let released = self.released()?;
    let matrix = self
      .plan
      .matrix(channel)
      .ok_or_else(|| RailError::message(format!("Channel '{}' is not in the plan", channel)))?;

    let succeeded: Vec<ShardKey> = deps
      .iter()
      .filter_map(|(kind, status)| match kind {
        JobKind::BuildShard { shard } if *status == JobStatus::Succeeded => Some(shard.clone()),
        _ => None,
      })
      .collect();

    let staging_root = self.pipeline.config.release.staging_root(&self.pipeline.root);
    let set = ArtifactAggregator::new(&self.store, &staging_root).aggregate(
      channel,
      &released.version,
      &matrix.required_keys(),
      &succeeded,
    )?;

    let note = format!("staged {} artifact(s) from {} shard(s)", set.artifacts().len(), succeeded.len());
    self
      .staged
      .lock()
      .map_err(|_| RailError::message("Staging state lock poisoned"))?
      .insert(channel.to_string(), set);
    Ok(Completion::Continue(note))
  }

  fn publish_registry(&self, channel: &str) -> RailResult<Completion> {
    let setup = self.pipeline.channel(channel)?;
    let set = self
      .staged
      .lock()
      .map_err(|_| RailError::message("Staging state lock poisoned"))?
      .get(channel)
      .cloned()
      .ok_or_else(|| not_ready("Staging set"))?;

    let publisher = RegistryPublisher::new(setup.registry.as_ref(), &self.ledger, &self.pipeline.config.retry);
    let outcome = publisher.publish(&setup.target, &set, self.pipeline.dry_run)?;
    tracing::info!(channel, outcome = %outcome, "channel finished");
    Ok(Completion::Continue(outcome.to_string()))
  }
}

impl JobRunner for RunState<'_, '_> {
  fn run(&self, node: &JobNode, deps: &[(JobKind, JobStatus)]) -> RailResult<Completion> {
    let span = tracing::info_span!("job", id = %node.id);
    let _enter = span.enter();

    match &node.kind {
      JobKind::ResolveVersion => self.resolve(),
      JobKind::PropagateVersion => self.propagate(),
      JobKind::PublishRelease => self.publish_release(),
      JobKind::SyncBranch => self.sync_branch(),
      JobKind::BuildShard { shard } => self.build_shard(shard),
      JobKind::Aggregate { channel } => self.aggregate(channel, deps),
      JobKind::PublishRegistry { channel } => self.publish_registry(channel),
    }
  }
}
