//! Release commit, tag and public release record
//!
//! A tag that already exists means this version was released before; the
//! publisher then restores the working tree and reports `PublishConflict`
//! so a replayed trigger is a no-op.

use crate::core::config::ReleaseSettings;
use crate::core::error::{RailError, RailResult, ReleaseError, ResultExt};
use crate::core::vcs::SystemGit;
use crate::release::propagate::{FileDiff, restore_files, write_atomic};
use crate::release::version::ReleaseVersion;
use crate::utils::render_template;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// The committed and tagged release
///
/// Built once by [`ReleasePublisher::publish`]; read-only afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseCommit {
  version: ReleaseVersion,
  tag: String,
  diffs: Vec<FileDiff>,
  timestamp: DateTime<Utc>,
  source_commit: String,
  commit: String,
}

impl ReleaseCommit {
  pub fn version(&self) -> &ReleaseVersion {
    &self.version
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn diffs(&self) -> &[FileDiff] {
    &self.diffs
  }

  pub fn timestamp(&self) -> DateTime<Utc> {
    self.timestamp
  }

  /// Mainline commit the release was cut from
  pub fn source_commit(&self) -> &str {
    &self.source_commit
  }

  /// The release commit itself (what the tag points at)
  pub fn commit(&self) -> &str {
    &self.commit
  }
}

/// Public record of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
  pub tag: String,
  pub version: ReleaseVersion,
  pub commit: String,
  pub published_at: DateTime<Utc>,
  pub files: Vec<PathBuf>,
  /// Subjects of the commits that went into this release
  #[serde(default)]
  pub notes: Vec<String>,
}

/// Where public release entries are recorded
pub trait ReleaseHost: Send + Sync {
  /// Record `entry`; an entry with the same tag is a `PublishConflict`
  fn create_release(&self, entry: &ReleaseEntry) -> RailResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReleaseLogFile {
  #[serde(default)]
  releases: Vec<ReleaseEntry>,
}

/// Release host backed by a JSON file (`<state_dir>/releases.json`)
pub struct JsonReleaseLog {
  path: PathBuf,
  lock: Mutex<()>,
}

impl JsonReleaseLog {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lock: Mutex::new(()),
    }
  }

  /// All recorded releases, oldest first
  pub fn entries(&self) -> RailResult<Vec<ReleaseEntry>> {
    Ok(self.read()?.releases)
  }

  fn read(&self) -> RailResult<ReleaseLogFile> {
    if !self.path.exists() {
      return Ok(ReleaseLogFile::default());
    }
    let content =
      fs::read_to_string(&self.path).with_context(|| format!("Failed to read {}", self.path.display()))?;
    Ok(serde_json::from_str(&content)?)
  }
}

impl ReleaseHost for JsonReleaseLog {
  fn create_release(&self, entry: &ReleaseEntry) -> RailResult<()> {
    let _guard = self
      .lock
      .lock()
      .map_err(|_| RailError::message("Release log lock poisoned"))?;

    let mut log = self.read()?;
    if log.releases.iter().any(|r| r.tag == entry.tag) {
      return Err(ReleaseError::PublishConflict { tag: entry.tag.clone() }.into());
    }
    log.releases.push(entry.clone());

    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    write_atomic(&self.path, &serde_json::to_string_pretty(&log)?)
  }
}

/// Commits propagated manifests, tags them and records the release
pub struct ReleasePublisher<'a> {
  git: &'a SystemGit,
  settings: &'a ReleaseSettings,
  host: &'a dyn ReleaseHost,
}

impl<'a> ReleasePublisher<'a> {
  pub fn new(git: &'a SystemGit, settings: &'a ReleaseSettings, host: &'a dyn ReleaseHost) -> Self {
    Self { git, settings, host }
  }

  /// Whether `tag` exists locally or, when a remote is configured, remotely
  pub fn tag_exists(&self, tag: &str) -> RailResult<bool> {
    if self.git.tag_exists(tag)? {
      return Ok(true);
    }
    match &self.settings.remote {
      Some(remote) => self.git.remote_tag_exists(remote, tag),
      None => Ok(false),
    }
  }

  /// Commit, tag, push and record `version`
  ///
  /// `diffs` are the edits already written by the propagator.
  pub fn publish(&self, version: &ReleaseVersion, diffs: Vec<FileDiff>, notes: Vec<String>) -> RailResult<ReleaseCommit> {
    let tag = version.tag(&self.settings.tag_prefix);

    if self.tag_exists(&tag)? {
      self.restore(&diffs)?;
      tracing::info!(tag = %tag, "release tag already exists, nothing to publish");
      return Err(ReleaseError::PublishConflict { tag }.into());
    }

    let source_commit = self.git.head_commit()?;
    let paths: Vec<PathBuf> = diffs.iter().map(|d| d.path.clone()).collect();

    let version_text = version.to_string();
    let message = render_template(
      &self.settings.commit_message,
      &[("version", version_text.as_str()), ("tag", tag.as_str())],
    );
    let commit = match self.git.commit_paths(&message, &paths) {
      Ok(commit) => commit,
      Err(err) => {
        self.roll_back(&diffs, &source_commit, None);
        return Err(err);
      }
    };
    if let Err(err) = self.git.create_annotated_tag(&tag, &format!("Release {}", version)) {
      self.roll_back(&diffs, &source_commit, None);
      return Err(err);
    }

    if let Some(remote) = &self.settings.remote {
      let refspecs = vec![
        format!("HEAD:refs/heads/{}", self.settings.mainline),
        format!("refs/tags/{}", tag),
      ];
      if let Err(err) = self.git.push_refspecs(remote, &refspecs) {
        // Leave no local-only release behind; a re-run starts clean
        self.roll_back(&diffs, &source_commit, Some(&tag));
        return Err(err);
      }
    }

    let release = ReleaseCommit {
      version: version.clone(),
      tag: tag.clone(),
      diffs,
      timestamp: Utc::now(),
      source_commit,
      commit: commit.clone(),
    };

    self
      .host
      .create_release(&ReleaseEntry {
        tag,
        version: version.clone(),
        commit,
        published_at: release.timestamp,
        files: paths,
        notes,
      })
      .context("Release is tagged but the release entry could not be recorded")?;

    Ok(release)
  }

  /// Record the entry of a release tagged by an earlier run
  ///
  /// Returns false when the host already holds an entry for the tag.
  pub fn record_existing(&self, entry: &ReleaseEntry) -> RailResult<bool> {
    match self.host.create_release(entry) {
      Ok(()) => {
        tracing::info!(tag = %entry.tag, "recorded missing release entry");
        Ok(true)
      }
      Err(err) if matches!(err.as_release(), Some(ReleaseError::PublishConflict { .. })) => Ok(false),
      Err(err) => Err(err),
    }
  }

  fn restore(&self, diffs: &[FileDiff]) -> RailResult<()> {
    restore_files(self.git.work_tree(), diffs)
  }

  /// Undo a half-finished publish: drop `tag`, move HEAD back to
  /// `source_commit` and put the original manifests back
  ///
  /// Runs on an error path, so each step only logs its own failure.
  fn roll_back(&self, diffs: &[FileDiff], source_commit: &str, tag: Option<&str>) {
    if let Some(tag) = tag
      && let Err(e) = self.git.delete_tag(tag)
    {
      tracing::warn!(tag = %tag, error = %e, "failed to delete release tag during rollback");
    }
    match self.git.head_commit() {
      Ok(head) if head != source_commit => {
        if let Err(e) = self.git.reset_keep(source_commit) {
          tracing::warn!(commit = %source_commit, error = %e, "failed to reset release commit during rollback");
        }
      }
      Ok(_) => {}
      Err(e) => tracing::warn!(error = %e, "failed to read HEAD during rollback"),
    }
    if let Err(e) = self.restore(diffs) {
      tracing::warn!(error = %e, "failed to restore manifests during rollback");
    }
  }
}
