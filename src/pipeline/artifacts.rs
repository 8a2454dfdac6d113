//! Artifacts, the per-shard artifact store and channel aggregation
//!
//! Shards append their outputs to the store under their own key, once.
//! The aggregator is the fan-in point: it checks that every required shard
//! made it, then copies the channel's artifacts (deduplicated by content)
//! into a staging directory that nothing writes to afterwards.

use crate::core::error::{RailError, RailResult, ReleaseError, ResultExt};
use crate::pipeline::matrix::ShardKey;
use crate::release::version::ReleaseVersion;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Distribution format, inferred from the file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
  Wheel,
  SourceDist,
  NodeModule,
  Crate,
  Archive,
  Other,
}

impl ArtifactKind {
  pub fn from_path(path: &Path) -> Self {
    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().to_lowercase())
      .unwrap_or_default();

    if name.ends_with(".whl") {
      ArtifactKind::Wheel
    } else if name.ends_with(".tar.gz") && !name.contains("-linux") && !name.contains("-darwin") {
      ArtifactKind::SourceDist
    } else if name.ends_with(".node") || name.ends_with(".tgz") {
      ArtifactKind::NodeModule
    } else if name.ends_with(".crate") {
      ArtifactKind::Crate
    } else if name.ends_with(".zip") || name.ends_with(".tar.gz") || name.ends_with(".tar.xz") {
      ArtifactKind::Archive
    } else {
      ArtifactKind::Other
    }
  }
}

/// One file produced by a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
  pub kind: ArtifactKind,
  pub channel: String,
  pub shard: ShardKey,
  pub path: PathBuf,
  /// Hex-encoded SHA-256 of the contents
  pub sha256: String,
  pub size: u64,
}

impl Artifact {
  /// Hash a produced file and describe it
  pub fn from_file(shard: &ShardKey, path: &Path) -> RailResult<Self> {
    let (sha256, size) = hash_file(path)?;
    Ok(Self {
      kind: ArtifactKind::from_path(path),
      channel: shard.channel.clone(),
      shard: shard.clone(),
      path: path.to_path_buf(),
      sha256,
      size,
    })
  }

  pub fn file_name(&self) -> String {
    self
      .path
      .file_name()
      .map(|n| n.to_string_lossy().to_string())
      .unwrap_or_default()
  }
}

/// SHA-256 and size of a file, streamed
pub fn hash_file(path: &Path) -> RailResult<(String, u64)> {
  let mut file = fs::File::open(path).with_context(|| format!("Failed to open artifact {}", path.display()))?;
  let mut hasher = Sha256::new();
  let size = io::copy(&mut file, &mut hasher)?;
  Ok((hex::encode(hasher.finalize()), size))
}

/// Append-only record of what each shard produced
#[derive(Debug, Default)]
pub struct ArtifactStore {
  shards: Mutex<BTreeMap<ShardKey, Vec<Artifact>>>,
}

impl ArtifactStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a shard's artifacts; each key can be written once
  pub fn record(&self, key: &ShardKey, artifacts: Vec<Artifact>) -> RailResult<()> {
    let mut shards = self
      .shards
      .lock()
      .map_err(|_| RailError::message("Artifact store lock poisoned"))?;

    if shards.contains_key(key) {
      return Err(RailError::message(format!("Artifacts for shard {} were already recorded", key)));
    }
    shards.insert(key.clone(), artifacts);
    Ok(())
  }

  pub fn get(&self, key: &ShardKey) -> Option<Vec<Artifact>> {
    self.shards.lock().ok()?.get(key).cloned()
  }

  /// Number of shards with recorded artifacts
  pub fn len(&self) -> usize {
    self.shards.lock().map(|s| s.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Deduplicated artifact set of one channel, ready for upload
///
/// Written once by the aggregator, read-only afterwards.
#[derive(Debug, Serialize)]
pub struct StagingSet {
  channel: String,
  version: ReleaseVersion,
  dir: PathBuf,
  artifacts: Vec<Artifact>,
}

impl StagingSet {
  pub fn version(&self) -> &ReleaseVersion {
    &self.version
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Staged artifacts; paths point into the staging directory
  pub fn artifacts(&self) -> &[Artifact] {
    &self.artifacts
  }

  pub fn paths(&self) -> Vec<PathBuf> {
    self.artifacts.iter().map(|a| a.path.clone()).collect()
  }

  /// Check that every staged file still exists with the recorded hash
  pub fn verify(&self) -> RailResult<()> {
    for artifact in &self.artifacts {
      let (sha, _) = hash_file(&artifact.path)?;
      if sha != artifact.sha256 {
        return Err(RailError::message(format!(
          "Staged artifact {} changed after aggregation",
          artifact.path.display()
        )));
      }
    }
    Ok(())
  }
}

/// Fan-in of one channel's shards
pub struct ArtifactAggregator<'a> {
  store: &'a ArtifactStore,
  staging_root: &'a Path,
}

impl<'a> ArtifactAggregator<'a> {
  pub fn new(store: &'a ArtifactStore, staging_root: &'a Path) -> Self {
    Self { store, staging_root }
  }

  /// Stage the channel if every required shard succeeded
  ///
  /// `succeeded` lists the channel's shards that finished successfully;
  /// artifacts of succeeded optional shards are staged too.
  pub fn aggregate(
    &self,
    channel: &str,
    version: &ReleaseVersion,
    required: &[ShardKey],
    succeeded: &[ShardKey],
  ) -> RailResult<Arc<StagingSet>> {
    let done: HashSet<&ShardKey> = succeeded.iter().collect();
    let missing: Vec<String> = required
      .iter()
      .filter(|k| !done.contains(k))
      .map(|k| k.shard_name())
      .collect();

    if !missing.is_empty() {
      return Err(
        ReleaseError::IncompleteArtifactSet {
          channel: channel.to_string(),
          missing,
        }
        .into(),
      );
    }

    let mut by_hash: HashSet<String> = HashSet::new();
    let mut by_name: HashMap<String, String> = HashMap::new();
    let mut selected = Vec::new();

    for key in succeeded {
      for artifact in self.store.get(key).unwrap_or_default() {
        let name = artifact.file_name();
        if let Some(existing) = by_name.get(&name)
          && *existing != artifact.sha256
        {
          return Err(RailError::with_help(
            format!(
              "Staging collision in channel '{}': two different files named {}",
              channel, name
            ),
            "Make the build command include the platform or architecture in artifact names",
          ));
        }
        if !by_hash.insert(artifact.sha256.clone()) {
          continue;
        }
        by_name.insert(name, artifact.sha256.clone());
        selected.push(artifact);
      }
    }

    let dir = self.staging_root.join(channel);
    if dir.exists() {
      fs::remove_dir_all(&dir).with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(&dir)?;

    let mut staged = Vec::with_capacity(selected.len());
    for artifact in selected {
      let dest = dir.join(artifact.file_name());
      fs::copy(&artifact.path, &dest)
        .with_context(|| format!("Failed to stage {}", artifact.path.display()))?;
      staged.push(Artifact { path: dest, ..artifact });
    }

    tracing::debug!(channel, artifacts = staged.len(), "staged channel artifacts");

    Ok(Arc::new(StagingSet {
      channel: channel.to_string(),
      version: version.clone(),
      dir,
      artifacts: staged,
    }))
  }
}
