//! Version propagation across manifest files
//!
//! All-or-nothing: every pattern is applied to an in-memory copy of its file
//! first. Nothing touches disk unless every pattern matched exactly once, and
//! then each file is replaced through a temp file + rename.

use crate::core::config::ManifestPattern;
use crate::core::error::{PatternFailure, RailResult, ReleaseError, ResultExt};
use crate::release::version::ReleaseVersion;
use regex::RegexBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Contents of one manifest before and after propagation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDiff {
  /// Path relative to the repository root
  pub path: PathBuf,
  #[serde(skip)]
  pub old: String,
  #[serde(skip)]
  pub new: String,
}

impl FileDiff {
  pub fn is_change(&self) -> bool {
    self.old != self.new
  }
}

/// Rewrites every configured version location to a new release version
pub struct VersionPropagator<'a> {
  root: &'a Path,
  patterns: &'a [ManifestPattern],
}

impl<'a> VersionPropagator<'a> {
  pub fn new(root: &'a Path, patterns: &'a [ManifestPattern]) -> Self {
    Self { root, patterns }
  }

  /// Compute every edit in memory without writing
  ///
  /// Files appear in the order they are first named in the pattern list.
  /// Unchanged files are dropped from the result.
  pub fn stage(&self, version: &ReleaseVersion) -> Result<Vec<FileDiff>, ReleaseError> {
    let mut order: Vec<&Path> = Vec::new();
    let mut by_file: HashMap<&Path, Vec<&ManifestPattern>> = HashMap::new();
    for pattern in self.patterns {
      let file = pattern.file.as_path();
      by_file
        .entry(file)
        .or_insert_with(|| {
          order.push(file);
          Vec::new()
        })
        .push(pattern);
    }

    let mut failures = Vec::new();
    let mut diffs = Vec::new();

    for file in order {
      let patterns = &by_file[file];
      let old = match fs::read_to_string(self.root.join(file)) {
        Ok(text) => text,
        Err(e) => {
          failures.extend(patterns.iter().map(|p| PatternFailure {
            file: file.to_path_buf(),
            pattern: p.pattern.clone(),
            reason: format!("unreadable: {}", e),
          }));
          continue;
        }
      };

      let mut buffer = old.clone();
      for pattern in patterns {
        let value = version.field(pattern.field);
        match replace_once(&buffer, &pattern.pattern, &value) {
          Ok(updated) => buffer = updated,
          Err(reason) => failures.push(PatternFailure {
            file: file.to_path_buf(),
            pattern: pattern.pattern.clone(),
            reason,
          }),
        }
      }

      diffs.push(FileDiff {
        path: file.to_path_buf(),
        old,
        new: buffer,
      });
    }

    if !failures.is_empty() {
      return Err(ReleaseError::PatternMismatch { failures });
    }

    diffs.retain(FileDiff::is_change);
    Ok(diffs)
  }

  /// Stage, then write every changed file
  pub fn apply(&self, version: &ReleaseVersion) -> RailResult<Vec<FileDiff>> {
    let diffs = self.stage(version)?;
    self.write_all(&diffs, write_atomic)?;
    tracing::debug!(files = diffs.len(), version = %version, "propagated version");
    Ok(diffs)
  }

  /// Write the new contents of `diffs` in order
  ///
  /// A failed write puts the files already written back as they were.
  fn write_all(&self, diffs: &[FileDiff], write: impl Fn(&Path, &str) -> RailResult<()>) -> RailResult<()> {
    for (written, diff) in diffs.iter().enumerate() {
      if let Err(err) = write(&self.root.join(&diff.path), &diff.new) {
        if let Err(e) = restore_files(&self.root, &diffs[..written]) {
          tracing::warn!(error = %e, "failed to restore manifests after a partial write");
        }
        return Err(err);
      }
    }
    Ok(())
  }
}

/// Put the pre-propagation contents of `diffs` back under `root`
pub fn restore_files(root: &Path, diffs: &[FileDiff]) -> RailResult<()> {
  for diff in diffs {
    write_atomic(&root.join(&diff.path), &diff.old)?;
  }
  Ok(())
}

/// Replace the version region of the single match of `pattern` in `text`
///
/// The region is the `version` group, else group 1, else the whole match.
/// `^` and `$` match at line boundaries.
fn replace_once(text: &str, pattern: &str, value: &str) -> Result<String, String> {
  let re = RegexBuilder::new(pattern)
    .multi_line(true)
    .build()
    .map_err(|e| format!("invalid pattern: {}", e))?;

  let mut matches = re.captures_iter(text);
  let Some(caps) = matches.next() else {
    return Err("no match".to_string());
  };
  let extra = matches.count();
  if extra > 0 {
    return Err(format!("{} matches, expected exactly one", extra + 1));
  }

  let region = caps
    .name("version")
    .or_else(|| caps.get(1))
    .or_else(|| caps.get(0))
    .ok_or_else(|| "pattern matched but captured nothing".to_string())?;

  let mut out = String::with_capacity(text.len() + value.len());
  out.push_str(&text[..region.start()]);
  out.push_str(value);
  out.push_str(&text[region.end()..]);
  Ok(out)
}

/// Replace a file's contents through a sibling temp file + rename
///
/// An existing file keeps its permissions.
pub fn write_atomic(path: &Path, contents: &str) -> RailResult<()> {
  let dir = path.parent().unwrap_or_else(|| Path::new("."));
  let mut tmp = tempfile::NamedTempFile::new_in(dir)
    .with_context(|| format!("Failed to create temp file next to {}", path.display()))?;
  tmp.write_all(contents.as_bytes())?;
  if let Ok(meta) = fs::metadata(path) {
    tmp
      .as_file()
      .set_permissions(meta.permissions())
      .with_context(|| format!("Failed to copy permissions of {}", path.display()))?;
  }
  tmp
    .persist(path)
    .map_err(|e| e.error)
    .with_context(|| format!("Failed to replace {}", path.display()))?;
  Ok(())
}
