//! Version resolution: classify commits since the last tag, pick the bump
//!
//! Pure over history. `resolve` only looks at the commits it is given;
//! `resolve_from_repo` gathers those commits from git first.

use crate::core::error::{ReleaseError, RailResult};
use crate::core::vcs::{CommitInfo, SystemGit};
use crate::release::version::ReleaseVersion;
use serde::Serialize;

/// Version bump type based on conventional commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionBump {
  /// No relevant changes
  None,
  /// Bug fixes and performance work
  Patch,
  /// New features
  Minor,
  /// Breaking changes
  Major,
}

impl VersionBump {
  /// Apply bump to a version; the pre-release label is dropped
  pub fn apply(&self, version: &ReleaseVersion) -> Result<ReleaseVersion, ReleaseError> {
    let overflow = || ReleaseError::VersionOverflow {
      version: version.to_string(),
      bump: format!("{:?}", self).to_lowercase(),
    };
    Ok(match self {
      VersionBump::Major => ReleaseVersion::new(version.major.checked_add(1).ok_or_else(overflow)?, 0, 0),
      VersionBump::Minor => ReleaseVersion::new(version.major, version.minor.checked_add(1).ok_or_else(overflow)?, 0),
      VersionBump::Patch => ReleaseVersion::new(
        version.major,
        version.minor,
        version.patch.checked_add(1).ok_or_else(overflow)?,
      ),
      VersionBump::None => version.clone(),
    })
  }
}

/// Release-relevant class of a single commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeClass {
  Breaking,
  Feature,
  Fix,
  None,
}

impl ChangeClass {
  /// Classify a commit message by its conventional-commit header and footers
  pub fn classify(message: &str) -> Self {
    let subject = message.lines().next().unwrap_or("").trim();

    let Some((header, _)) = subject.split_once(':') else {
      return if has_breaking_footer(message) {
        ChangeClass::Breaking
      } else {
        ChangeClass::None
      };
    };

    let bang = header.ends_with('!');
    let header = header.trim_end_matches('!');
    // Strip an optional scope: feat(parser)
    let kind = header.split('(').next().unwrap_or("").trim().to_lowercase();

    if kind.is_empty() || kind.contains(char::is_whitespace) {
      return ChangeClass::None;
    }

    if bang || has_breaking_footer(message) {
      return ChangeClass::Breaking;
    }

    match kind.as_str() {
      "feat" | "feature" => ChangeClass::Feature,
      "fix" | "perf" => ChangeClass::Fix,
      _ => ChangeClass::None,
    }
  }

  pub fn bump(&self) -> VersionBump {
    match self {
      ChangeClass::Breaking => VersionBump::Major,
      ChangeClass::Feature => VersionBump::Minor,
      ChangeClass::Fix => VersionBump::Patch,
      ChangeClass::None => VersionBump::None,
    }
  }
}

fn has_breaking_footer(message: &str) -> bool {
  message
    .lines()
    .skip(1)
    .any(|line| line.starts_with("BREAKING CHANGE:") || line.starts_with("BREAKING-CHANGE:"))
}

/// A commit with its classification, kept for reports
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedCommit {
  pub sha: String,
  pub subject: String,
  pub class: ChangeClass,
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
  pub previous: ReleaseVersion,
  /// Tag of the previous release, None for a first release
  pub previous_tag: Option<String>,
  pub next: ReleaseVersion,
  pub bump: VersionBump,
  pub commits: Vec<ClassifiedCommit>,
}

/// Computes the next release version from history
#[derive(Debug, Clone)]
pub struct VersionResolver {
  tag_prefix: String,
  initial: ReleaseVersion,
  prerelease: Option<String>,
}

impl VersionResolver {
  pub fn new(tag_prefix: impl Into<String>, initial: ReleaseVersion, prerelease: Option<String>) -> Self {
    Self {
      tag_prefix: tag_prefix.into(),
      initial,
      prerelease,
    }
  }

  /// Highest version among tags carrying our prefix
  pub fn last_release<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> Option<(String, ReleaseVersion)> {
    tags
      .into_iter()
      .filter_map(|tag| ReleaseVersion::from_tag(tag, &self.tag_prefix).map(|v| (tag.to_string(), v)))
      .max_by(|a, b| a.1.cmp(&b.1))
  }

  /// Resolve the next version from the commits after `previous`
  pub fn resolve(
    &self,
    previous: ReleaseVersion,
    previous_tag: Option<String>,
    commits: &[CommitInfo],
  ) -> Result<Resolution, ReleaseError> {
    let classified: Vec<ClassifiedCommit> = commits
      .iter()
      .map(|c| ClassifiedCommit {
        sha: c.sha.clone(),
        subject: c.subject().to_string(),
        class: ChangeClass::classify(&c.message),
      })
      .collect();

    let bump = classified
      .iter()
      .map(|c| c.class.bump())
      .max()
      .unwrap_or(VersionBump::None);

    if bump == VersionBump::None {
      return Err(ReleaseError::NoReleasableChange { since: previous_tag });
    }

    let mut next = bump.apply(&previous)?;
    if let Some(label) = &self.prerelease {
      next = next.with_pre(label.clone());
    }

    // Bumping always grows the triple, so the label cannot make it smaller
    debug_assert!(next > previous, "resolved {} is not greater than {}", next, previous);

    Ok(Resolution {
      previous,
      previous_tag,
      next,
      bump,
      commits: classified,
    })
  }

  /// Gather tags and commits from git, then resolve
  pub fn resolve_from_repo(&self, git: &SystemGit) -> RailResult<Resolution> {
    let tags = git.list_tags()?;
    let last = self.last_release(tags.iter().map(String::as_str));

    let (previous, previous_tag, since) = match last {
      Some((tag, version)) => {
        let sha = git.rev_parse(&tag)?;
        (version, Some(tag), Some(sha))
      }
      None => (self.initial.clone(), None, None),
    };

    let commits = git.commits_since(since.as_deref())?;
    tracing::debug!(
      commits = commits.len(),
      previous = %previous,
      "classifying commits since last release"
    );

    Ok(self.resolve(previous, previous_tag, &commits)?)
  }
}
