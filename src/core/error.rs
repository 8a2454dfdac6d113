//! Error types for release-rail with contextual messages and exit codes
//!
//! Every error is categorized so the CLI can pick an exit code and print a
//! help line. Release stage failures live in [`ReleaseError`]; each one knows
//! whether re-running is safe or a human has to fix something first.

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Exit codes for release-rail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
  /// User error (config, invalid args, missing files)
  User = 1,
  /// System error (git, network, I/O)
  System = 2,
  /// Validation failure (bad patterns, stale trigger)
  Validation = 3,
  /// Release went out but one or more channels did not publish
  Partial = 4,
}

impl ExitCode {
  /// Convert to i32 for process exit
  pub fn as_i32(self) -> i32 {
    self as i32
  }
}

/// Main error type for release-rail
#[derive(Debug)]
pub enum RailError {
  /// Configuration errors
  Config(ConfigError),

  /// Git operation errors
  Git(GitError),

  /// Validation errors
  Validation(ValidationError),

  /// Release stage errors (resolve, propagate, publish, sync, channels)
  Release(ReleaseError),

  /// I/O errors
  Io(io::Error),

  /// Generic error with message and optional context
  Message {
    message: String,
    context: Option<String>,
    help: Option<String>,
  },
}

impl RailError {
  /// Create a simple error message
  pub fn message(msg: impl Into<String>) -> Self {
    RailError::Message {
      message: msg.into(),
      context: None,
      help: None,
    }
  }

  /// Create an error with help text
  pub fn with_help(msg: impl Into<String>, help: impl Into<String>) -> Self {
    RailError::Message {
      message: msg.into(),
      context: None,
      help: Some(help.into()),
    }
  }

  /// Add context to an existing error
  pub fn context(self, ctx: impl Into<String>) -> Self {
    let ctx_str = ctx.into();
    match self {
      RailError::Message { message, context, help } => RailError::Message {
        message,
        context: Some(context.map(|c| format!("{}\n{}", ctx_str, c)).unwrap_or(ctx_str)),
        help,
      },
      _ => self,
    }
  }

  /// Get the appropriate exit code for this error
  pub fn exit_code(&self) -> ExitCode {
    match self {
      RailError::Config(_) => ExitCode::User,
      RailError::Git(_) => ExitCode::System,
      RailError::Validation(_) => ExitCode::Validation,
      RailError::Release(e) => match e.disposition() {
        Disposition::Retryable => ExitCode::System,
        _ => ExitCode::User,
      },
      RailError::Io(_) => ExitCode::System,
      RailError::Message { .. } => ExitCode::User,
    }
  }

  /// Get contextual help message for this error
  pub fn help_message(&self) -> Option<String> {
    match self {
      RailError::Config(e) => e.help_message(),
      RailError::Git(e) => e.help_message(),
      RailError::Validation(e) => e.help_message(),
      RailError::Release(e) => e.help_message(),
      RailError::Message { help, .. } => help.clone(),
      _ => None,
    }
  }

  /// Release error carried by this error, if any
  pub fn as_release(&self) -> Option<&ReleaseError> {
    match self {
      RailError::Release(e) => Some(e),
      _ => None,
    }
  }

  /// How a human should react to this error
  pub fn disposition(&self) -> Disposition {
    match self {
      RailError::Release(e) => e.disposition(),
      RailError::Git(_) | RailError::Io(_) => Disposition::Retryable,
      _ => Disposition::NeedsFix,
    }
  }
}

impl fmt::Display for RailError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RailError::Config(e) => write!(f, "{}", e),
      RailError::Git(e) => write!(f, "{}", e),
      RailError::Validation(e) => write!(f, "{}", e),
      RailError::Release(e) => write!(f, "{}", e),
      RailError::Io(e) => write!(f, "I/O error: {}", e),
      RailError::Message { message, context, .. } => {
        write!(f, "{}", message)?;
        if let Some(ctx) = context {
          write!(f, "\n{}", ctx)?;
        }
        Ok(())
      }
    }
  }
}

impl std::error::Error for RailError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      RailError::Io(e) => Some(e),
      _ => None,
    }
  }
}

impl From<io::Error> for RailError {
  fn from(err: io::Error) -> Self {
    RailError::Io(err)
  }
}

impl From<String> for RailError {
  fn from(msg: String) -> Self {
    RailError::message(msg)
  }
}

impl From<&str> for RailError {
  fn from(msg: &str) -> Self {
    RailError::message(msg)
  }
}

impl From<ReleaseError> for RailError {
  fn from(err: ReleaseError) -> Self {
    RailError::Release(err)
  }
}

impl From<toml_edit::de::Error> for RailError {
  fn from(err: toml_edit::de::Error) -> Self {
    RailError::message(format!("TOML deserialization error: {}", err))
  }
}

impl From<serde_json::Error> for RailError {
  fn from(err: serde_json::Error) -> Self {
    RailError::message(format!("JSON error: {}", err))
  }
}

impl From<semver::Error> for RailError {
  fn from(err: semver::Error) -> Self {
    RailError::message(format!("Version parse error: {}", err))
  }
}

impl From<regex::Error> for RailError {
  fn from(err: regex::Error) -> Self {
    RailError::message(format!("Invalid pattern: {}", err))
  }
}

impl From<glob::PatternError> for RailError {
  fn from(err: glob::PatternError) -> Self {
    RailError::message(format!("Invalid glob: {}", err))
  }
}

/// Configuration-related errors
#[derive(Debug)]
pub enum ConfigError {
  /// rail.toml not found
  NotFound { workspace_root: PathBuf },

  /// Missing required field
  MissingField { field: String },

  /// Field present but unusable
  InvalidField { field: String, reason: String },

  /// Channel not found in configuration
  ChannelNotFound { name: String },
}

impl ConfigError {
  fn help_message(&self) -> Option<String> {
    match self {
      ConfigError::NotFound { .. } => {
        Some("Create a rail.toml with a [release] section and at least one [[manifests]] entry.".to_string())
      }
      ConfigError::ChannelNotFound { name } => Some(format!(
        "List configured channels with `release-rail matrix`. No [[channels]] entry is named '{}'.",
        name
      )),
      ConfigError::MissingField { field } if field.contains("full") => {
        Some("Add a [[manifests]] entry with field = \"full\" so the full version string is recorded.".to_string())
      }
      _ => None,
    }
  }
}

impl fmt::Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConfigError::NotFound { workspace_root } => {
        write!(
          f,
          "No release-rail configuration found.\nExpected file: {}/rail.toml",
          workspace_root.display()
        )
      }
      ConfigError::MissingField { field } => {
        write!(f, "Missing required field in config: {}", field)
      }
      ConfigError::InvalidField { field, reason } => {
        write!(f, "Invalid value for '{}': {}", field, reason)
      }
      ConfigError::ChannelNotFound { name } => {
        write!(f, "Channel '{}' not found in configuration", name)
      }
    }
  }
}

/// Git operation errors
#[derive(Debug)]
pub enum GitError {
  /// Git command failed
  CommandFailed { command: String, stderr: String },

  /// Repository not found
  RepoNotFound { path: PathBuf },

  /// Commit not found
  CommitNotFound { sha: String },

  /// Push failed
  PushFailed {
    remote: String,
    branch: String,
    reason: String,
  },
}

impl GitError {
  fn help_message(&self) -> Option<String> {
    match self {
      GitError::PushFailed { reason, .. } => {
        if reason.contains("non-fast-forward") || reason.contains("stale info") {
          Some("The remote moved since this run started. Re-run after the next mainline merge.".to_string())
        } else if reason.contains("permission denied") || reason.contains("403") {
          Some("Check that the push credential has write access to the mainline branch.".to_string())
        } else {
          None
        }
      }
      GitError::RepoNotFound { path } => Some(format!(
        "Run release-rail from inside a git repository (looked at {})",
        path.display()
      )),
      _ => None,
    }
  }
}

impl fmt::Display for GitError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      GitError::CommandFailed { command, stderr } => {
        write!(f, "Git command failed: {}\n{}", command, stderr)
      }
      GitError::RepoNotFound { path } => {
        write!(f, "Git repository not found at: {}", path.display())
      }
      GitError::CommitNotFound { sha } => {
        write!(f, "Commit not found: {}", sha)
      }
      GitError::PushFailed { remote, branch, reason } => {
        write!(f, "Push to {}/{} failed: {}", remote, branch, reason)
      }
    }
  }
}

/// Validation errors
#[derive(Debug)]
pub enum ValidationError {
  /// Trigger event does not describe the state we are about to release
  StaleTrigger { expected: String, found: String },

  /// Job graph violates its structural invariants
  InvalidGraph { reason: String },
}

impl ValidationError {
  fn help_message(&self) -> Option<String> {
    match self {
      ValidationError::StaleTrigger { .. } => {
        Some("The mainline moved after the trigger fired. Let the newer trigger perform the release.".to_string())
      }
      ValidationError::InvalidGraph { .. } => None,
    }
  }
}

impl fmt::Display for ValidationError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ValidationError::StaleTrigger { expected, found } => {
        write!(f, "Trigger event is stale: expected {}, found {}", expected, found)
      }
      ValidationError::InvalidGraph { reason } => {
        write!(f, "Invalid job graph: {}", reason)
      }
    }
  }
}

/// How a failed stage should be handled by a human
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
  /// Not a failure (nothing to release, idempotent replay)
  Informational,
  /// Transient; re-running the release is safe
  Retryable,
  /// Needs a manual fix before re-running
  NeedsFix,
}

impl fmt::Display for Disposition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Disposition::Informational => "informational",
      Disposition::Retryable => "safe to re-run",
      Disposition::NeedsFix => "needs manual fix",
    };
    f.write_str(label)
  }
}

/// One manifest pattern that could not be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternFailure {
  pub file: PathBuf,
  pub pattern: String,
  pub reason: String,
}

/// Release stage failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseError {
  /// No commit since the last tag warrants a version bump
  NoReleasableChange { since: Option<String> },

  /// One or more manifest patterns did not match exactly once
  PatternMismatch { failures: Vec<PatternFailure> },

  /// Tag for this version already exists
  PublishConflict { tag: String },

  /// Secondary branch could not be rebased onto mainline
  RebaseConflict { branch: String, onto: String, detail: String },

  /// Required shards of a channel did not succeed
  IncompleteArtifactSet { channel: String, missing: Vec<String> },

  /// Registry refused the credential (transient)
  RegistryAuthError { channel: String, registry: String, detail: String },

  /// Registry refused the upload itself
  RegistryRejected { channel: String, registry: String, detail: String },

  /// Build shard exceeded its time budget
  ShardTimeout { shard: String, timeout: String },

  /// Bumping a version component would overflow it
  VersionOverflow { version: String, bump: String },
}

impl ReleaseError {
  /// Short stable identifier used in reports
  pub fn code(&self) -> &'static str {
    match self {
      ReleaseError::NoReleasableChange { .. } => "NoReleasableChange",
      ReleaseError::PatternMismatch { .. } => "PatternMismatch",
      ReleaseError::PublishConflict { .. } => "PublishConflict",
      ReleaseError::RebaseConflict { .. } => "RebaseConflict",
      ReleaseError::IncompleteArtifactSet { .. } => "IncompleteArtifactSet",
      ReleaseError::RegistryAuthError { .. } => "RegistryAuthError",
      ReleaseError::RegistryRejected { .. } => "RegistryRejected",
      ReleaseError::ShardTimeout { .. } => "ShardTimeout",
      ReleaseError::VersionOverflow { .. } => "VersionOverflow",
    }
  }

  pub fn disposition(&self) -> Disposition {
    match self {
      ReleaseError::NoReleasableChange { .. } | ReleaseError::PublishConflict { .. } => Disposition::Informational,
      ReleaseError::RegistryAuthError { .. } | ReleaseError::ShardTimeout { .. } => Disposition::Retryable,
      ReleaseError::PatternMismatch { .. }
      | ReleaseError::RebaseConflict { .. }
      | ReleaseError::IncompleteArtifactSet { .. }
      | ReleaseError::RegistryRejected { .. }
      | ReleaseError::VersionOverflow { .. } => Disposition::NeedsFix,
    }
  }

  fn help_message(&self) -> Option<String> {
    match self {
      ReleaseError::NoReleasableChange { .. } => {
        Some("Only feat, fix, perf and breaking commits produce a release.".to_string())
      }
      ReleaseError::PatternMismatch { .. } => {
        Some("Fix the listed [[manifests]] patterns; run `release-rail check` to verify.".to_string())
      }
      ReleaseError::RebaseConflict { branch, .. } => Some(format!(
        "Rebase '{}' manually and force-push it; the release itself is unaffected.",
        branch
      )),
      ReleaseError::RegistryAuthError { .. } => {
        Some("Check the channel credential, then re-run; already-published channels are skipped.".to_string())
      }
      _ => None,
    }
  }
}

impl fmt::Display for ReleaseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReleaseError::NoReleasableChange { since } => match since {
        Some(tag) => write!(f, "No releasable change since {}", tag),
        None => write!(f, "No releasable change in history"),
      },
      ReleaseError::PatternMismatch { failures } => {
        write!(f, "Version propagation aborted, {} pattern(s) failed:", failures.len())?;
        for failure in failures {
          write!(
            f,
            "\n  {} `{}`: {}",
            failure.file.display(),
            failure.pattern,
            failure.reason
          )?;
        }
        Ok(())
      }
      ReleaseError::PublishConflict { tag } => write!(f, "Release {} already exists", tag),
      ReleaseError::RebaseConflict { branch, onto, detail } => {
        write!(f, "Cannot rebase '{}' onto {}: {}", branch, onto, detail)
      }
      ReleaseError::IncompleteArtifactSet { channel, missing } => {
        write!(f, "Channel '{}' is missing shards: {}", channel, missing.join(", "))
      }
      ReleaseError::RegistryAuthError {
        channel,
        registry,
        detail,
      } => write!(f, "Authentication to {} failed for '{}': {}", registry, channel, detail),
      ReleaseError::RegistryRejected {
        channel,
        registry,
        detail,
      } => write!(f, "{} rejected the upload for '{}': {}", registry, channel, detail),
      ReleaseError::ShardTimeout { shard, timeout } => {
        write!(f, "Shard {} timed out after {}", shard, timeout)
      }
      ReleaseError::VersionOverflow { version, bump } => {
        write!(f, "Cannot apply a {} bump to {}: component overflows", bump, version)
      }
    }
  }
}

/// Result type alias for release-rail
pub type RailResult<T> = Result<T, RailError>;

/// Helper trait to add context to Results
pub trait ResultExt<T> {
  /// Add context to an error result
  fn context(self, ctx: impl Into<String>) -> RailResult<T>;

  /// Add context using a closure (lazy evaluation)
  fn with_context<F>(self, f: F) -> RailResult<T>
  where
    F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
  E: Into<RailError>,
{
  fn context(self, ctx: impl Into<String>) -> RailResult<T> {
    self.map_err(|e| e.into().context(ctx))
  }

  fn with_context<F>(self, f: F) -> RailResult<T>
  where
    F: FnOnce() -> String,
  {
    self.map_err(|e| e.into().context(f()))
  }
}

/// Pretty-print an error to stderr with help text
pub fn print_error(error: &RailError) {
  eprintln!("\n❌ {}\n", error);

  if let Some(help) = error.help_message() {
    eprintln!("💡 Help: {}\n", help);
  }
}

impl From<anyhow::Error> for RailError {
  fn from(err: anyhow::Error) -> Self {
    RailError::message(err.to_string())
  }
}
