//! Registry publishing with an idempotency ledger
//!
//! A (channel, version) pair is published at most once. The ledger is the
//! local memory of past uploads; the registry itself is asked too, so a
//! lost ledger never causes a second upload.

use crate::core::config::{ChannelConfig, PublishMode};
use crate::core::error::{ConfigError, RailError, RailResult, ReleaseError, ResultExt};
use crate::pipeline::artifacts::StagingSet;
use crate::pipeline::process::run_command;
use crate::pipeline::retry::{RetryConfig, retry_with_backoff};
use crate::release::propagate::write_atomic;
use crate::release::version::ReleaseVersion;
use crate::utils::render_template;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

/// A credential value; never printed
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  pub fn expose(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for Secret {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Secret(***)")
  }
}

impl fmt::Display for Secret {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("***")
  }
}

/// Where and how one channel publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishTarget {
  pub channel: String,
  pub registry: String,
  /// Environment variable holding the token, read at upload time
  pub credential: Option<String>,
  pub mode: PublishMode,
}

impl PublishTarget {
  pub fn from_channel(channel: &ChannelConfig) -> Self {
    Self {
      channel: channel.name.clone(),
      registry: channel.registry.clone(),
      credential: channel.credential.clone(),
      mode: channel.mode,
    }
  }

  /// At most one successful publish per key
  pub fn idempotency_key(&self, version: &ReleaseVersion) -> (String, String) {
    (self.channel.clone(), version.to_string())
  }

  /// Read the credential from its environment variable
  pub fn resolve_credential(&self) -> RailResult<Option<Secret>> {
    let Some(var) = &self.credential else {
      return Ok(None);
    };
    match std::env::var(var) {
      Ok(value) if !value.is_empty() => Ok(Some(Secret(value))),
      _ => Err(RailError::Config(ConfigError::MissingField {
        field: format!("environment variable {} (credential for '{}')", var, self.channel),
      })),
    }
  }
}

/// Why a registry refused an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
  /// Credential refused; may be transient (token propagation, rate limits)
  Auth(String),
  /// Upload refused for good
  Rejected(String),
}

/// Package-manager client for one registry
pub trait RegistryClient: Send + Sync {
  /// Whether `version` is already available on the registry
  fn is_published(&self, version: &ReleaseVersion) -> RailResult<bool>;

  /// Upload every artifact of the staging set
  fn upload(&self, set: &StagingSet, credential: Option<&Secret>) -> Result<(), RegistryError>;
}

/// Registry client that shells out to the channel's upload command
///
/// A standalone `{artifacts}` argument expands to one argument per staged
/// file. The token is handed over only through `upload_token_env`.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
  upload: Vec<String>,
  published_check: Vec<String>,
  token_env: Option<String>,
  workdir: PathBuf,
}

impl CommandRegistry {
  pub fn new(upload: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
    Self {
      upload,
      published_check: Vec::new(),
      token_env: None,
      workdir: workdir.into(),
    }
  }

  pub fn from_channel(channel: &ChannelConfig, workdir: &Path) -> Self {
    Self {
      upload: channel.upload.clone(),
      published_check: channel.published_check.clone(),
      token_env: channel.upload_token_env.clone(),
      workdir: workdir.to_path_buf(),
    }
  }

  fn render(&self, argv: &[String], version: &ReleaseVersion, set: Option<&StagingSet>) -> Vec<String> {
    let version = version.to_string();
    let staging = set.map(|s| s.dir().to_string_lossy().to_string()).unwrap_or_default();
    let vars = [("version", version.as_str()), ("staging_dir", staging.as_str())];

    let mut rendered = Vec::with_capacity(argv.len());
    for arg in argv {
      if arg == "{artifacts}" {
        if let Some(set) = set {
          rendered.extend(set.paths().iter().map(|p| p.to_string_lossy().to_string()));
        }
      } else {
        rendered.push(render_template(arg, &vars));
      }
    }
    rendered
  }
}

/// HTTP 401/403 as a standalone code, or a plain-words credential failure
///
/// Codes glued to digits, letters or dots (versions, sizes, line numbers)
/// do not count.
static AUTH_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(
    r"(?i)(?:^|[^\w.])e?40[13](?:[^\w.]|$)|\b(?:unauthori[sz]ed|forbidden|authentication (?:failed|required)|invalid (?:auth )?token)\b",
  )
  .unwrap_or_else(|e| unreachable!("auth failure pattern is valid: {}", e))
});

/// Heuristic for credential failures in a package manager's output
fn looks_like_auth_failure(output: &str) -> bool {
  AUTH_FAILURE.is_match(output)
}

impl RegistryClient for CommandRegistry {
  fn is_published(&self, version: &ReleaseVersion) -> RailResult<bool> {
    if self.published_check.is_empty() {
      return Ok(false);
    }
    let argv = self.render(&self.published_check, version, None);
    let output = run_command(&argv, &self.workdir, &[], None)?;
    Ok(output.success())
  }

  fn upload(&self, set: &StagingSet, credential: Option<&Secret>) -> Result<(), RegistryError> {
    let argv = self.render(&self.upload, set.version(), Some(set));

    let mut env = Vec::new();
    if let (Some(var), Some(secret)) = (&self.token_env, credential) {
      env.push((var.clone(), secret.expose().to_string()));
    }

    let output =
      run_command(&argv, &self.workdir, &env, None).map_err(|e| RegistryError::Rejected(e.to_string()))?;
    if output.success() {
      return Ok(());
    }

    let detail = output.summary();
    if looks_like_auth_failure(&output.stderr) || looks_like_auth_failure(&output.stdout) {
      Err(RegistryError::Auth(detail))
    } else {
      Err(RegistryError::Rejected(detail))
    }
  }
}

/// One successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
  pub channel: String,
  pub version: String,
  pub registry: String,
  pub published_at: DateTime<Utc>,
  pub artifacts: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
  #[serde(default)]
  entries: Vec<LedgerEntry>,
}

/// Persistent record of (channel, version) publishes
pub struct PublishLedger {
  path: PathBuf,
  lock: Mutex<()>,
}

impl PublishLedger {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lock: Mutex::new(()),
    }
  }

  fn read(&self) -> RailResult<LedgerFile> {
    if !self.path.exists() {
      return Ok(LedgerFile::default());
    }
    let content =
      fs::read_to_string(&self.path).with_context(|| format!("Failed to read {}", self.path.display()))?;
    Ok(serde_json::from_str(&content)?)
  }

  pub fn contains(&self, channel: &str, version: &ReleaseVersion) -> RailResult<bool> {
    let version = version.to_string();
    Ok(
      self
        .read()?
        .entries
        .iter()
        .any(|e| e.channel == channel && e.version == version),
    )
  }

  pub fn entries(&self) -> RailResult<Vec<LedgerEntry>> {
    Ok(self.read()?.entries)
  }

  /// Add an entry unless the key is already present
  pub fn record(&self, entry: LedgerEntry) -> RailResult<()> {
    let _guard = self
      .lock
      .lock()
      .map_err(|_| RailError::message("Publish ledger lock poisoned"))?;

    let mut ledger = self.read()?;
    if ledger
      .entries
      .iter()
      .any(|e| e.channel == entry.channel && e.version == entry.version)
    {
      return Ok(());
    }
    ledger.entries.push(entry);

    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    write_atomic(&self.path, &serde_json::to_string_pretty(&ledger)?)
  }
}

/// Where an "already published" answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishedVia {
  Ledger,
  Registry,
}

/// Result of publishing one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum PublishOutcome {
  Published { artifacts: usize, attempts: u32 },
  AlreadyPublished { via: PublishedVia },
  DryRun { artifacts: usize },
}

impl fmt::Display for PublishOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PublishOutcome::Published { artifacts, attempts } => {
        write!(f, "published {} artifact(s)", artifacts)?;
        if *attempts > 1 {
          write!(f, " after {} attempts", attempts)?;
        }
        Ok(())
      }
      PublishOutcome::AlreadyPublished { via } => match via {
        PublishedVia::Ledger => write!(f, "already published (ledger)"),
        PublishedVia::Registry => write!(f, "already published (registry)"),
      },
      PublishOutcome::DryRun { artifacts } => write!(f, "dry run, {} artifact(s) validated", artifacts),
    }
  }
}

/// Publishes a staged channel through a registry client
pub struct RegistryPublisher<'a> {
  client: &'a dyn RegistryClient,
  ledger: &'a PublishLedger,
  retry: &'a RetryConfig,
}

impl<'a> RegistryPublisher<'a> {
  pub fn new(client: &'a dyn RegistryClient, ledger: &'a PublishLedger, retry: &'a RetryConfig) -> Self {
    Self { client, ledger, retry }
  }

  /// Publish `set` to `target` unless that already happened
  ///
  /// `force_dry_run` overrides a publishing target for this call.
  pub fn publish(&self, target: &PublishTarget, set: &StagingSet, force_dry_run: bool) -> RailResult<PublishOutcome> {
    let version = set.version();

    if self.ledger.contains(&target.channel, version)? {
      tracing::info!(channel = %target.channel, version = %version, "already in publish ledger");
      return Ok(PublishOutcome::AlreadyPublished {
        via: PublishedVia::Ledger,
      });
    }

    if set.artifacts().is_empty() {
      return Err(RailError::message(format!(
        "Channel '{}' has nothing to publish",
        target.channel
      )));
    }
    set.verify()?;

    if force_dry_run || target.mode == PublishMode::DryRun {
      return Ok(PublishOutcome::DryRun {
        artifacts: set.artifacts().len(),
      });
    }

    if self.client.is_published(version)? {
      self.record(target, set)?;
      return Ok(PublishOutcome::AlreadyPublished {
        via: PublishedVia::Registry,
      });
    }

    let credential = target.resolve_credential()?;
    let mut attempts = 0;
    retry_with_backoff(
      self.retry,
      |attempt| {
        attempts = attempt;
        self.client.upload(set, credential.as_ref())
      },
      |e| matches!(e, RegistryError::Auth(_)),
    )
    .map_err(|e| match e {
      RegistryError::Auth(detail) => ReleaseError::RegistryAuthError {
        channel: target.channel.clone(),
        registry: target.registry.clone(),
        detail,
      },
      RegistryError::Rejected(detail) => ReleaseError::RegistryRejected {
        channel: target.channel.clone(),
        registry: target.registry.clone(),
        detail,
      },
    })?;

    self.record(target, set)?;
    Ok(PublishOutcome::Published {
      artifacts: set.artifacts().len(),
      attempts,
    })
  }

  fn record(&self, target: &PublishTarget, set: &StagingSet) -> RailResult<()> {
    self.ledger.record(LedgerEntry {
      channel: target.channel.clone(),
      version: set.version().to_string(),
      registry: target.registry.clone(),
      published_at: Utc::now(),
      artifacts: set.artifacts().len(),
    })
  }
}
