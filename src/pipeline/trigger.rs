//! Trigger events: a run must start from the commit the push announced

use crate::core::error::{RailError, RailResult, ResultExt, ValidationError};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Push event as delivered by the CI system
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TriggerEvent {
  /// Full ref that was pushed, e.g. `refs/heads/main`
  #[serde(rename = "ref")]
  pub git_ref: String,
  /// Commit the ref points at after the push
  pub after: String,
}

impl TriggerEvent {
  pub fn load(path: &Path) -> RailResult<Self> {
    let content =
      fs::read_to_string(path).with_context(|| format!("Failed to read trigger event {}", path.display()))?;
    serde_json::from_str(&content)
      .map_err(|e| RailError::message(format!("Invalid trigger event {}: {}", path.display(), e)))
  }

  /// Refuse events for another branch or for a commit that is no longer HEAD
  pub fn verify(&self, mainline: &str, head: &str) -> RailResult<()> {
    let branch = self.git_ref.strip_prefix("refs/heads/").unwrap_or(&self.git_ref);
    if branch != mainline {
      return Err(RailError::Validation(ValidationError::StaleTrigger {
        expected: format!("refs/heads/{}", mainline),
        found: self.git_ref.clone(),
      }));
    }

    if !head.starts_with(&self.after) || self.after.len() < 7 {
      return Err(RailError::Validation(ValidationError::StaleTrigger {
        expected: head.to_string(),
        found: self.after.clone(),
      }));
    }

    Ok(())
  }
}
