//! Run report: every stage with its terminal status, error and disposition

use crate::core::error::ExitCode;
use crate::pipeline::graph::{JobKind, JobStatus};
use crate::pipeline::scheduler::{JobRecord, Schedule};
use serde::Serialize;
use std::fmt;

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
  /// Release went out and every channel published
  Released,
  /// No commit warranted a release
  NothingToRelease,
  /// Release went out but at least one channel did not publish
  PartialFailure,
  /// A root stage failed; nothing was released
  Failed,
}

impl fmt::Display for RunOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      RunOutcome::Released => "released",
      RunOutcome::NothingToRelease => "nothing to release",
      RunOutcome::PartialFailure => "partial failure",
      RunOutcome::Failed => "failed",
    };
    f.write_str(label)
  }
}

/// Per-channel summary line
#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
  pub channel: String,
  pub published: bool,
  pub shards_succeeded: usize,
  pub shards_total: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
  pub outcome: RunOutcome,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
  pub dry_run: bool,
  pub channels: Vec<ChannelReport>,
  pub stages: Vec<JobRecord>,
}

impl RunReport {
  pub fn from_schedule(schedule: &Schedule, version: Option<String>, tag: Option<String>, dry_run: bool) -> Self {
    let stages = schedule.records.clone();
    let channels = channel_reports(&stages);

    let root_failed = stages
      .iter()
      .any(|r| r.kind.is_root_stage() && r.status == JobStatus::Failed);
    let halted_at_resolve = schedule.halted_by.as_deref() == Some(JobKind::ResolveVersion.id().as_str());

    let outcome = if root_failed {
      RunOutcome::Failed
    } else if halted_at_resolve {
      RunOutcome::NothingToRelease
    } else if channels.iter().any(|c| !c.published) {
      RunOutcome::PartialFailure
    } else {
      RunOutcome::Released
    };

    Self {
      outcome,
      version,
      tag,
      dry_run,
      channels,
      stages,
    }
  }

  pub fn exit_code(&self) -> i32 {
    match self.outcome {
      RunOutcome::Released | RunOutcome::NothingToRelease => 0,
      RunOutcome::Failed => ExitCode::User.as_i32(),
      RunOutcome::PartialFailure => ExitCode::Partial.as_i32(),
    }
  }

  pub fn stage(&self, id: &str) -> Option<&JobRecord> {
    self.stages.iter().find(|r| r.id == id)
  }

  /// Failed stages, in graph order
  pub fn failures(&self) -> impl Iterator<Item = &JobRecord> {
    self.stages.iter().filter(|r| r.status == JobStatus::Failed)
  }

  pub fn print_text(&self) {
    println!();
    match self.outcome {
      RunOutcome::Released => println!(
        "✅ Released {}",
        self.tag.as_deref().or(self.version.as_deref()).unwrap_or("")
      ),
      RunOutcome::NothingToRelease => println!("⚠️  Nothing to release"),
      RunOutcome::PartialFailure => println!(
        "⚠️  Released {} with failed channels",
        self.tag.as_deref().or(self.version.as_deref()).unwrap_or("")
      ),
      RunOutcome::Failed => println!("❌ Release failed"),
    }
    if self.dry_run {
      println!("🔍 Dry-run mode (no uploads)");
    }
    println!();

    println!("  Stages:");
    for record in &self.stages {
      println!("    {} {}", status_icon(record.status), record.id);
      if let Some(note) = &record.note
        && !note.is_empty()
      {
        println!("       {}", note);
      }
      if let Some(error) = &record.error {
        for (i, line) in error.message.lines().enumerate() {
          if i == 0 {
            println!("       {} ({})", line, error.disposition);
          } else {
            println!("       {}", line);
          }
        }
      }
    }

    if !self.channels.is_empty() {
      println!();
      println!("  Channels:");
      for channel in &self.channels {
        let icon = if channel.published { "✅" } else { "❌" };
        println!(
          "    {} {} ({}/{} shards)",
          icon, channel.channel, channel.shards_succeeded, channel.shards_total
        );
      }
    }
  }

  pub fn to_json(&self) -> serde_json::Result<String> {
    serde_json::to_string_pretty(self)
  }
}

fn status_icon(status: JobStatus) -> &'static str {
  match status {
    JobStatus::Succeeded => "✅",
    JobStatus::Failed => "❌",
    JobStatus::Skipped => "⏭️ ",
    JobStatus::Pending | JobStatus::Running => "⏳",
  }
}

fn channel_reports(stages: &[JobRecord]) -> Vec<ChannelReport> {
  stages
    .iter()
    .filter_map(|r| match &r.kind {
      JobKind::PublishRegistry { channel } => Some((channel, r)),
      _ => None,
    })
    .map(|(channel, publish)| {
      let shards: Vec<&JobRecord> = stages
        .iter()
        .filter(|r| matches!(&r.kind, JobKind::BuildShard { shard } if &shard.channel == channel))
        .collect();
      ChannelReport {
        channel: channel.clone(),
        published: publish.status == JobStatus::Succeeded,
        shards_succeeded: shards.iter().filter(|r| r.status == JobStatus::Succeeded).count(),
        shards_total: shards.len(),
        note: publish.note.clone(),
      }
    })
    .collect()
}
