//! `release-rail plan`: what a run would do, without doing it

use crate::core::context::RunContext;
use crate::core::error::{RailResult, ReleaseError};
use crate::pipeline::plan::{PlannedJob, ReleasePlan};
use crate::release::resolve::{Resolution, VersionResolver};
use crate::release::version::ReleaseVersion;
use serde::Serialize;
use std::str::FromStr;

#[derive(Serialize)]
struct PlanView<'a> {
  /// None when there is nothing to release
  resolution: Option<&'a Resolution>,
  #[serde(skip_serializing_if = "Option::is_none")]
  reason: Option<String>,
  jobs: Vec<PlannedJob>,
}

pub fn run_plan(ctx: &RunContext, json: bool) -> RailResult<()> {
  let config = ctx.require_config()?;
  let settings = &config.release;

  let resolver = VersionResolver::new(
    settings.tag_prefix.clone(),
    ReleaseVersion::from_str(&settings.initial_version)?,
    settings.prerelease.clone(),
  );
  let (resolution, reason) = match resolver.resolve_from_repo(&ctx.git) {
    Ok(resolution) => (Some(resolution), None),
    Err(err) if matches!(err.as_release(), Some(ReleaseError::NoReleasableChange { .. })) => {
      (None, Some(err.to_string()))
    }
    Err(err) => return Err(err),
  };

  let plan = ReleasePlan::build(config)?;

  if json {
    let view = PlanView {
      resolution: resolution.as_ref(),
      reason,
      jobs: plan.jobs(),
    };
    println!("{}", serde_json::to_string_pretty(&view)?);
    return Ok(());
  }

  match &resolution {
    Some(resolution) => {
      println!("📦 Release Plan");
      println!();
      println!("  Current:  {}", resolution.previous);
      println!("  Next:     {} ({:?} bump)", resolution.next, resolution.bump);
      println!("  Tag:      {}", resolution.next.tag(&settings.tag_prefix));
      println!();
      println!("  Changes:");
      for commit in &resolution.commits {
        println!("    {} {}", &commit.sha[..7.min(commit.sha.len())], commit.subject);
      }
    }
    None => {
      println!("⚠️  {}", reason.unwrap_or_default());
    }
  }

  println!();
  println!("📋 Jobs ({})", plan.graph.len());
  for job in plan.jobs() {
    if job.deps.is_empty() {
      println!("  {}", job.id);
    } else {
      println!("  {} <- {}", job.id, job.deps.join(", "));
    }
  }

  Ok(())
}
