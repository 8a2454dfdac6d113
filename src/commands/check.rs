//! `release-rail check`: validate configuration against the working tree

use crate::core::context::RunContext;
use crate::core::error::RailResult;
use crate::pipeline::plan::ReleasePlan;
use crate::release::propagate::VersionPropagator;
use crate::release::resolve::VersionResolver;
use crate::release::version::ReleaseVersion;
use serde::Serialize;
use std::str::FromStr;

#[derive(Serialize)]
struct CheckReport {
  current_version: ReleaseVersion,
  manifests: usize,
  channels: usize,
  jobs: usize,
}

pub fn run_check(ctx: &RunContext, json: bool) -> RailResult<()> {
  let config = ctx.require_config()?;
  let settings = &config.release;

  let resolver = VersionResolver::new(
    settings.tag_prefix.clone(),
    ReleaseVersion::from_str(&settings.initial_version)?,
    settings.prerelease.clone(),
  );
  let tags = ctx.git.list_tags()?;
  let current = resolver
    .last_release(tags.iter().map(String::as_str))
    .map(|(_, v)| v)
    .unwrap_or(ReleaseVersion::from_str(&settings.initial_version)?);

  // Staging validates every pattern without touching the tree
  VersionPropagator::new(ctx.repo_root(), &config.manifests).stage(&current)?;
  let plan = ReleasePlan::build(config)?;

  let report = CheckReport {
    current_version: current,
    manifests: config.manifests.len(),
    channels: config.channels.len(),
    jobs: plan.graph.len(),
  };

  if json {
    println!("{}", serde_json::to_string_pretty(&report)?);
    return Ok(());
  }

  println!("✅ rail.toml is valid");
  println!("✅ {} manifest pattern(s) match exactly once", report.manifests);
  println!(
    "✅ {} channel(s), {} job(s) in the release graph",
    report.channels, report.jobs
  );
  println!("   Current version: {}", report.current_version);
  Ok(())
}
