//! `release-rail run`

use crate::core::context::RunContext;
use crate::core::error::{RailError, RailResult};
use crate::pipeline::plan::ReleasePlan;
use crate::pipeline::runner::ReleasePipeline;
use crate::pipeline::trigger::TriggerEvent;
use crate::ui::progress::{JobLog, ShardProgress};
use std::io::IsTerminal;
use std::path::PathBuf;

/// Run the release graph and return the process exit code
pub fn run_release(ctx: &RunContext, event: Option<PathBuf>, dry_run: bool, json: bool) -> RailResult<i32> {
  let config = ctx.require_config()?;

  let branch = ctx.git.current_branch()?;
  if branch != config.release.mainline {
    return Err(RailError::with_help(
      format!(
        "Releases are cut from '{}', but HEAD is on '{}'",
        config.release.mainline, branch
      ),
      format!("git checkout {}", config.release.mainline),
    ));
  }

  if let Some(path) = event {
    let event = TriggerEvent::load(&path)?;
    event.verify(&config.release.mainline, &ctx.git.head_commit()?)?;
    tracing::info!(git_ref = %event.git_ref, after = %event.after, "trigger verified");
  }

  if !json {
    println!("🚀 Releasing from {}", ctx.repo_root().display());
    if dry_run {
      println!("🔍 Dry-run mode: channels build and stage but never upload");
    }
  }

  let pipeline = ReleasePipeline::new(ctx.repo_root(), config, &ctx.git).dry_run(dry_run);

  let report = if !json && std::io::stdout().is_terminal() {
    let progress = ShardProgress::new(&ReleasePlan::build(config)?);
    pipeline.run(&progress)?
  } else {
    pipeline.run(&JobLog)?
  };

  if json {
    println!("{}", report.to_json()?);
  } else {
    report.print_text();
  }

  Ok(report.exit_code())
}
