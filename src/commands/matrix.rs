//! `release-rail matrix`: shard expansion per channel

use crate::core::context::RunContext;
use crate::core::error::RailResult;
use crate::pipeline::matrix::ShardMatrix;

pub fn run_matrix(ctx: &RunContext, channel: Option<String>, json: bool) -> RailResult<()> {
  let config = ctx.require_config()?;

  let channels = match &channel {
    Some(name) => vec![config.channel(name)?],
    None => config.channels.iter().collect(),
  };

  let matrices = channels
    .into_iter()
    .map(ShardMatrix::expand)
    .collect::<RailResult<Vec<_>>>()?;

  if json {
    println!("{}", serde_json::to_string_pretty(&matrices)?);
    return Ok(());
  }

  if matrices.is_empty() {
    println!("⚠️  No channels configured in rail.toml");
    return Ok(());
  }

  for matrix in &matrices {
    println!("🧮 {} ({} shards)", matrix.channel, matrix.len());
    for shard in &matrix.shards {
      let mut flags = Vec::new();
      if !shard.required {
        flags.push("optional".to_string());
      }
      if shard.derived {
        let from: Vec<String> = shard.requires.iter().map(|k| k.shard_name()).collect();
        flags.push(format!("from {}", from.join(" + ")));
      }
      if flags.is_empty() {
        println!("   {}", shard.key.shard_name());
      } else {
        println!("   {} ({})", shard.key.shard_name(), flags.join(", "));
      }
    }
    println!();
  }

  Ok(())
}
