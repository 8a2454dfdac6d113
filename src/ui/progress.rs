//! Progress bars for a release run
//!
//! Uses `linya`, which redraws several bars from many threads. One bar per
//! channel, advanced as its build shards finish.

use crate::pipeline::graph::{JobKind, JobNode};
use crate::pipeline::plan::ReleasePlan;
use crate::pipeline::scheduler::{JobObserver, JobRecord};
use linya::{Bar, Progress};
use std::collections::HashMap;
use std::sync::Mutex;

/// Draws one bar per channel while its shards build
pub struct ShardProgress {
  progress: Mutex<Progress>,
  bars: HashMap<String, Bar>,
}

impl ShardProgress {
  pub fn new(plan: &ReleasePlan) -> Self {
    let mut progress = Progress::new();
    let bars = plan
      .matrices
      .iter()
      .map(|m| (m.channel.clone(), progress.bar(m.len(), format!("🔨 {}", m.channel))))
      .collect();
    Self {
      progress: Mutex::new(progress),
      bars,
    }
  }
}

impl JobObserver for ShardProgress {
  fn started(&self, node: &JobNode) {
    tracing::debug!(job = %node.id, "running");
  }

  fn finished(&self, record: &JobRecord) {
    if let JobKind::BuildShard { shard } = &record.kind
      && let Some(bar) = self.bars.get(&shard.channel)
      && let Ok(mut progress) = self.progress.lock()
    {
      progress.inc_and_draw(bar, 1);
    }
  }
}

/// Logs each finished job; used when stdout is not a terminal
pub struct JobLog;

impl JobObserver for JobLog {
  fn finished(&self, record: &JobRecord) {
    tracing::info!(job = %record.id, status = %record.status, "job finished");
  }
}
