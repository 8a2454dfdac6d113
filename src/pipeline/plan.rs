//! Turn configuration into a job graph
//!
//! ```text
//! resolve-version → propagate-version → publish-release ─┬→ sync-branch
//!                                                        ├→ build:<channel>/<shard> ... → aggregate:<channel> → publish:<channel>
//!                                                        └→ ...
//! ```

use crate::core::config::RailConfig;
use crate::core::error::RailResult;
use crate::pipeline::graph::{JobGraph, JobKind, JobNode, JoinPolicy};
use crate::pipeline::matrix::ShardMatrix;
use serde::Serialize;

/// Graph plus the matrices it was built from
#[derive(Debug, Clone)]
pub struct ReleasePlan {
  pub graph: JobGraph,
  pub matrices: Vec<ShardMatrix>,
}

/// One node as shown by `release-rail plan`
#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
  pub id: String,
  pub deps: Vec<String>,
  pub join: JoinPolicy,
  pub required: bool,
}

impl ReleasePlan {
  pub fn build(config: &RailConfig) -> RailResult<Self> {
    let publish_id = JobKind::PublishRelease.id();
    let mut nodes = vec![
      JobNode::new(JobKind::ResolveVersion, vec![]),
      JobNode::new(JobKind::PropagateVersion, vec![JobKind::ResolveVersion.id()]),
      JobNode::new(JobKind::PublishRelease, vec![JobKind::PropagateVersion.id()]),
    ];

    if config.release.secondary_branch.is_some() {
      nodes.push(JobNode::new(JobKind::SyncBranch, vec![publish_id.clone()]));
    }

    let mut matrices = Vec::with_capacity(config.channels.len());
    for channel in &config.channels {
      let matrix = ShardMatrix::expand(channel)?;
      let mut shard_ids = Vec::with_capacity(matrix.len());

      for shard in &matrix.shards {
        let mut deps = vec![publish_id.clone()];
        deps.extend(
          shard
            .requires
            .iter()
            .map(|key| JobKind::BuildShard { shard: key.clone() }.id()),
        );

        let kind = JobKind::BuildShard { shard: shard.key.clone() };
        shard_ids.push(kind.id());
        let node = JobNode::new(kind, deps);
        nodes.push(if shard.required { node } else { node.optional() });
      }

      let aggregate = JobKind::Aggregate {
        channel: channel.name.clone(),
      };
      let aggregate_id = aggregate.id();
      nodes.push(JobNode::new(aggregate, shard_ids).barrier());
      nodes.push(JobNode::new(
        JobKind::PublishRegistry {
          channel: channel.name.clone(),
        },
        vec![aggregate_id],
      ));

      matrices.push(matrix);
    }

    let graph = JobGraph::build(nodes)?;
    tracing::debug!(jobs = graph.len(), channels = matrices.len(), "release plan built");
    Ok(Self { graph, matrices })
  }

  pub fn matrix(&self, channel: &str) -> Option<&ShardMatrix> {
    self.matrices.iter().find(|m| m.channel == channel)
  }

  pub fn jobs(&self) -> Vec<PlannedJob> {
    self
      .graph
      .nodes()
      .map(|n| PlannedJob {
        id: n.id.clone(),
        deps: n.deps.clone(),
        join: n.join,
        required: n.required,
      })
      .collect()
  }
}
