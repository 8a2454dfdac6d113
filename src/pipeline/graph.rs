//! Job graph: release stages and channel jobs as a petgraph DAG
//!
//! ## Graph Structure
//!
//! - **Nodes**: [`JobNode`]s, one per stage, shard, aggregation and upload
//! - **Edges**: `A → B` means "B depends on A"
//! - **Root**: the single `resolve-version` node; every node is reachable from it
//!
//! Node status only moves forward: `pending → running | skipped`,
//! `running → succeeded | failed`.

use crate::core::error::{RailError, RailResult, ValidationError};
use crate::pipeline::matrix::ShardKey;
use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// What a job does
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobKind {
  ResolveVersion,
  PropagateVersion,
  PublishRelease,
  SyncBranch,
  BuildShard { shard: ShardKey },
  Aggregate { channel: String },
  PublishRegistry { channel: String },
}

impl JobKind {
  /// Stable node id
  pub fn id(&self) -> String {
    match self {
      JobKind::ResolveVersion => "resolve-version".to_string(),
      JobKind::PropagateVersion => "propagate-version".to_string(),
      JobKind::PublishRelease => "publish-release".to_string(),
      JobKind::SyncBranch => "sync-branch".to_string(),
      JobKind::BuildShard { shard } => format!("build:{}", shard),
      JobKind::Aggregate { channel } => format!("aggregate:{}", channel),
      JobKind::PublishRegistry { channel } => format!("publish:{}", channel),
    }
  }

  /// Failure here aborts the whole graph
  pub fn is_root_stage(&self) -> bool {
    matches!(
      self,
      JobKind::ResolveVersion | JobKind::PropagateVersion | JobKind::PublishRelease
    )
  }
}

/// When a node may start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
  /// Every dependency succeeded
  AllSucceeded,
  /// Every dependency reached a terminal status (barrier)
  AllTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
  Skipped,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped)
  }

  pub fn can_transition(self, to: JobStatus) -> bool {
    matches!(
      (self, to),
      (JobStatus::Pending, JobStatus::Running)
        | (JobStatus::Pending, JobStatus::Skipped)
        | (JobStatus::Running, JobStatus::Succeeded)
        | (JobStatus::Running, JobStatus::Failed)
    )
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      JobStatus::Pending => "pending",
      JobStatus::Running => "running",
      JobStatus::Succeeded => "succeeded",
      JobStatus::Failed => "failed",
      JobStatus::Skipped => "skipped",
    };
    f.write_str(label)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobNode {
  pub id: String,
  pub kind: JobKind,
  pub deps: Vec<String>,
  pub join: JoinPolicy,
  /// A failed optional node does not block its channel
  pub required: bool,
  status: JobStatus,
}

impl JobNode {
  pub fn new(kind: JobKind, deps: Vec<String>) -> Self {
    Self {
      id: kind.id(),
      kind,
      deps,
      join: JoinPolicy::AllSucceeded,
      required: true,
      status: JobStatus::Pending,
    }
  }

  pub fn barrier(mut self) -> Self {
    self.join = JoinPolicy::AllTerminal;
    self
  }

  pub fn optional(mut self) -> Self {
    self.required = false;
    self
  }

  pub fn status(&self) -> JobStatus {
    self.status
  }

  fn transition(&mut self, to: JobStatus) -> RailResult<()> {
    if !self.status.can_transition(to) {
      return Err(RailError::message(format!(
        "Illegal transition for job {}: {} -> {}",
        self.id, self.status, to
      )));
    }
    self.status = to;
    Ok(())
  }
}

/// Whether a pending node can start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
  /// Some dependency has not finished
  Waiting,
  Ready,
  /// A dependency failed or was skipped; the node can never run
  Blocked,
}

/// Validated DAG of jobs
#[derive(Debug, Clone)]
pub struct JobGraph {
  graph: DiGraph<JobNode, ()>,
  index: HashMap<String, NodeIndex>,
  order: Vec<NodeIndex>,
}

fn invalid(reason: impl Into<String>) -> RailError {
  RailError::Validation(ValidationError::InvalidGraph { reason: reason.into() })
}

impl JobGraph {
  /// Build and validate a graph from nodes
  pub fn build(nodes: Vec<JobNode>) -> RailResult<Self> {
    let mut graph = DiGraph::new();
    let mut index = HashMap::new();

    for node in nodes {
      let id = node.id.clone();
      let ix = graph.add_node(node);
      if index.insert(id.clone(), ix).is_some() {
        return Err(invalid(format!("duplicate job id '{}'", id)));
      }
    }

    let mut edges = Vec::new();
    for ix in graph.node_indices() {
      for dep in &graph[ix].deps {
        let dep_ix = index
          .get(dep)
          .ok_or_else(|| invalid(format!("job '{}' depends on unknown job '{}'", graph[ix].id, dep)))?;
        edges.push((*dep_ix, ix));
      }
    }
    for (from, to) in edges {
      graph.add_edge(from, to, ());
    }

    let order = algo::toposort(&graph, None)
      .map_err(|cycle| invalid(format!("cycle through job '{}'", graph[cycle.node_id()].id)))?;

    let built = Self { graph, index, order };
    built.validate()?;
    Ok(built)
  }

  /// Single resolve root, everything reachable from it
  fn validate(&self) -> RailResult<()> {
    let roots: Vec<NodeIndex> = self
      .graph
      .node_indices()
      .filter(|ix| self.graph[*ix].deps.is_empty())
      .collect();

    let root = match roots.as_slice() {
      [root] => *root,
      [] => return Err(invalid("graph has no root")),
      _ => {
        let names: Vec<&str> = roots.iter().map(|ix| self.graph[*ix].id.as_str()).collect();
        return Err(invalid(format!("graph has several roots: {}", names.join(", "))));
      }
    };

    if self.graph[root].kind != JobKind::ResolveVersion {
      return Err(invalid(format!("root must be resolve-version, found '{}'", self.graph[root].id)));
    }

    let mut reached = 0;
    let mut dfs = Dfs::new(&self.graph, root);
    while dfs.next(&self.graph).is_some() {
      reached += 1;
    }
    if reached != self.graph.node_count() {
      return Err(invalid(format!(
        "{} job(s) unreachable from resolve-version",
        self.graph.node_count() - reached
      )));
    }

    Ok(())
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  pub fn node(&self, id: &str) -> Option<&JobNode> {
    self.index.get(id).map(|ix| &self.graph[*ix])
  }

  pub fn status(&self, id: &str) -> Option<JobStatus> {
    self.node(id).map(JobNode::status)
  }

  /// Nodes in a dependency-respecting order
  pub fn nodes(&self) -> impl Iterator<Item = &JobNode> {
    self.order.iter().map(move |ix| &self.graph[*ix])
  }

  /// Ids in a dependency-respecting order
  pub fn topo_order(&self) -> Vec<String> {
    self.nodes().map(|n| n.id.clone()).collect()
  }

  /// Direct dependents of a node
  pub fn dependents(&self, id: &str) -> Vec<&str> {
    let Some(ix) = self.index.get(id) else {
      return Vec::new();
    };
    self
      .graph
      .neighbors_directed(*ix, Direction::Outgoing)
      .map(|n| self.graph[n].id.as_str())
      .collect()
  }

  /// Every node downstream of `id`
  pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
    let Some(start) = self.index.get(id) else {
      return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*start]);
    while let Some(ix) = queue.pop_front() {
      for next in self.graph.neighbors_directed(ix, Direction::Outgoing) {
        if seen.insert(next) {
          queue.push_back(next);
        }
      }
    }

    self
      .order
      .iter()
      .filter(|ix| seen.contains(ix))
      .map(|ix| self.graph[*ix].id.clone())
      .collect()
  }

  /// Statuses of a node's dependencies, in declaration order
  pub fn dep_states(&self, id: &str) -> Vec<(JobKind, JobStatus)> {
    let Some(node) = self.node(id) else {
      return Vec::new();
    };
    node
      .deps
      .iter()
      .filter_map(|d| self.node(d))
      .map(|d| (d.kind.clone(), d.status))
      .collect()
  }

  pub fn readiness(&self, id: &str) -> Readiness {
    let Some(node) = self.node(id) else {
      return Readiness::Blocked;
    };
    let states: Vec<JobStatus> = node.deps.iter().filter_map(|d| self.status(d)).collect();

    match node.join {
      JoinPolicy::AllSucceeded => {
        if states.iter().any(|s| matches!(s, JobStatus::Failed | JobStatus::Skipped)) {
          Readiness::Blocked
        } else if states.iter().all(|s| *s == JobStatus::Succeeded) {
          Readiness::Ready
        } else {
          Readiness::Waiting
        }
      }
      JoinPolicy::AllTerminal => {
        if states.iter().all(|s| s.is_terminal()) {
          Readiness::Ready
        } else {
          Readiness::Waiting
        }
      }
    }
  }

  /// Move a node forward; illegal transitions are rejected
  pub fn set_status(&mut self, id: &str, status: JobStatus) -> RailResult<()> {
    let ix = *self
      .index
      .get(id)
      .ok_or_else(|| RailError::message(format!("Unknown job '{}'", id)))?;
    self.graph[ix].transition(status)
  }

  /// Mark every pending node skipped; returns their ids
  pub fn skip_pending(&mut self) -> Vec<String> {
    let mut skipped = Vec::new();
    for ix in self.order.clone() {
      if self.graph[ix].status == JobStatus::Pending {
        self.graph[ix].status = JobStatus::Skipped;
        skipped.push(self.graph[ix].id.clone());
      }
    }
    skipped
  }

  /// Whether every node reached a terminal status
  pub fn is_finished(&self) -> bool {
    self.graph.node_weights().all(|n| n.status.is_terminal())
  }
}
