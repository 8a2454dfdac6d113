//! Parallel evaluation of a [`JobGraph`]
//!
//! The dispatcher runs on the calling thread inside a rayon scope. Ready
//! nodes are spawned onto the pool; each job reports back over an mpsc
//! channel and the dispatcher settles the graph before spawning more.

use crate::core::error::{Disposition, RailError, RailResult};
use crate::pipeline::graph::{JobGraph, JobKind, JobNode, JobStatus, Readiness};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// How a job finished successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
  /// Downstream jobs may run
  Continue(String),
  /// Job succeeded but nothing downstream should run
  Halt(String),
}

/// Executes one job of the graph
pub trait JobRunner: Sync {
  /// `deps` holds the kind and terminal status of every dependency
  fn run(&self, node: &JobNode, deps: &[(JobKind, JobStatus)]) -> RailResult<Completion>;
}

/// Error details captured for the report
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
  pub code: String,
  pub message: String,
  pub disposition: Disposition,
  pub exit_code: i32,
}

impl JobFailure {
  fn from_error(error: &RailError) -> Self {
    let code = match error.as_release() {
      Some(e) => e.code().to_string(),
      None => match error {
        RailError::Config(_) => "ConfigError",
        RailError::Git(_) => "GitError",
        RailError::Validation(_) => "ValidationError",
        RailError::Io(_) => "IoError",
        _ => "Error",
      }
      .to_string(),
    };
    Self {
      code,
      message: error.to_string(),
      disposition: error.disposition(),
      exit_code: error.exit_code().as_i32(),
    }
  }
}

/// Terminal record of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
  pub id: String,
  pub kind: JobKind,
  pub status: JobStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub note: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<JobFailure>,
  #[serde(with = "humantime_serde")]
  pub duration: Duration,
}

/// Observer for job state changes (progress bars, logs)
pub trait JobObserver: Sync {
  fn started(&self, _node: &JobNode) {}
  fn finished(&self, _record: &JobRecord) {}
}

/// Observer that does nothing
pub struct Silent;

impl JobObserver for Silent {}

/// Evaluated graph plus one record per node, in topological order
#[derive(Debug)]
pub struct Schedule {
  pub graph: JobGraph,
  pub records: Vec<JobRecord>,
  /// Node that halted or aborted the graph, if any
  pub halted_by: Option<String>,
}

impl Schedule {
  pub fn record(&self, id: &str) -> Option<&JobRecord> {
    self.records.iter().find(|r| r.id == id)
  }
}

type Message = (String, RailResult<Completion>, Duration);

/// Runs a graph on a fixed-size worker pool
pub struct Scheduler {
  workers: usize,
}

impl Scheduler {
  pub fn new(workers: usize) -> Self {
    Self { workers: workers.max(1) }
  }

  pub fn run<R: JobRunner, O: JobObserver>(&self, mut graph: JobGraph, runner: &R, observer: &O) -> RailResult<Schedule> {
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(self.workers)
      .thread_name(|i| format!("rail-job-{}", i))
      .build()
      .map_err(|e| RailError::message(format!("Failed to start worker pool: {}", e)))?;

    let order = graph.topo_order();
    let mut records: HashMap<String, JobRecord> = HashMap::new();
    let mut halted_by = None;
    let (tx, rx) = mpsc::channel::<Message>();

    pool.in_place_scope(|scope| -> RailResult<()> {
      let mut running = 0usize;

      loop {
        // Settle: blocked nodes become skipped, which may block more nodes
        loop {
          let blocked: Vec<String> = order
            .iter()
            .filter(|id| graph.status(id) == Some(JobStatus::Pending) && graph.readiness(id) == Readiness::Blocked)
            .cloned()
            .collect();
          if blocked.is_empty() {
            break;
          }
          for id in blocked {
            graph.set_status(&id, JobStatus::Skipped)?;
            tracing::debug!(job = %id, "skipped, a dependency did not succeed");
          }
        }

        let ready: Vec<String> = order
          .iter()
          .filter(|id| graph.status(id) == Some(JobStatus::Pending) && graph.readiness(id) == Readiness::Ready)
          .cloned()
          .collect();

        for id in ready {
          graph.set_status(&id, JobStatus::Running)?;
          let Some(node) = graph.node(&id).cloned() else {
            continue;
          };
          let deps = graph.dep_states(&id);
          observer.started(&node);
          tracing::debug!(job = %id, "started");

          let tx = tx.clone();
          running += 1;
          scope.spawn(move |_| {
            let start = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&node, &deps)))
              .unwrap_or_else(|_| Err(RailError::message(format!("Job {} panicked", node.id))));
            // The dispatcher outlives every job; a closed channel only means it bailed out
            let _ = tx.send((node.id.clone(), result, start.elapsed()));
          });
        }

        if running == 0 {
          break;
        }

        let (id, result, duration) = rx
          .recv()
          .map_err(|_| RailError::message("Job channel closed while jobs were running"))?;
        running -= 1;

        let Some(kind) = graph.node(&id).map(|n| n.kind.clone()) else {
          continue;
        };
        let mut record = JobRecord {
          id: id.clone(),
          kind: kind.clone(),
          status: JobStatus::Succeeded,
          note: None,
          error: None,
          duration,
        };

        match result {
          Ok(Completion::Continue(note)) => {
            graph.set_status(&id, JobStatus::Succeeded)?;
            record.note = Some(note);
          }
          Ok(Completion::Halt(note)) => {
            graph.set_status(&id, JobStatus::Succeeded)?;
            record.note = Some(note);
            halted_by = Some(id.clone());
            let skipped = graph.skip_pending();
            tracing::info!(job = %id, skipped = skipped.len(), "graph halted");
          }
          Err(error) => {
            graph.set_status(&id, JobStatus::Failed)?;
            record.status = JobStatus::Failed;
            record.error = Some(JobFailure::from_error(&error));
            tracing::warn!(job = %id, error = %error, "job failed");
            if kind.is_root_stage() {
              halted_by = Some(id.clone());
              let skipped = graph.skip_pending();
              tracing::warn!(job = %id, skipped = skipped.len(), "root stage failed, aborting graph");
            }
          }
        }

        observer.finished(&record);
        records.insert(id, record);
      }

      Ok(())
    })?;

    let records = order
      .iter()
      .filter_map(|id| {
        let node = graph.node(id)?;
        Some(records.remove(id).unwrap_or_else(|| JobRecord {
          id: id.clone(),
          kind: node.kind.clone(),
          status: node.status(),
          note: None,
          error: None,
          duration: Duration::ZERO,
        }))
      })
      .collect();

    Ok(Schedule {
      graph,
      records,
      halted_by,
    })
  }
}
