//! Release pipeline: job graph, scheduling and the per-channel fan-out
//!
//! - **graph**: job nodes, join policies and the validated DAG
//! - **plan**: builds the graph from rail.toml
//! - **scheduler**: evaluates the graph on a worker pool
//! - **matrix / build**: shard expansion and build procedures
//! - **artifacts**: artifact store and per-channel staging
//! - **registry**: idempotent publishing with credentials and retries
//! - **runner**: wires the stages to the scheduler for a full run
//! - **report**: terminal status of every stage and the exit code

pub mod artifacts;
pub mod build;
pub mod graph;
pub mod matrix;
pub mod plan;
pub mod process;
pub mod registry;
pub mod report;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod trigger;

pub use graph::{JobGraph, JobKind, JobNode, JobStatus, JoinPolicy};
pub use plan::ReleasePlan;
pub use report::{RunOutcome, RunReport};
pub use runner::{ChannelSetup, ReleasePipeline};
pub use scheduler::{Completion, JobObserver, JobRunner, Scheduler};
