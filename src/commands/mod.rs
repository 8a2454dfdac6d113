//! CLI commands for release-rail
//!
//! - **run**: execute the full release graph
//! - **plan**: show the next version and the job graph without mutating anything
//! - **matrix**: show the shard expansion of each channel
//! - **check**: validate rail.toml and every manifest pattern
//!
//! Every command takes the `&RunContext` built once in `main`.

pub mod check;
pub mod matrix;
pub mod plan;
pub mod run;

pub use check::run_check;
pub use matrix::run_matrix;
pub use plan::run_plan;
pub use run::run_release;
