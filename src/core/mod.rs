//! Core building blocks shared by every release stage
//!
//! - **config**: rail.toml parsing and validation
//! - **context**: repository root, git handle and config, loaded once
//! - **error**: error types with exit codes, dispositions and help messages
//! - **vcs**: git operations abstraction (SystemGit)

pub mod config;
pub mod context;
pub mod error;
pub mod vcs;
