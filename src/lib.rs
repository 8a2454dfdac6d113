//! release-rail: release orchestration for one component across many registries
//!
//! A run resolves the next version from conventional commits, rewrites every
//! manifest that carries it, tags the release, then fans out into per-channel
//! build matrices that are aggregated and published independently while the
//! secondary branch is rebased onto the new mainline.

pub mod commands;
pub mod core;
pub mod pipeline;
pub mod release;
pub mod ui;
pub mod utils;
