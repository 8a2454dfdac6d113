//! Root stages of a release: everything that happens on the mainline
//!
//! 1. **resolve**: pick the next version from conventional commits
//! 2. **propagate**: rewrite every manifest that carries the version
//! 3. **publish**: commit, tag, push and record the release
//! 4. **sync**: rebase the secondary branch onto the new mainline head
//!
//! Stages 1-3 are the root of the job graph; if any of them fails, nothing
//! downstream runs. Sync runs next to the channel builds.
//!
//! # Example rail.toml
//!
//! ```toml
//! [release]
//! tag_prefix = "v"
//! mainline = "main"
//! remote = "origin"
//! secondary_branch = "main-dev"
//!
//! [[manifests]]
//! file = "VERSION"
//! pattern = '^(?P<version>\d+\.\d+\.\d+)$'
//! ```

pub mod propagate;
pub mod publish;
pub mod resolve;
pub mod sync;
pub mod version;

pub use propagate::{FileDiff, VersionPropagator};
pub use publish::{JsonReleaseLog, ReleaseCommit, ReleaseEntry, ReleaseHost, ReleasePublisher};
pub use resolve::{ChangeClass, Resolution, VersionBump, VersionResolver};
pub use sync::{BranchSynchronizer, SyncOutcome};
pub use version::ReleaseVersion;
