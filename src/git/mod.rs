//! Git operations module
//!
//! Keeps the deployment's working tree in step with its upstream repository,
//! using libgit2 bindings instead of shelling out to `git`.

pub mod capability;
pub mod credentials;
pub mod errors;
pub mod repository;
pub mod sync;

pub use capability::GitCapability;
pub use errors::GitError;
pub use repository::{UpstreamOps, UpstreamRepository};
pub use sync::{RepositorySynchronizer, SkipReason, StepFailure, SyncConfig, SyncOutcome, SyncStep};
