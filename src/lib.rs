// upstream-sync library - startup self-update for bot deployments
// This exposes the core components for testing and integration

pub mod config;
pub mod context;
pub mod external;
pub mod git;
pub mod telemetry;

// Re-export key types for easy access
pub use config::UpdaterConfig;
pub use context::AppContext;
pub use external::{run_blocking, CommandError, CommandResult, CommandRunner, ProcessCommandRunner};
pub use git::{GitCapability, GitError, RepositorySynchronizer, SyncConfig, SyncOutcome};
pub use telemetry::{generate_correlation_id, init_telemetry};
