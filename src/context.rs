use crate::config::UpdaterConfig;
use crate::external::command::{CommandRunner, ProcessCommandRunner};
use crate::git::capability::{self, GitCapability};
use crate::git::{RepositorySynchronizer, SyncOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Process-wide state, built once at startup and passed by reference.
pub struct AppContext {
    pub config: UpdaterConfig,
    /// Result of the startup capability probe
    pub git: GitCapability,
    pub runner: Arc<dyn CommandRunner>,
    pub workdir: PathBuf,
}

impl AppContext {
    /// Probe git tooling and build the process runner from `config`.
    pub fn new(config: UpdaterConfig, workdir: PathBuf) -> Self {
        let git = capability::probe();
        let runner = Arc::new(ProcessCommandRunner::with_timeout(config.install.timeout()));
        Self::with_parts(config, workdir, git, runner)
    }

    pub fn with_parts(
        config: UpdaterConfig,
        workdir: PathBuf,
        git: GitCapability,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            git,
            runner,
            workdir,
        }
    }

    pub fn synchronizer(&self) -> RepositorySynchronizer<'_> {
        RepositorySynchronizer::new(&self.workdir, &self.git, self.runner.as_ref())
    }

    /// Run the startup sync with the loaded configuration
    pub fn sync_upstream(&self) -> SyncOutcome {
        let outcome = self.synchronizer().sync(&self.config.sync_config());
        info!(outcome = outcome_label(&outcome), "upstream sync finished");
        outcome
    }
}

fn outcome_label(outcome: &SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Skipped(_) => "skipped",
        SyncOutcome::AlreadyManaged => "already-managed",
        SyncOutcome::Synced {
            reset_to_upstream: true,
            ..
        } => "reset-to-upstream",
        SyncOutcome::Synced { .. } => "synced",
        SyncOutcome::Failed(_) => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::command::MockCommandRunner;
    use crate::git::SkipReason;
    use tempfile::TempDir;

    #[test]
    fn test_context_without_git_skips_sync() {
        let temp = TempDir::new().unwrap();
        let mut config = UpdaterConfig::default();
        config.upstream.repo_url = "https://github.com/acct/bot".to_string();

        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(0);

        let context = AppContext::with_parts(
            config,
            temp.path().to_path_buf(),
            GitCapability::MissingExecutable,
            Arc::new(runner),
        );

        assert!(matches!(
            context.sync_upstream(),
            SyncOutcome::Skipped(SkipReason::ToolingUnavailable(GitCapability::MissingExecutable))
        ));
        assert!(!temp.path().join(".git").exists());
    }

    #[test]
    fn test_new_probes_git_capability() {
        let temp = TempDir::new().unwrap();
        let mut config = UpdaterConfig::default();
        config.install.timeout_secs = Some(30);

        let context = AppContext::new(config, temp.path().to_path_buf());
        assert_eq!(context.workdir, temp.path());
        assert_eq!(context.git, capability::probe());
    }
}
