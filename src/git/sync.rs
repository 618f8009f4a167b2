//! Startup synchronization with the upstream repository
//!
//! The synchronizer runs once when the bot starts. An existing repository is
//! left alone (it is managed by whoever deployed it). A plain directory is
//! turned into a checkout of the upstream branch, local divergence is
//! discarded in favour of upstream, and dependencies are reinstalled.
//!
//! Every step reports a typed error; [`RepositorySynchronizer::sync`] logs
//! the failing step and turns it into a [`SyncOutcome`], so startup always
//! continues.

use super::capability::GitCapability;
use super::credentials::upstream_remote_url;
use super::errors::GitError;
use super::repository::{UpstreamOps, UpstreamRepository};
use crate::external::command::{run_blocking, CommandResult, CommandRunner};
use crate::telemetry::{create_sync_span, generate_correlation_id};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the remote the upstream repository is registered under
pub const ORIGIN: &str = "origin";

/// Settings read once at the start of a sync attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub repo_url: String,
    pub branch: String,
    pub git_token: Option<String>,
    /// Command line reinstalling dependencies after a successful sync
    pub install_command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Credentials,
    Discover,
    Init,
    Remote,
    FetchAll,
    TrackBranch,
    Checkout,
    Pull,
    Reset,
    InstallDependencies,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStep::Credentials => "credentials",
            SyncStep::Discover => "discover",
            SyncStep::Init => "init",
            SyncStep::Remote => "remote",
            SyncStep::FetchAll => "fetch",
            SyncStep::TrackBranch => "track-branch",
            SyncStep::Checkout => "checkout",
            SyncStep::Pull => "pull",
            SyncStep::Reset => "reset",
            SyncStep::InstallDependencies => "install-dependencies",
        };
        f.write_str(name)
    }
}

/// A step that failed, with the error it reported
#[derive(Debug)]
pub struct StepFailure {
    pub step: SyncStep,
    pub error: GitError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} step failed: {}", self.step, self.error)
    }
}

impl std::error::Error for StepFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

trait StepResultExt<T> {
    fn at_step(self, step: SyncStep) -> Result<T, StepFailure>;
}

impl<T> StepResultExt<T> for Result<T, GitError> {
    fn at_step(self, step: SyncStep) -> Result<T, StepFailure> {
        self.map_err(|error| StepFailure { step, error })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ToolingUnavailable(GitCapability),
    NotConfigured,
}

#[derive(Debug)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    /// The working directory already is a repository; nothing was touched
    AlreadyManaged,
    Synced {
        /// Pull failed and the tree was hard reset to FETCH_HEAD
        reset_to_upstream: bool,
        install: CommandResult,
    },
    Failed(StepFailure),
}

pub struct RepositorySynchronizer<'a> {
    workdir: PathBuf,
    capability: &'a GitCapability,
    runner: &'a dyn CommandRunner,
}

impl<'a> RepositorySynchronizer<'a> {
    pub fn new<P: AsRef<Path>>(
        workdir: P,
        capability: &'a GitCapability,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
            capability,
            runner,
        }
    }

    /// Run one sync attempt. Never fails; the outcome says what happened.
    ///
    /// Blocks on the dependency install, so it must not be called from
    /// inside a tokio runtime.
    pub fn sync(&self, config: &SyncConfig) -> SyncOutcome {
        let correlation_id = generate_correlation_id();
        let span = create_sync_span(&config.branch, &correlation_id);
        let _entered = span.enter();

        if !self.capability.is_available() {
            info!(reason = %self.capability, "Git not found, skipping upstream updates.");
            return SyncOutcome::Skipped(SkipReason::ToolingUnavailable(self.capability.clone()));
        }

        if config.repo_url.trim().is_empty() {
            info!("No upstream repository configured, skipping upstream updates.");
            return SyncOutcome::Skipped(SkipReason::NotConfigured);
        }

        match UpstreamRepository::open(&self.workdir) {
            Ok(_) => {
                info!("Git client found, repository is deployer-managed");
                SyncOutcome::AlreadyManaged
            }
            Err(GitError::NotARepository) => self.initialize(config),
            Err(error) => {
                info!(error = %error, "Invalid git command");
                SyncOutcome::Failed(StepFailure { step: SyncStep::Discover, error })
            }
        }
    }

    fn initialize(&self, config: &SyncConfig) -> SyncOutcome {
        let remote_url = match upstream_remote_url(&config.repo_url, config.git_token.as_deref())
            .at_step(SyncStep::Credentials)
        {
            Ok(url) => url,
            Err(failure) => return self.failed(failure),
        };

        let repo = match UpstreamRepository::init(&self.workdir).at_step(SyncStep::Init) {
            Ok(repo) => repo,
            Err(failure) => return self.failed(failure),
        };

        match reconcile(&repo, self.runner, config, &remote_url, &self.workdir) {
            Ok(outcome) => outcome,
            Err(failure) => self.failed(failure),
        }
    }

    fn failed(&self, failure: StepFailure) -> SyncOutcome {
        warn!(step = %failure.step, "Failed to update repository: {}", failure.error);
        SyncOutcome::Failed(failure)
    }
}

/// Bring a freshly initialized repository onto the upstream branch and
/// reinstall dependencies, running the install command in `workdir`.
pub fn reconcile(
    repo: &dyn UpstreamOps,
    runner: &dyn CommandRunner,
    config: &SyncConfig,
    remote_url: &str,
    workdir: &Path,
) -> Result<SyncOutcome, StepFailure> {
    let branch = config.branch.as_str();

    repo.ensure_remote(ORIGIN, remote_url).at_step(SyncStep::Remote)?;
    repo.fetch_all(ORIGIN).at_step(SyncStep::FetchAll)?;
    repo.create_tracking_branch(branch, ORIGIN)
        .at_step(SyncStep::TrackBranch)?;
    repo.checkout_branch(branch, true).at_step(SyncStep::Checkout)?;

    let pulled = repo
        .fetch_branch(ORIGIN, branch)
        .and_then(|()| repo.merge_fetch_head(branch));

    let reset_to_upstream = match pulled {
        Ok(()) => false,
        Err(error) if error.is_command_error() => {
            info!(branch, error = %error, "Pull failed, resetting to FETCH_HEAD");
            repo.reset_hard_to_fetch_head(branch)
                .at_step(SyncStep::Reset)?;
            true
        }
        Err(error) => return Err(StepFailure { step: SyncStep::Pull, error }),
    };

    let install = run_blocking(runner, &config.install_command, workdir)
        .map_err(GitError::from)
        .at_step(SyncStep::InstallDependencies)?;

    if !install.success() {
        warn!(
            exit_code = install.exit_code,
            stderr = %install.stderr,
            "Dependency installation exited with a non-zero status"
        );
    }

    info!("Fetching updates from upstream repository...");
    Ok(SyncOutcome::Synced {
        reset_to_upstream,
        install,
    })
}
