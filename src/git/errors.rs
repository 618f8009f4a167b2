use crate::external::command::CommandError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository")]
    NotARepository,
    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUpstreamUrl { url: String, reason: String },
    #[error("remote branch not found: {remote}/{branch}")]
    RemoteBranchNotFound { remote: String, branch: String },
    #[error("branch '{branch}' has diverged from upstream")]
    DivergedHistory { branch: String },
    #[error("FETCH_HEAD has no entry to reset to")]
    FetchHeadMissing,
    #[error("dependency installation failed: {0}")]
    Install(#[from] CommandError),
    #[error("{0}")]
    Command(#[from] git2::Error),
}

impl GitError {
    /// True for errors reported by the git layer itself, as opposed to
    /// configuration or environment problems.
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            GitError::Command(_) | GitError::DivergedHistory { .. } | GitError::FetchHeadMissing
        )
    }
}
