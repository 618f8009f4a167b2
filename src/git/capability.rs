//! Startup probe for git tooling
//!
//! The updater is optional infrastructure. Both the `git` executable and a
//! libgit2 build able to talk to remote hosts have to be present before the
//! synchronizer touches anything.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCapability {
    Available { git_path: PathBuf },
    MissingExecutable,
    MissingBindings,
}

impl GitCapability {
    pub fn is_available(&self) -> bool {
        matches!(self, GitCapability::Available { .. })
    }
}

impl fmt::Display for GitCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitCapability::Available { git_path } => {
                let version = git2::Version::get();
                let (major, minor, rev) = version.libgit2_version();
                write!(
                    f,
                    "git available at {} (libgit2 {major}.{minor}.{rev})",
                    git_path.display()
                )
            }
            GitCapability::MissingExecutable => write!(f, "git executable not found on PATH"),
            GitCapability::MissingBindings => {
                write!(f, "libgit2 was built without HTTPS support")
            }
        }
    }
}

/// Probe the environment once. Looks `git` up on `PATH` and checks that the
/// linked libgit2 was built with an HTTPS transport.
pub fn probe() -> GitCapability {
    match which::which("git") {
        Ok(git_path) => probe_bindings(git_path),
        Err(_) => GitCapability::MissingExecutable,
    }
}

fn probe_bindings(git_path: PathBuf) -> GitCapability {
    if git2::Version::get().https() {
        GitCapability::Available { git_path }
    } else {
        GitCapability::MissingBindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_matches_path_lookup() {
        let capability = probe();
        match which::which("git") {
            Ok(_) => assert_ne!(capability, GitCapability::MissingExecutable),
            Err(_) => assert_eq!(capability, GitCapability::MissingExecutable),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            GitCapability::MissingExecutable.to_string(),
            "git executable not found on PATH"
        );
        let available = GitCapability::Available {
            git_path: PathBuf::from("/usr/bin/git"),
        };
        assert!(available.is_available());
        assert!(available.to_string().starts_with("git available at /usr/bin/git"));
        assert!(!GitCapability::MissingBindings.is_available());
    }
}
