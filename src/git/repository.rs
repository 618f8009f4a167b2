use super::credentials::embedded_credentials;
use super::errors::GitError;
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Cred, CredentialType, ErrorCode, FetchOptions, Oid, RemoteCallbacks, ResetType,
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Repository mutations the synchronizer performs after initialization
#[cfg_attr(test, automock)]
pub trait UpstreamOps {
    /// Find the named remote, creating it with `url` if it does not exist.
    /// An existing remote keeps its URL.
    fn ensure_remote(&self, name: &str, url: &str) -> Result<(), GitError>;

    /// Fetch all refs from `remote` using its configured refspecs
    fn fetch_all(&self, remote: &str) -> Result<(), GitError>;

    /// Create local `branch` at `remote/branch` and set it as upstream.
    /// Either both happen or the branch is removed again.
    fn create_tracking_branch(&self, branch: &str, remote: &str) -> Result<(), GitError>;

    /// Check out a local branch, overwriting conflicting changes when `force` is set
    fn checkout_branch(&self, branch: &str, force: bool) -> Result<(), GitError>;

    /// Fetch one branch from `remote`, recording it in FETCH_HEAD
    fn fetch_branch(&self, remote: &str, branch: &str) -> Result<(), GitError>;

    /// Fast-forward the checked out `branch` to FETCH_HEAD
    fn merge_fetch_head(&self, branch: &str) -> Result<(), GitError>;

    /// Hard reset HEAD, index and working tree to FETCH_HEAD
    fn reset_hard_to_fetch_head(&self, branch: &str) -> Result<(), GitError>;
}

/// git2 backed handle on the deployment's working tree
pub struct UpstreamRepository {
    repo: git2::Repository,
}

impl UpstreamRepository {
    /// Open `path` as a repository. Parent directories are not searched.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        match git2::Repository::open(path.as_ref()) {
            Ok(repo) => Ok(Self { repo }),
            Err(e) if e.code() == ErrorCode::NotFound => Err(GitError::NotARepository),
            Err(e) => Err(e.into()),
        }
    }

    pub fn init<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = git2::Repository::init(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "initialized repository");
        Ok(Self { repo })
    }

    /// Name of the branch HEAD points at, if any
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(String::from)
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.repo.find_branch(branch, BranchType::Local).is_ok()
    }

    /// Upstream of a local branch in `remote/branch` form
    pub fn branch_upstream(&self, branch: &str) -> Result<Option<String>, GitError> {
        let local = self.repo.find_branch(branch, BranchType::Local)?;
        let upstream = match local.upstream() {
            Ok(upstream) => upstream,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(upstream.name()?.map(String::from))
    }

    pub fn head_commit(&self) -> Result<Oid, GitError> {
        Ok(self.repo.head()?.peel_to_commit()?.id())
    }

    /// Commit FETCH_HEAD points at for `branch`.
    ///
    /// Prefers the entry fetched from `refs/heads/<branch>` and falls back to
    /// the entry marked for merge.
    pub fn fetch_head_target(&self, branch: &str) -> Result<Oid, GitError> {
        let wanted = format!("refs/heads/{branch}");
        let mut branch_target = None;
        let mut merge_target = None;

        let walked = self.repo.fetchhead_foreach(|ref_name, _url, oid, is_merge| {
            if ref_name == wanted && branch_target.is_none() {
                branch_target = Some(*oid);
            }
            if is_merge && merge_target.is_none() {
                merge_target = Some(*oid);
            }
            true
        });

        match walked {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFound => return Err(GitError::FetchHeadMissing),
            Err(e) => return Err(e.into()),
        }

        branch_target
            .or(merge_target)
            .ok_or(GitError::FetchHeadMissing)
    }

    fn fetch_refspecs(&self, remote_name: &str, refspecs: &[&str]) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote(remote_name)?;
        let url = remote.url().unwrap_or_default().to_string();
        let mut options = fetch_options(&url);

        remote.fetch(refspecs, Some(&mut options), None)?;
        Ok(())
    }
}

/// Answer to one credentials request from libgit2
#[derive(Debug, Clone, PartialEq, Eq)]
enum CredentialChoice {
    /// Username and token embedded in the remote URL
    EmbeddedToken,
    /// Username only, so libgit2 can ask again for an SSH key
    Username,
    SshAgent,
    SshKeyFile,
    Refuse(&'static str),
}

/// Pick the credential to offer for the `attempt`-th request.
///
/// HTTPS remotes get the embedded token once. SSH remotes try the agent
/// first and then a key file from `~/.ssh`.
fn choose_credential(allowed: CredentialType, has_token: bool, attempt: u32) -> CredentialChoice {
    if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) && has_token {
        return if attempt == 1 {
            CredentialChoice::EmbeddedToken
        } else {
            CredentialChoice::Refuse("upstream rejected the configured access token")
        };
    }
    if allowed.contains(CredentialType::USERNAME) {
        return CredentialChoice::Username;
    }
    if allowed.contains(CredentialType::SSH_KEY) {
        return match attempt {
            1 => CredentialChoice::SshAgent,
            2 => CredentialChoice::SshKeyFile,
            _ => CredentialChoice::Refuse("upstream rejected the available SSH keys"),
        };
    }
    CredentialChoice::Refuse("upstream requires authentication but no access token is configured")
}

/// First private key found under `~/.ssh`
fn default_ssh_key() -> Option<PathBuf> {
    let ssh_dir = PathBuf::from(std::env::var_os("HOME")?).join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.is_file())
}

/// Fetch options answering credential requests for HTTPS and SSH remotes.
fn fetch_options(remote_url: &str) -> FetchOptions<'static> {
    let credentials = embedded_credentials(remote_url);
    let mut attempts = 0u32;

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed_types| {
        let username = username_from_url.unwrap_or("git");
        // libgit2 keeps asking when credentials are rejected
        if !allowed_types.contains(CredentialType::USERNAME) {
            attempts += 1;
        }

        match choose_credential(allowed_types, credentials.is_some(), attempts) {
            CredentialChoice::EmbeddedToken => match &credentials {
                Some((user, password)) => Cred::userpass_plaintext(user, password),
                None => Err(git2::Error::from_str("no access token configured")),
            },
            CredentialChoice::Username => Cred::username(username),
            CredentialChoice::SshAgent => Cred::ssh_key_from_agent(username),
            CredentialChoice::SshKeyFile => match default_ssh_key() {
                Some(key) => {
                    debug!(key = %key.display(), "offering SSH key file");
                    Cred::ssh_key(username, None, &key, None)
                }
                None => Err(git2::Error::from_str("no SSH key found in ~/.ssh")),
            },
            CredentialChoice::Refuse(reason) => Err(git2::Error::from_str(reason)),
        }
    });

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

impl UpstreamOps for UpstreamRepository {
    fn ensure_remote(&self, name: &str, url: &str) -> Result<(), GitError> {
        if self.repo.find_remote(name).is_ok() {
            debug!(remote = name, "using existing remote");
            return Ok(());
        }
        self.repo.remote(name, url)?;
        Ok(())
    }

    fn fetch_all(&self, remote: &str) -> Result<(), GitError> {
        self.fetch_refspecs(remote, &[])
    }

    fn create_tracking_branch(&self, branch: &str, remote: &str) -> Result<(), GitError> {
        let remote_branch = format!("{remote}/{branch}");
        let start = self
            .repo
            .find_branch(&remote_branch, BranchType::Remote)
            .map_err(|_| GitError::RemoteBranchNotFound {
                remote: remote.to_string(),
                branch: branch.to_string(),
            })?
            .get()
            .peel_to_commit()?;

        let mut local = self.repo.branch(branch, &start, false)?;
        if let Err(e) = local.set_upstream(Some(remote_branch.as_str())) {
            if let Err(cleanup) = local.delete() {
                warn!(branch, error = %cleanup, "could not remove branch after failed upstream setup");
            }
            return Err(e.into());
        }

        Ok(())
    }

    fn checkout_branch(&self, branch: &str, force: bool) -> Result<(), GitError> {
        let refname = format!("refs/heads/{branch}");
        let target = self.repo.revparse_single(&refname)?;

        let mut checkout = CheckoutBuilder::new();
        if force {
            checkout.force();
        }

        self.repo.checkout_tree(&target, Some(&mut checkout))?;
        self.repo.set_head(&refname)?;
        Ok(())
    }

    fn fetch_branch(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        let refspec = format!("refs/heads/{branch}");
        self.fetch_refspecs(remote, &[refspec.as_str()])
    }

    fn merge_fetch_head(&self, branch: &str) -> Result<(), GitError> {
        let target = self.fetch_head_target(branch)?;
        let annotated = self.repo.find_annotated_commit(target)?;
        let (analysis, _) = self.repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Ok(());
        }
        if !analysis.is_fast_forward() {
            return Err(GitError::DivergedHistory {
                branch: branch.to_string(),
            });
        }

        let refname = format!("refs/heads/{branch}");
        self.repo
            .find_reference(&refname)?
            .set_target(target, "upstream-sync: fast-forward")?;
        self.repo.set_head(&refname)?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))?;
        Ok(())
    }

    fn reset_hard_to_fetch_head(&self, branch: &str) -> Result<(), GitError> {
        let target = self.fetch_head_target(branch)?;
        let object = self.repo.find_object(target, None)?;
        self.repo.reset(&object, ResetType::Hard, None)?;
        Ok(())
    }
}

impl std::fmt::Debug for UpstreamRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamRepository")
            .field("path", &self.repo.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_file, init_upstream};
    use std::fs;
    use tempfile::TempDir;

    /// Local clone of `upstream` on `main`, built step by step.
    fn tracking_clone(upstream: &Path) -> (TempDir, UpstreamRepository) {
        let local_dir = TempDir::new().unwrap();
        let local = UpstreamRepository::init(local_dir.path()).unwrap();
        local
            .ensure_remote("origin", upstream.to_str().unwrap())
            .unwrap();
        local.fetch_all("origin").unwrap();
        local.create_tracking_branch("main", "origin").unwrap();
        local.checkout_branch("main", true).unwrap();
        (local_dir, local)
    }

    #[test]
    fn test_open_reports_missing_repository() {
        let temp = TempDir::new().unwrap();
        let result = UpstreamRepository::open(temp.path());
        assert!(matches!(result, Err(GitError::NotARepository)));
    }

    #[test]
    fn test_open_existing_repository() {
        let temp = TempDir::new().unwrap();
        git2::Repository::init(temp.path()).unwrap();
        assert!(UpstreamRepository::open(temp.path()).is_ok());
    }

    #[test]
    fn test_tracking_branch_checkout() {
        let (upstream_dir, _upstream, first) = init_upstream();
        let (local_dir, local) = tracking_clone(upstream_dir.path());

        assert!(local.branch_exists("main"));
        assert_eq!(local.current_branch().as_deref(), Some("main"));
        assert_eq!(
            local.branch_upstream("main").unwrap().as_deref(),
            Some("origin/main")
        );
        assert_eq!(local.head_commit().unwrap(), first);
        assert_eq!(
            fs::read_to_string(local_dir.path().join("README.md")).unwrap(),
            "upstream v1\n"
        );
    }

    #[test]
    fn test_existing_remote_url_is_kept() {
        let temp = TempDir::new().unwrap();
        let repo = UpstreamRepository::init(temp.path()).unwrap();
        repo.ensure_remote("origin", "https://example.com/a/one").unwrap();
        repo.ensure_remote("origin", "https://example.com/a/two").unwrap();

        let remote = repo.repo.find_remote("origin").unwrap();
        assert_eq!(remote.url(), Some("https://example.com/a/one"));
    }

    #[test]
    fn test_missing_remote_branch() {
        let (upstream_dir, _upstream, _) = init_upstream();
        let local_dir = TempDir::new().unwrap();
        let local = UpstreamRepository::init(local_dir.path()).unwrap();
        local
            .ensure_remote("origin", upstream_dir.path().to_str().unwrap())
            .unwrap();
        local.fetch_all("origin").unwrap();

        let result = local.create_tracking_branch("release", "origin");
        assert!(matches!(result, Err(GitError::RemoteBranchNotFound { .. })));
        assert!(!local.branch_exists("release"));
    }

    #[test]
    fn test_failed_upstream_setup_removes_branch() {
        let (upstream_dir, _upstream, _) = init_upstream();
        let local_dir = TempDir::new().unwrap();
        let local = UpstreamRepository::init(local_dir.path()).unwrap();
        local
            .ensure_remote("origin", upstream_dir.path().to_str().unwrap())
            .unwrap();
        local.fetch_all("origin").unwrap();

        // Holding the config lock makes writing the upstream fail
        let lock = local_dir.path().join(".git").join("config.lock");
        fs::write(&lock, "").unwrap();
        let result = local.create_tracking_branch("main", "origin");
        fs::remove_file(&lock).unwrap();

        assert!(matches!(result, Err(GitError::Command(_))));
        assert!(!local.branch_exists("main"));
        assert!(local.repo.find_branch("origin/main", BranchType::Remote).is_ok());
    }

    #[test]
    fn test_https_remote_gets_token_once() {
        let allowed = CredentialType::USER_PASS_PLAINTEXT;
        assert_eq!(choose_credential(allowed, true, 1), CredentialChoice::EmbeddedToken);
        assert!(matches!(choose_credential(allowed, true, 2), CredentialChoice::Refuse(_)));
        assert_eq!(
            choose_credential(allowed, false, 1),
            CredentialChoice::Refuse("upstream requires authentication but no access token is configured")
        );
    }

    #[test]
    fn test_ssh_remote_tries_agent_then_key_file() {
        let allowed = CredentialType::SSH_KEY | CredentialType::SSH_CUSTOM;
        assert_eq!(choose_credential(allowed, false, 1), CredentialChoice::SshAgent);
        assert_eq!(choose_credential(allowed, false, 2), CredentialChoice::SshKeyFile);
        assert!(matches!(choose_credential(allowed, false, 3), CredentialChoice::Refuse(_)));

        // A token embedded in an https URL is never offered to SSH
        assert_eq!(choose_credential(allowed, true, 1), CredentialChoice::SshAgent);
    }

    #[test]
    fn test_ssh_remote_without_username_asks_for_one() {
        assert_eq!(
            choose_credential(CredentialType::USERNAME, false, 0),
            CredentialChoice::Username
        );
    }

    #[test]
    fn test_fast_forward_from_fetch_head() {
        let (upstream_dir, upstream, _) = init_upstream();
        let (local_dir, local) = tracking_clone(upstream_dir.path());

        let second = commit_file(&upstream, "main", "CHANGELOG.md", "v2\n", "Second release");

        local.fetch_branch("origin", "main").unwrap();
        assert_eq!(local.fetch_head_target("main").unwrap(), second);
        local.merge_fetch_head("main").unwrap();

        assert_eq!(local.head_commit().unwrap(), second);
        assert!(local_dir.path().join("CHANGELOG.md").exists());

        // Nothing new upstream: pulling again is a no-op
        local.fetch_branch("origin", "main").unwrap();
        local.merge_fetch_head("main").unwrap();
        assert_eq!(local.head_commit().unwrap(), second);
    }

    #[test]
    fn test_diverged_history_resets_to_fetch_head() {
        let (upstream_dir, upstream, _) = init_upstream();
        let (local_dir, local) = tracking_clone(upstream_dir.path());

        commit_file(&local.repo, "main", "local.txt", "local only\n", "Local hotfix");
        let upstream_tip = commit_file(&upstream, "main", "upstream.txt", "new\n", "Upstream change");

        local.fetch_branch("origin", "main").unwrap();
        let merged = local.merge_fetch_head("main");
        assert!(matches!(merged, Err(GitError::DivergedHistory { ref branch }) if branch == "main"));

        local.reset_hard_to_fetch_head("main").unwrap();

        assert_eq!(local.head_commit().unwrap(), upstream_tip);
        assert_eq!(local.head_commit().unwrap(), local.fetch_head_target("main").unwrap());
        assert!(!local_dir.path().join("local.txt").exists());
        assert_eq!(
            fs::read_to_string(local_dir.path().join("upstream.txt")).unwrap(),
            "new\n"
        );
        assert!(local.repo.statuses(None).unwrap().is_empty());
    }

    #[test]
    fn test_reset_without_fetch_head() {
        let temp = TempDir::new().unwrap();
        let repo = UpstreamRepository::init(temp.path()).unwrap();
        assert!(matches!(
            repo.reset_hard_to_fetch_head("main"),
            Err(GitError::FetchHeadMissing)
        ));
    }

    #[test]
    fn test_fetch_from_unreachable_remote_fails() {
        let temp = TempDir::new().unwrap();
        let repo = UpstreamRepository::init(temp.path()).unwrap();
        repo.ensure_remote("origin", "/nonexistent/upstream-sync/remote.git")
            .unwrap();

        let result = repo.fetch_all("origin");
        assert!(matches!(result, Err(GitError::Command(_))));
    }
}
