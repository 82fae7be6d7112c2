//! Local Git repository operations via `git2`.
//!
//! Everything here is blocking. The controller runs these calls on the
//! blocking pool while it holds the working-copy lock.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, Oid, PushOptions,
    RemoteCallbacks, Repository, Signature,
};
use tracing::{debug, info, instrument, warn};

use super::remote_url::{redact_text, redact_url};
use crate::config::{AuthMethod, GitAuthConfig};
use crate::errors::GitError;

/// Name of the single remote the working copy tracks.
pub const REMOTE: &str = "origin";

/// The one credential strategy active for a deployment.
#[derive(Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    Token(String),
    SshKey {
        username: Option<String>,
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl Credentials {
    pub fn from_config(auth: &GitAuthConfig) -> Self {
        match auth.method {
            AuthMethod::Token => match &auth.token {
                Some(token) => Self::Token(token.clone()),
                None => Self::None,
            },
            AuthMethod::Ssh => match &auth.ssh_key_path {
                Some(path) => Self::SshKey {
                    username: None,
                    path: path.clone(),
                    passphrase: auth.ssh_passphrase.clone(),
                },
                None => Self::None,
            },
            AuthMethod::None => Self::None,
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Token(_) => "token",
            Self::SshKey { .. } => "ssh",
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("Credentials::None"),
            Self::Token(_) => f.write_str("Credentials::Token([REDACTED])"),
            Self::SshKey { path, passphrase, .. } => f
                .debug_struct("Credentials::SshKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

/// Credentials plus a deadline for one network operation.
#[derive(Debug, Clone)]
pub struct Transport {
    credentials: Credentials,
    deadline: Instant,
    timeout: Duration,
}

impl Transport {
    pub fn new(credentials: Credentials, timeout: Duration) -> Self {
        Self {
            credentials,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Callbacks supplying credentials and aborting transfers once the
    /// deadline has passed.
    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let mut attempts = 0u32;
        callbacks.credentials(move |_url, username_from_url, allowed| {
            attempts += 1;
            if attempts > 1 {
                // libgit2 keeps asking while the remote rejects what we gave it.
                return Err(git2::Error::new(
                    ErrorCode::Auth,
                    ErrorClass::Callback,
                    "credentials rejected by remote",
                ));
            }
            match &self.credentials {
                Credentials::Token(token) if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                    Cred::userpass_plaintext("x-access-token", token)
                }
                Credentials::SshKey {
                    username,
                    path,
                    passphrase,
                } if allowed.contains(CredentialType::SSH_KEY) => {
                    let user = username.as_deref().or(username_from_url).unwrap_or("git");
                    Cred::ssh_key(user, None, path, passphrase.as_deref())
                }
                _ if allowed.contains(CredentialType::DEFAULT) => Cred::default(),
                other => Err(git2::Error::new(
                    ErrorCode::Auth,
                    ErrorClass::Callback,
                    format!("no usable credentials for {} auth", other.method_name()),
                )),
            }
        });
        callbacks.transfer_progress(move |_| !self.expired());
        callbacks.sideband_progress(move |_| !self.expired());
        callbacks
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(self.callbacks());
        opts
    }

    /// Map a `git2` failure onto the error taxonomy. Messages are redacted.
    fn classify(&self, op: &str, branch: &str, err: git2::Error) -> GitError {
        let detail = redact_text(err.message());
        if err.code() == ErrorCode::User || (self.expired() && err.class() != ErrorClass::Callback) {
            return GitError::Timeout {
                op: op.to_string(),
                secs: self.timeout.as_secs(),
            };
        }
        match err.code() {
            ErrorCode::Auth | ErrorCode::Certificate => GitError::Auth {
                op: op.to_string(),
                detail,
            },
            ErrorCode::NotFastForward => GitError::Conflict {
                branch: branch.to_string(),
                detail,
            },
            _ => match err.class() {
                ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl | ErrorClass::Os => {
                    GitError::Network {
                        op: op.to_string(),
                        detail,
                    }
                }
                _ => GitError::Git2Error(err),
            },
        }
    }
}

/// Bound libgit2's own socket connect and read waits. The transfer
/// callbacks only run while data is flowing, so a remote that accepts a
/// connection and then goes silent is cut off here instead.
///
/// # Safety
/// Writes libgit2 globals without synchronization. Call before any thread
/// that may use `git2` has been started.
pub unsafe fn set_network_timeouts(timeout: Duration) -> Result<(), GitError> {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: forwarded to the caller.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)?;
        git2::opts::set_server_timeout_in_milliseconds(millis)?;
    }
    debug!(millis, "libgit2 network timeouts set");
    Ok(())
}

/// What a pull did to the local branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    UpToDate,
    FastForwarded,
    /// Local commits not yet on the remote; nothing to merge in.
    Ahead(usize),
}

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn open<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self { repo })
    }

    /// Clone `branch` of a remote repository to `path`.
    #[instrument(skip(transport), fields(url = %redact_url(url), path = %path.display()))]
    pub fn clone_repo(url: &str, branch: &str, path: &Path, transport: &Transport) -> Result<Self, GitError> {
        info!("cloning git repository");
        let mut builder = RepoBuilder::new();
        builder.branch(branch);
        builder.fetch_options(transport.fetch_options());
        let repo = builder
            .clone(url, path)
            .map_err(|e| transport.classify("clone", branch, e))?;
        info!("clone completed");
        Ok(Self { repo })
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Make `branch` the checked-out branch, creating it from the
    /// remote-tracking branch when it does not exist locally.
    #[instrument(skip(self))]
    pub fn ensure_branch(&self, branch: &str) -> Result<(), GitError> {
        if self.current_branch().as_deref() == Some(branch) {
            return Ok(());
        }
        if self.repo.find_branch(branch, BranchType::Local).is_err() {
            let tracking = format!("refs/remotes/{REMOTE}/{branch}");
            let commit = self
                .repo
                .find_reference(&tracking)
                .map_err(|_| GitError::RefNotFound(tracking.clone()))?
                .peel_to_commit()?;
            let mut created = self.repo.branch(branch, &commit, false)?;
            created.set_upstream(Some(&format!("{REMOTE}/{branch}")))?;
            info!(branch, "created local branch from remote");
        }
        let refname = format!("refs/heads/{branch}");
        let target = self.repo.revparse_single(&refname)?;
        self.repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
        self.repo.set_head(&refname)?;
        info!(branch, "switched branch");
        Ok(())
    }

    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(str::to_string)
    }

    /// Fetch `branch` into its remote-tracking ref. Never touches the
    /// working tree.
    #[instrument(skip(self, transport))]
    pub fn fetch(&self, branch: &str, transport: &Transport) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote(REMOTE)?;
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{REMOTE}/{branch}");
        let mut opts = transport.fetch_options();
        remote
            .fetch(&[refspec.as_str()], Some(&mut opts), None)
            .map_err(|e| transport.classify("fetch", branch, e))?;
        debug!("fetch completed");
        Ok(())
    }

    /// Fetch and fast-forward. A diverged history is a conflict and leaves
    /// the branch where it was.
    #[instrument(skip(self, transport))]
    pub fn pull(&self, branch: &str, transport: &Transport) -> Result<PullResult, GitError> {
        self.fetch(branch, transport)?;

        let tracking = format!("refs/remotes/{REMOTE}/{branch}");
        let reference = self
            .repo
            .find_reference(&tracking)
            .map_err(|_| GitError::RefNotFound(tracking.clone()))?;
        let incoming = self.repo.reference_to_annotated_commit(&reference)?;
        let (analysis, _) = self.repo.merge_analysis(&[&incoming])?;

        let refname = format!("refs/heads/{branch}");
        if analysis.is_up_to_date() {
            let ahead = self.commits_ahead(branch)?;
            if ahead > 0 {
                debug!(ahead, "local branch ahead of remote");
                return Ok(PullResult::Ahead(ahead));
            }
            debug!("already up to date");
            return Ok(PullResult::UpToDate);
        }
        if analysis.is_fast_forward() || analysis.is_unborn() {
            let target = self.repo.find_object(incoming.id(), None)?;
            // Checkout first: if it refuses, the branch ref is untouched.
            self.repo
                .checkout_tree(&target, Some(CheckoutBuilder::new().safe()))
                .map_err(|e| match e.code() {
                    ErrorCode::Conflict => GitError::Conflict {
                        branch: branch.to_string(),
                        detail: "local modifications would be overwritten".into(),
                    },
                    _ => GitError::Git2Error(e),
                })?;
            match self.repo.find_reference(&refname) {
                Ok(mut local) => {
                    local.set_target(incoming.id(), "helmform: fast-forward pull")?;
                }
                Err(_) => {
                    self.repo
                        .reference(&refname, incoming.id(), true, "helmform: initial pull")?;
                }
            }
            self.repo.set_head(&refname)?;
            info!(sha = %incoming.id(), "fast-forwarded");
            return Ok(PullResult::FastForwarded);
        }
        warn!(branch, "local and remote histories have diverged");
        Err(GitError::Conflict {
            branch: branch.to_string(),
            detail: "local and remote histories have diverged".into(),
        })
    }

    /// Commits on the local branch that the remote-tracking branch lacks.
    pub fn commits_ahead(&self, branch: &str) -> Result<usize, GitError> {
        let local = self.repo.refname_to_id(&format!("refs/heads/{branch}"))?;
        let upstream = match self.repo.refname_to_id(&format!("refs/remotes/{REMOTE}/{branch}")) {
            Ok(oid) => oid,
            Err(_) => return Ok(0),
        };
        let (ahead, _) = self.repo.graph_ahead_behind(local, upstream)?;
        Ok(ahead)
    }

    /// Stage exactly `relative` and commit it. Returns `None` when the file
    /// matches HEAD and there is nothing to commit.
    #[instrument(skip(self, message))]
    pub fn commit_file(
        &self,
        relative: &Path,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<Option<Oid>, GitError> {
        let mut index = self.repo.index()?;
        index.add_path(relative)?;
        index.write()?;
        let tree_oid = index.write_tree()?;

        let parent_commit = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        if parent_commit.as_ref().map(|c| c.tree_id()) == Some(tree_oid) {
            debug!("values file unchanged relative to HEAD; nothing to commit");
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let signature = Signature::now(author_name, author_email)?;
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(Some(oid))
    }

    /// Push the local branch to the remote. A rejected ref update is a
    /// conflict.
    #[instrument(skip(self, transport))]
    pub fn push(&self, branch: &str, transport: &Transport) -> Result<(), GitError> {
        info!(remote = REMOTE, branch, "pushing");
        let mut remote = self.repo.find_remote(REMOTE)?;
        let mut rejection: Option<String> = None;
        {
            let mut callbacks = transport.callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(msg) = status {
                    warn!(refname, msg, "push rejected");
                    rejection = Some(msg.to_string());
                }
                Ok(())
            });
            let mut push_opts = PushOptions::new();
            push_opts.remote_callbacks(callbacks);
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            remote
                .push(&[refspec.as_str()], Some(&mut push_opts))
                .map_err(|e| transport.classify("push", branch, e))?;
        }
        if let Some(detail) = rejection {
            return Err(GitError::Conflict {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    /// Return the SHA of HEAD.
    pub fn head_sha(&self) -> Result<String, GitError> {
        let head = self.repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_with_file(dir: &Path) -> GitClient {
        Repository::init(dir).unwrap();
        let client = GitClient::open(dir).unwrap();
        std::fs::write(dir.join("values.yaml"), "a: 1\n").unwrap();
        client
    }

    #[test]
    fn test_commit_file_and_noop() {
        let dir = tempfile::tempdir().unwrap();
        let client = init_with_file(dir.path());
        std::fs::write(dir.path().join("other.txt"), "untracked").unwrap();

        let oid = client
            .commit_file(Path::new("values.yaml"), "initial", "T", "t@t.com")
            .unwrap()
            .expect("first commit");
        assert_eq!(client.head_sha().unwrap(), oid.to_string());

        // only the values file is tracked
        let tree = client.repo().head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("other.txt").is_none());

        let again = client
            .commit_file(Path::new("values.yaml"), "again", "T", "t@t.com")
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_repo_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GitClient::open(dir.path().join("missing")),
            Err(GitError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::Token("ghp_supersecret".into());
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("supersecret"));

        let ssh = Credentials::SshKey {
            username: None,
            path: PathBuf::from("/keys/id"),
            passphrase: Some("hunter2".into()),
        };
        let rendered = format!("{ssh:?}");
        assert!(rendered.contains("/keys/id"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_credentials_from_config() {
        let mut auth = GitAuthConfig {
            method: AuthMethod::Token,
            token: Some("t".into()),
            ..GitAuthConfig::default()
        };
        assert_eq!(Credentials::from_config(&auth).method_name(), "token");
        auth.token = None;
        assert_eq!(Credentials::from_config(&auth).method_name(), "none");
        auth.method = AuthMethod::Ssh;
        auth.ssh_key_path = Some(PathBuf::from("/k"));
        assert_eq!(Credentials::from_config(&auth).method_name(), "ssh");
    }

    #[test]
    fn test_classify_errors() {
        let transport = Transport::new(Credentials::None, Duration::from_secs(30));
        let auth = git2::Error::new(ErrorCode::Auth, ErrorClass::Http, "401");
        assert!(matches!(transport.classify("push", "main", auth), GitError::Auth { .. }));
        let nff = git2::Error::new(ErrorCode::NotFastForward, ErrorClass::Reference, "nff");
        assert!(matches!(transport.classify("push", "main", nff), GitError::Conflict { .. }));
        let net = git2::Error::new(ErrorCode::GenericError, ErrorClass::Net, "refused");
        assert!(matches!(transport.classify("fetch", "main", net), GitError::Network { .. }));
        let user = git2::Error::new(ErrorCode::User, ErrorClass::Callback, "aborted");
        assert!(matches!(transport.classify("fetch", "main", user), GitError::Timeout { secs: 30, .. }));
    }
}
