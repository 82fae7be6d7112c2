//! The Git-backed synchronization state machine.
//!
//! A single [`GitSyncController`] owns the working copy. Every read and
//! write of the values file, and every Git operation, happens while holding
//! one async mutex around the [`Workspace`], so a pull can never interleave
//! with a write and two writes never touch the file at the same time.
//!
//! Blocking `git2` calls run on the blocking pool with the mutex guard moved
//! into the task. If the outer timeout fires, the guard stays with the
//! abandoned task and the lock is released only when that task finishes.
//! Writers wait for it; a read whose pull was abandoned serves the file on
//! disk without waiting.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, instrument, warn};

use super::client::{Credentials, GitClient, PullResult, Transport};
use super::remote_url::redact_url;
use crate::config::AppConfig;
use crate::document::ValuesDocument;
use crate::errors::{DocumentError, GitError};
use crate::merge::{merge, MergeOutcome};
use crate::policy::RuleSet;
use crate::value::ValueNode;

/// Lifecycle of the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoState {
    Uninitialized,
    Cloning,
    Clean,
    Pulling,
    Dirty,
    Committing,
    Pushing,
    Error,
}

impl RepoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Cloning => "cloning",
            Self::Clean => "clean",
            Self::Pulling => "pulling",
            Self::Dirty => "dirty",
            Self::Committing => "committing",
            Self::Pushing => "pushing",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RepoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryState {
    pub enabled: bool,
    pub state: RepoState,
    pub local_path: PathBuf,
    /// Remote URL with userinfo redacted.
    pub remote_url: String,
    pub branch: String,
    pub auth_method: String,
    pub last_commit: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// How a write ended up relative to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Committed and pushed.
    Synced { commit: String },
    /// Saved to disk only: integration disabled or auto-push off.
    LocalOnly,
    /// The merge changed nothing; nothing was written.
    NoChanges,
    /// Saved locally, but commit or push failed.
    Failed { kind: String, message: String },
}

impl SyncOutcome {
    fn failed(err: &GitError) -> Self {
        Self::Failed {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Result of a write request.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    #[serde(flatten)]
    pub merge: MergeOutcome,
    pub sync: SyncOutcome,
}

/// The working copy guarded by the controller's lock.
struct Workspace {
    client: Option<GitClient>,
}

impl Workspace {
    fn client(&self) -> Result<&GitClient, GitError> {
        self.client.as_ref().ok_or(GitError::NotInitialized)
    }
}

#[derive(Debug, Clone)]
struct Settings {
    enabled: bool,
    repo_url: String,
    branch: String,
    local_path: PathBuf,
    values_path: PathBuf,
    author_name: String,
    author_email: String,
    commit_message_template: String,
    auto_pull_on_start: bool,
    auto_pull_on_read: bool,
    auto_push_on_update: bool,
    timeout: Duration,
}

/// Serializes all access to the values document and its repository.
pub struct GitSyncController {
    settings: Settings,
    credentials: Credentials,
    workspace: Arc<tokio::sync::Mutex<Workspace>>,
    /// Accessed under the workspace lock, except by reads that outlive an
    /// abandoned pull.
    document: ValuesDocument,
    state: Mutex<RepositoryState>,
}

impl GitSyncController {
    pub fn new(config: &AppConfig) -> Self {
        let git = &config.git;
        let settings = Settings {
            enabled: git.is_active(),
            repo_url: git.repo_url.clone(),
            branch: git.branch.clone(),
            local_path: git.local_path.clone(),
            values_path: normalize_relative(&config.document.values_path),
            author_name: git.author_name.clone(),
            author_email: git.author_email.clone(),
            commit_message_template: git.commit_message_template.clone(),
            auto_pull_on_start: git.auto_pull_on_start,
            auto_pull_on_read: git.auto_pull_on_read,
            auto_push_on_update: git.auto_push_on_update,
            timeout: Duration::from_secs(git.timeout_secs.max(1)),
        };
        let credentials = Credentials::from_config(&git.auth);
        let snapshot = RepositoryState {
            enabled: settings.enabled,
            state: RepoState::Uninitialized,
            local_path: settings.local_path.clone(),
            remote_url: redact_url(&settings.repo_url),
            branch: settings.branch.clone(),
            auth_method: credentials.method_name().to_string(),
            last_commit: None,
            last_error: None,
            updated_at: Utc::now(),
        };
        Self {
            settings,
            credentials,
            workspace: Arc::new(tokio::sync::Mutex::new(Workspace { client: None })),
            document: ValuesDocument::new(config.values_file()),
            state: Mutex::new(snapshot),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn status(&self) -> RepositoryState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn state(&self) -> RepoState {
        self.status().state
    }

    fn set_state(&self, next: RepoState) {
        let mut snapshot = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if snapshot.state != next {
            debug!(from = %snapshot.state, to = %next, "repository state transition");
        }
        snapshot.state = next;
        if next != RepoState::Error {
            snapshot.last_error = None;
        }
        snapshot.updated_at = Utc::now();
    }

    fn fail(&self, err: &GitError) {
        error!(error = %err, kind = err.kind(), "git operation failed");
        let mut snapshot = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.state = RepoState::Error;
        snapshot.last_error = Some(err.to_string());
        snapshot.updated_at = Utc::now();
    }

    fn record_commit(&self, sha: String) {
        let mut snapshot = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.last_commit = Some(sha);
    }

    async fn lock(&self) -> OwnedMutexGuard<Workspace> {
        Arc::clone(&self.workspace).lock_owned().await
    }

    /// Run `op` on the blocking pool with the workspace guard, bounded by
    /// the configured timeout. The guard comes back unless the task was
    /// abandoned.
    async fn run_blocking<T, F>(
        &self,
        op: &'static str,
        guard: OwnedMutexGuard<Workspace>,
        f: F,
    ) -> (Option<OwnedMutexGuard<Workspace>>, Result<T, GitError>)
    where
        T: Send + 'static,
        F: FnOnce(&mut Workspace, &Transport) -> Result<T, GitError> + Send + 'static,
    {
        let transport = Transport::new(self.credentials.clone(), self.settings.timeout);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            let result = f(&mut *guard, &transport);
            (guard, result)
        });
        match tokio::time::timeout(self.settings.timeout, task).await {
            Ok(Ok((guard, result))) => (Some(guard), result),
            Ok(Err(join_err)) => (None, Err(GitError::TaskFailed(join_err.to_string()))),
            Err(_) => {
                warn!(op, secs = self.settings.timeout.as_secs(), "git operation abandoned");
                (
                    None,
                    Err(GitError::Timeout {
                        op: op.to_string(),
                        secs: self.settings.timeout.as_secs(),
                    }),
                )
            }
        }
    }

    /// Bring up the working copy: open or clone, then the startup pull.
    ///
    /// A failure leaves the controller in `Error`; reads keep serving
    /// whatever local file exists.
    #[instrument(skip(self), fields(branch = %self.settings.branch))]
    pub async fn initialize(&self) -> Result<(), GitError> {
        if !self.settings.enabled {
            info!("git integration disabled; serving local values file");
            return Ok(());
        }
        let guard = self.lock().await;
        let path = self.settings.local_path.clone();
        let branch = self.settings.branch.clone();

        if !path.exists() {
            return self.clone_locked(guard, path, branch).await;
        }

        info!(path = %path.display(), "opening existing working copy");
        let (guard, opened) = self
            .run_blocking("open", guard, move |ws, _| {
                let client = GitClient::open(&path)?;
                client.ensure_branch(&branch)?;
                let head = client.head_sha().ok();
                ws.client = Some(client);
                Ok(head)
            })
            .await;
        if let Err(e) = opened.map(|head| self.mark_clean(head)) {
            self.fail(&e);
            return Err(e);
        }

        match guard {
            Some(guard) if self.settings.auto_pull_on_start => self.pull_locked(guard).await.1,
            _ => Ok(()),
        }
    }

    async fn clone_locked(
        &self,
        guard: OwnedMutexGuard<Workspace>,
        path: PathBuf,
        branch: String,
    ) -> Result<(), GitError> {
        self.set_state(RepoState::Cloning);
        let url = self.settings.repo_url.clone();
        let (_guard, cloned) = self
            .run_blocking("clone", guard, move |ws, transport| {
                match GitClient::clone_repo(&url, &branch, &path, transport) {
                    Ok(client) => {
                        let head = client.head_sha().ok();
                        ws.client = Some(client);
                        Ok(head)
                    }
                    Err(e) => {
                        // No partial clone left behind for the next start.
                        if path.exists() {
                            let _ = std::fs::remove_dir_all(&path);
                        }
                        Err(e)
                    }
                }
            })
            .await;
        match cloned {
            Ok(head) => {
                self.mark_clean(head);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn mark_clean(&self, head: Option<String>) {
        if let Some(sha) = head {
            self.record_commit(sha);
        }
        self.set_state(RepoState::Clean);
    }

    /// Pull while holding the workspace. The guard is `None` when the pull
    /// was abandoned and its task still owns the lock.
    async fn pull_locked(
        &self,
        guard: OwnedMutexGuard<Workspace>,
    ) -> (Option<OwnedMutexGuard<Workspace>>, Result<(), GitError>) {
        match self.state() {
            RepoState::Dirty => {
                debug!("uncommitted local changes; skipping pull");
                return (Some(guard), Ok(()));
            }
            RepoState::Uninitialized | RepoState::Cloning => return (Some(guard), Ok(())),
            _ => {}
        }
        if guard.client.is_none() {
            return (Some(guard), Ok(()));
        }

        self.set_state(RepoState::Pulling);
        let branch = self.settings.branch.clone();
        let (guard, pulled) = self
            .run_blocking("pull", guard, move |ws, transport| {
                let client = ws.client()?;
                let result = client.pull(&branch, transport)?;
                Ok((result, client.head_sha().ok()))
            })
            .await;
        let result = match pulled {
            Ok((PullResult::Ahead(count), head)) => {
                warn!(count, "local commits not yet pushed");
                if let Some(sha) = head {
                    self.record_commit(sha);
                }
                self.set_state(RepoState::Dirty);
                Ok(())
            }
            Ok((_, head)) => {
                self.mark_clean(head);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "pull failed; serving last known local copy");
                self.fail(&e);
                Err(e)
            }
        };
        (guard, result)
    }

    /// Load the current document, pulling first when configured. `None`
    /// means there is no document to serve.
    pub async fn read_document(&self) -> Result<Option<ValueNode>, DocumentError> {
        let guard = self.lock().await;
        let guard = if self.settings.enabled && self.settings.auto_pull_on_read {
            self.pull_locked(guard).await.0
        } else {
            Some(guard)
        };
        if guard.is_none() {
            // A stalled fetch has not reached the working tree.
            warn!("pull still outstanding; serving last known local copy");
        }
        match self.document.load() {
            Ok(tree) => Ok(Some(tree)),
            Err(DocumentError::NotFound(path)) => {
                debug!(path = %path, "no values document to serve");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Merge `submitted` into the current document under `rules`, persist
    /// the result, then commit and push when configured.
    ///
    /// Errors mean nothing was saved: a persist failure, or integration
    /// enabled without a working copy. Sync failures are reported in the
    /// outcome because the data is already saved locally.
    #[instrument(skip_all)]
    pub async fn write_document(
        &self,
        submitted: &ValueNode,
        rules: &RuleSet,
    ) -> Result<WriteOutcome, DocumentError> {
        let guard = self.lock().await;
        if self.settings.enabled && guard.client.is_none() {
            // Writing here would leave a non-repository directory where the
            // working copy belongs.
            warn!(state = %self.state(), "write refused; no working copy");
            return Err(DocumentError::Unavailable(GitError::NotInitialized.to_string()));
        }
        let current = match self.document.load() {
            Ok(tree) => tree,
            Err(DocumentError::NotFound(_)) => ValueNode::default(),
            Err(e) => return Err(e),
        };
        let outcome = merge(&current, submitted, rules);
        if !outcome.rejections.is_empty() {
            info!(count = outcome.rejections.len(), "submitted changes partially rejected");
        }
        if outcome.applied == current && self.document.exists() {
            return Ok(WriteOutcome {
                merge: outcome,
                sync: SyncOutcome::NoChanges,
            });
        }

        self.document.save(&outcome.applied)?;
        if !self.settings.enabled {
            return Ok(WriteOutcome {
                merge: outcome,
                sync: SyncOutcome::LocalOnly,
            });
        }
        self.set_state(RepoState::Dirty);
        if !self.settings.auto_push_on_update {
            debug!("auto-push disabled; leaving changes uncommitted");
            return Ok(WriteOutcome {
                merge: outcome,
                sync: SyncOutcome::LocalOnly,
            });
        }

        let sync = self.commit_and_push(guard).await;
        Ok(WriteOutcome { merge: outcome, sync })
    }

    async fn commit_and_push(&self, guard: OwnedMutexGuard<Workspace>) -> SyncOutcome {
        self.set_state(RepoState::Committing);
        let relative = self.settings.values_path.clone();
        let message = render_commit_message(&self.settings.commit_message_template, &self.settings.author_name);
        let name = self.settings.author_name.clone();
        let email = self.settings.author_email.clone();
        let (guard, committed) = self
            .run_blocking("commit", guard, move |ws, _| {
                ws.client()?.commit_file(&relative, &message, &name, &email)
            })
            .await;
        let guard = match (guard, committed) {
            (Some(guard), Ok(oid)) => {
                if oid.is_none() {
                    debug!("no new commit; pushing any pending commits");
                }
                guard
            }
            (_, Err(e)) => {
                self.fail(&e);
                return SyncOutcome::failed(&e);
            }
            (None, Ok(_)) => {
                let e = GitError::TaskFailed("commit task abandoned".into());
                self.fail(&e);
                return SyncOutcome::failed(&e);
            }
        };

        self.set_state(RepoState::Pushing);
        let branch = self.settings.branch.clone();
        let (_guard, pushed) = self
            .run_blocking("push", guard, move |ws, transport| {
                let client = ws.client()?;
                client.push(&branch, transport)?;
                client.head_sha()
            })
            .await;
        match pushed {
            Ok(sha) => {
                info!(sha = %sha, "values synchronized with remote");
                self.record_commit(sha.clone());
                self.set_state(RepoState::Clean);
                SyncOutcome::Synced { commit: sha }
            }
            Err(e) => {
                self.fail(&e);
                SyncOutcome::failed(&e)
            }
        }
    }

}

/// Fill `{timestamp}` and `{user}` in a commit message template.
pub fn render_commit_message(template: &str, user: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    template.replace("{timestamp}", &timestamp).replace("{user}", user)
}

/// `./charts/values.yaml` → `charts/values.yaml`, as the index expects.
fn normalize_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
