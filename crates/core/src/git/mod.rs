//! Git working-copy management and the synchronization state machine.

pub mod client;
pub mod controller;
pub mod remote_url;

pub use client::{set_network_timeouts, Credentials, GitClient, PullResult};
pub use controller::{GitSyncController, RepoState, RepositoryState, SyncOutcome, WriteOutcome};
pub use remote_url::redact_url;
