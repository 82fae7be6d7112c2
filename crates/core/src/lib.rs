//! helmform core library.
//!
//! Value trees and path patterns, schema synthesis, the policy overlay, the
//! policy-constrained merge, atomic document persistence, and the Git
//! synchronization controller that serializes access to the working copy.

pub mod config;
pub mod document;
pub mod errors;
pub mod git;
pub mod merge;
pub mod policy;
pub mod schema;
pub mod value;

// Re-exports for convenience.
pub use config::AppConfig;
pub use document::ValuesDocument;
pub use git::{GitSyncController, RepoState, SyncOutcome};
pub use merge::{merge, MergeOutcome, Rejection, RejectionReason};
pub use policy::{PolicyStore, RuleSet};
pub use schema::{synthesize, SchemaNode};
pub use value::{Location, PathPattern, ValueNode};
