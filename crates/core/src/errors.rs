//! Error types for the helmform core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Per-field merge rejections are deliberately absent here: they are data
//! (see [`crate::merge::Rejection`]), not failures.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Git(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from loading the application config or the policy rule source.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML / YAML parse error.
    #[error("configuration parse error in '{path}': {detail}")]
    ParseError { path: String, detail: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// A policy rule entry is malformed.
    #[error("invalid policy rule #{index} ('{path}'): {detail}")]
    InvalidRule {
        index: usize,
        path: String,
        detail: String,
    },

    /// Generic I/O error reading a config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Policy errors
// ---------------------------------------------------------------------------

/// Problems found while applying an otherwise well-formed rule set to a
/// concrete document. These are reported alongside the schema, never raised
/// out of the overlay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// An enum rule designates a node that is not a list of scalars.
    #[error("enum rule '{pattern}' targets '{location}', which is {found}, not a list of scalars")]
    PolicyConflict {
        pattern: String,
        location: String,
        found: String,
    },

    /// A section assignment that cannot be honoured (nested or absent key).
    #[error("section assignment '{pattern}' -> '{section}' dropped: {detail}")]
    SectionDropped {
        pattern: String,
        section: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Schema errors
// ---------------------------------------------------------------------------

/// Errors from schema synthesis. Synthesis is total over well-formed trees,
/// so these only surface for documents that are not trees of maps at the
/// root.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The document root must be a mapping.
    #[error("document root must be a mapping, found {0}")]
    RootNotMap(String),
}

// ---------------------------------------------------------------------------
// Document errors
// ---------------------------------------------------------------------------

/// Errors reading or writing the values document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// No document exists at the expected location.
    #[error("no values document at '{0}'")]
    NotFound(String),

    /// The document is not valid YAML.
    #[error("failed to parse values document '{path}': {detail}")]
    ParseError { path: String, detail: String },

    /// The document cannot be written right now, e.g. Git integration is
    /// enabled but there is no working copy.
    #[error("values document unavailable: {0}")]
    Unavailable(String),

    /// Writing the document failed; the previous file is left intact.
    #[error("failed to persist values document '{path}': {detail}")]
    Persist { path: String, detail: String },

    /// Generic I/O error.
    #[error("document I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from working-copy and remote Git operations.
///
/// Messages never carry credential material: tokens are supplied through
/// credential callbacks only and remote URLs are rendered redacted.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git integration is enabled but the working copy is not open.
    #[error("git repository is not initialized")]
    NotInitialized,

    /// The local path exists but is not a git repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// The remote rejected our credentials, or none were usable.
    #[error("git authentication failed during {op}: {detail}")]
    Auth { op: String, detail: String },

    /// Transport-level failure (DNS, TCP, TLS, SSH handshake, HTTP).
    #[error("git network error during {op}: {detail}")]
    Network { op: String, detail: String },

    /// Non-fast-forward push, or local and remote histories diverged.
    #[error("git conflict on branch '{branch}': {detail}")]
    Conflict { branch: String, detail: String },

    /// The operation did not finish within the configured bound.
    #[error("git {op} timed out after {secs}s")]
    Timeout { op: String, secs: u64 },

    /// A ref (branch, remote-tracking branch) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A `git2` library error that fits no other category.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// The blocking task running the operation failed.
    #[error("git task failed: {0}")]
    TaskFailed(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GitError {
    /// Short machine-readable category used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Network { .. } => "network",
            Self::Conflict { .. } => "conflict",
            Self::Timeout { .. } => "timeout",
            _ => "other",
        }
    }
}
