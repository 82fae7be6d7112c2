//! TOML-based configuration for helmform.
//!
//! Secrets are never written in the file: the token and SSH passphrase are
//! `_env` fields naming environment variables, resolved at startup via
//! [`AppConfig::resolve_env_vars`]. A second layer of `GIT_*` environment
//! variables can override individual `[git]` settings, see
//! [`AppConfig::apply_env_overrides`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Where the values document lives.
    #[serde(default)]
    pub document: DocumentConfig,

    /// Policy rule source.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Git integration.
    #[serde(default)]
    pub git: GitConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default `127.0.0.1:8000`).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Origins allowed by CORS.
    #[serde(default = "default_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_listen() -> String {
    "127.0.0.1:8000".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            allowed_origins: default_origins(),
        }
    }
}

// ---------------------------------------------------------------------------
// Document / policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Path of the values file inside the repository working copy.
    #[serde(default = "default_values_path")]
    pub values_path: PathBuf,

    /// Values file used when git integration is disabled.
    #[serde(default = "default_local_file")]
    pub local_file: PathBuf,
}

fn default_values_path() -> PathBuf {
    PathBuf::from("values.yaml")
}
fn default_local_file() -> PathBuf {
    PathBuf::from("./values.yaml")
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            values_path: default_values_path(),
            local_file: default_local_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// YAML file holding sections and rules.
    #[serde(default = "default_policy_path")]
    pub path: PathBuf,
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("./policy.yaml")
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            path: default_policy_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Which credential strategy to use against the remote.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Token,
    Ssh,
    None,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Ssh => "ssh",
            Self::None => "none",
        }
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token" | "https" => Ok(Self::Token),
            "ssh" => Ok(Self::Ssh),
            "none" => Ok(Self::None),
            other => Err(format!("unknown auth method '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitAuthConfig {
    #[serde(default)]
    pub method: AuthMethod,

    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Private key file for SSH auth; `~` is expanded.
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,

    /// Environment variable holding the SSH key passphrase.
    #[serde(default)]
    pub ssh_passphrase_env: Option<String>,

    /// Resolved token (populated by `resolve_env_vars` or `GIT_TOKEN`).
    #[serde(skip)]
    pub token: Option<String>,

    /// Resolved passphrase.
    #[serde(skip)]
    pub ssh_passphrase: Option<String>,
}

fn default_token_env() -> String {
    "GIT_TOKEN".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub repo_url: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Working copy location.
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,

    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// `{timestamp}` and `{user}` are substituted.
    #[serde(default = "default_commit_template")]
    pub commit_message_template: String,

    #[serde(default = "default_true")]
    pub auto_pull_on_start: bool,

    #[serde(default = "default_true")]
    pub auto_pull_on_read: bool,

    #[serde(default = "default_true")]
    pub auto_push_on_update: bool,

    /// Upper bound for clone / pull / push, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub auth: GitAuthConfig,
}

fn default_branch() -> String {
    "main".into()
}
fn default_local_path() -> PathBuf {
    PathBuf::from("./git-repo")
}
fn default_author_name() -> String {
    "Helm UI Bot".into()
}
fn default_author_email() -> String {
    "helm-ui@example.com".into()
}
fn default_commit_template() -> String {
    "Update values via Helm UI\n\nTimestamp: {timestamp}".into()
}
fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    60
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repo_url: String::new(),
            branch: default_branch(),
            local_path: default_local_path(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            commit_message_template: default_commit_template(),
            auto_pull_on_start: true,
            auto_pull_on_read: true,
            auto_push_on_update: true,
            timeout_secs: default_timeout(),
            auth: GitAuthConfig {
                token_env: default_token_env(),
                ..GitAuthConfig::default()
            },
        }
    }
}

impl GitConfig {
    /// Integration is only active with a remote to talk to.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.repo_url.trim().is_empty()
    }

    /// Full path of the values file inside the working copy.
    pub fn values_file(&self, values_path: &Path) -> PathBuf {
        self.local_path.join(values_path)
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Apply `GIT_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let git = &mut self.git;
        let mut overridden: Vec<&'static str> = Vec::new();

        let set_bool = |name: &'static str, target: &mut bool, overridden: &mut Vec<&'static str>| {
            if let Some(raw) = lookup(name) {
                *target = str_to_bool(&raw);
                overridden.push(name);
            }
        };
        set_bool("GIT_ENABLED", &mut git.enabled, &mut overridden);
        set_bool("GIT_AUTO_PULL_ON_START", &mut git.auto_pull_on_start, &mut overridden);
        set_bool("GIT_AUTO_PUSH_ON_UPDATE", &mut git.auto_push_on_update, &mut overridden);

        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(v) = non_empty("GIT_REPO_URL") {
            git.repo_url = v;
            overridden.push("GIT_REPO_URL");
        }
        if let Some(v) = non_empty("GIT_BRANCH") {
            git.branch = v;
            overridden.push("GIT_BRANCH");
        }
        if let Some(v) = non_empty("GIT_VALUES_PATH") {
            self.document.values_path = PathBuf::from(v);
            overridden.push("GIT_VALUES_PATH");
        }
        if let Some(v) = non_empty("GIT_LOCAL_PATH") {
            git.local_path = PathBuf::from(v);
            overridden.push("GIT_LOCAL_PATH");
        }
        if let Some(v) = non_empty("GIT_AUTHOR_NAME") {
            git.author_name = v;
            overridden.push("GIT_AUTHOR_NAME");
        }
        if let Some(v) = non_empty("GIT_AUTHOR_EMAIL") {
            git.author_email = v;
            overridden.push("GIT_AUTHOR_EMAIL");
        }
        if let Some(v) = non_empty("GIT_COMMIT_MESSAGE_TEMPLATE") {
            git.commit_message_template = v;
            overridden.push("GIT_COMMIT_MESSAGE_TEMPLATE");
        }
        if let Some(v) = non_empty("GIT_AUTH_METHOD") {
            git.auth.method = v.parse().map_err(|detail| ConfigError::InvalidValue {
                field: "GIT_AUTH_METHOD".into(),
                detail,
            })?;
            overridden.push("GIT_AUTH_METHOD");
        }
        if let Some(v) = non_empty("GIT_SSH_KEY_PATH") {
            git.auth.ssh_key_path = Some(PathBuf::from(v));
            overridden.push("GIT_SSH_KEY_PATH");
        }
        if let Some(v) = non_empty("GIT_TOKEN") {
            git.auth.token = Some(v);
            overridden.push("GIT_TOKEN");
        }

        for name in overridden {
            if name == "GIT_TOKEN" {
                info!(var = name, value = "[REDACTED]", "git setting overridden from environment");
            } else {
                info!(var = name, "git setting overridden from environment");
            }
        }
        Ok(())
    }

    /// Resolve `*_env` references. A token already set by `GIT_TOKEN` is
    /// kept. Missing variables only warn: public remotes need no token.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        let auth = &mut self.git.auth;
        if auth.method == AuthMethod::Token && auth.token.is_none() && !auth.token_env.is_empty() {
            auth.token = resolve_optional_env(&auth.token_env, "git.auth.token_env");
        }
        if let Some(ref env_name) = auth.ssh_passphrase_env {
            auth.ssh_passphrase = resolve_optional_env(env_name, "git.auth.ssh_passphrase_env");
        }
        if let Some(path) = auth.ssh_key_path.take() {
            auth.ssh_key_path = Some(expand_home(&path));
        }
        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "server.listen".into(),
                detail: "listen address must not be empty".into(),
            });
        }
        if self.document.values_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "document.values_path".into(),
                detail: "values path must not be empty".into(),
            });
        }
        if !self.git.enabled {
            return Ok(());
        }
        if self.git.repo_url.trim().is_empty() {
            warn!("git integration enabled without a repo_url; serving the local file only");
            return Ok(());
        }
        if self.git.branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git.branch".into(),
                detail: "branch must not be empty".into(),
            });
        }
        if self.git.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "git.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.document.values_path.is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: "document.values_path".into(),
                detail: "must be relative to the repository root".into(),
            });
        }
        match self.git.auth.method {
            AuthMethod::Ssh if self.git.auth.ssh_key_path.is_none() => {
                return Err(ConfigError::InvalidValue {
                    field: "git.auth.ssh_key_path".into(),
                    detail: "ssh auth requires a key path".into(),
                });
            }
            AuthMethod::Token if self.git.auth.token.is_none() => {
                warn!("token auth selected but no token resolved; remote must allow anonymous access");
            }
            _ => {}
        }
        Ok(())
    }

    /// Convenience: load, apply overrides, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides()?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// The values file the process edits, depending on git integration.
    pub fn values_file(&self) -> PathBuf {
        if self.git.is_active() {
            self.git.values_file(&self.document.values_path)
        } else {
            self.document.local_file.clone()
        }
    }
}

fn str_to_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map(|home| home.join(rest)).unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[server]
listen = "0.0.0.0:9000"
log_level = "debug"
allowed_origins = ["https://ui.example.com"]

[document]
values_path = "charts/web/values.yaml"

[policy]
path = "/etc/helmform/policy.yaml"

[git]
enabled = true
repo_url = "https://github.com/acme/charts.git"
branch = "release"
local_path = "/var/lib/helmform/repo"
auto_push_on_update = false
timeout_secs = 15

[git.auth]
method = "ssh"
ssh_key_path = "/keys/id_ed25519"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.git.branch, "release");
        assert_eq!(config.git.auth.method, AuthMethod::Ssh);
        assert!(!config.git.auto_push_on_update);
        assert!(config.git.auto_pull_on_read);
        assert_eq!(
            config.values_file(),
            PathBuf::from("/var/lib/helmform/repo/charts/web/values.yaml")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8000");
        assert_eq!(config.server.log_level, "info");
        assert!(!config.git.enabled);
        assert_eq!(config.git.branch, "main");
        assert_eq!(config.git.auth.method, AuthMethod::Token);
        assert_eq!(config.git.auth.token_env, "GIT_TOKEN");
        assert_eq!(config.git.timeout_secs, 60);
        assert_eq!(config.values_file(), PathBuf::from("./values.yaml"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helmform.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.server.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/helmform.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GIT_ENABLED", "Yes"),
            ("GIT_REPO_URL", "https://git.example.com/x.git"),
            ("GIT_BRANCH", "dev"),
            ("GIT_AUTO_PUSH_ON_UPDATE", "0"),
            ("GIT_AUTH_METHOD", "token"),
            ("GIT_TOKEN", "s3cret"),
            ("GIT_VALUES_PATH", "values-dev.yaml"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides_from(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert!(config.git.enabled);
        assert!(!config.git.auto_push_on_update);
        assert_eq!(config.git.branch, "dev");
        assert_eq!(config.git.auth.token.as_deref(), Some("s3cret"));
        assert_eq!(config.document.values_path, PathBuf::from("values-dev.yaml"));
        assert!(config.git.is_active());
    }

    #[test]
    fn test_bad_auth_method_override() {
        let mut config = AppConfig::default();
        let result = config.apply_overrides_from(|name| (name == "GIT_AUTH_METHOD").then(|| "kerberos".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("HELMFORM_TEST_TOKEN", "ghp_abc");
        let mut config = AppConfig::default();
        config.git.auth.token_env = "HELMFORM_TEST_TOKEN".into();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.git.auth.token.as_deref(), Some("ghp_abc"));
        std::env::remove_var("HELMFORM_TEST_TOKEN");
    }

    #[test]
    fn test_validate_rejects_ssh_without_key() {
        let mut config = AppConfig::default();
        config.git.enabled = true;
        config.git.repo_url = "git@example.com:acme/charts.git".into();
        config.git.auth.method = AuthMethod::Ssh;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "git.auth.ssh_key_path"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = AppConfig::default();
        config.git.enabled = true;
        config.git.repo_url = "https://example.com/r.git".into();
        config.git.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_home_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/.ssh/id")), home.join(".ssh/id"));
        }
        assert_eq!(expand_home(Path::new("/abs/key")), PathBuf::from("/abs/key"));
    }
}
