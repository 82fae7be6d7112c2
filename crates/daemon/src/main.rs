//! helmform daemon entry point.
//!
//! Loads configuration, brings up the Git working copy and the policy
//! store, serves the HTTP API, and handles graceful shutdown.

mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use helmform_core::config::AppConfig;
use helmform_core::git::GitSyncController;
use helmform_core::policy::PolicyStore;
use helmform_web::WebServer;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// helmform: policy-aware form editor for Helm values kept in Git.
#[derive(Parser, Debug)]
#[command(name = "helmform", version, about = "Policy-aware form editor for Helm values")]
struct Args {
    /// Path to the TOML configuration file. Without it, defaults plus
    /// `GIT_*` environment overrides are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load_from_file(path).context("failed to load configuration file")?,
        None => AppConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("failed to apply environment overrides")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config.validate().context("configuration validation failed")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;

    // SAFETY: no other thread exists yet; the runtime is built below.
    unsafe { helmform_core::git::set_network_timeouts(Duration::from_secs(config.git.timeout_secs)) }
        .context("failed to configure git network timeouts")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(args, config))
}

async fn run(args: Args, config: AppConfig) -> Result<()> {
    // Initialize tracing
    let log_level = args.log_level.as_deref().unwrap_or(&config.server.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    info!("========================================");
    info!("  helmform v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    match &args.config {
        Some(path) => info!("Config file   : {}", path.display()),
        None => info!("Config file   : (defaults + environment)"),
    }
    info!("Values file   : {}", config.values_file().display());
    info!("Policy file   : {}", config.policy.path.display());
    info!("Web listen    : {}", config.server.listen);
    info!("Log level     : {}", log_level);
    if config.git.is_active() {
        info!("Git remote    : {}", helmform_core::git::redact_url(&config.git.repo_url));
        info!("Git branch    : {}", config.git.branch);
        info!("Git auth      : {}", config.git.auth.method.as_str());
        info!("Auto push     : {}", config.git.auto_push_on_update);
    } else {
        info!("Git           : disabled");
    }
    info!("========================================");

    // Policy store
    let policy = if config.policy.path.exists() {
        PolicyStore::load(&config.policy.path).context("failed to load policy file")?
    } else {
        warn!(
            path = %config.policy.path.display(),
            "policy file not found; starting with no rules"
        );
        PolicyStore::empty_at(config.policy.path.clone())
    };
    let policy = Arc::new(policy);

    // Git working copy. A failed startup degrades to serving the local file.
    let controller = Arc::new(GitSyncController::new(&config));
    if let Err(e) = controller.initialize().await {
        warn!(error = %e, "git initialization failed; serving local copy if present");
    }
    info!(state = %controller.state(), "working copy ready");

    tokio::spawn(signals::reload_policy_on_hangup(Arc::clone(&policy)));

    let listen_addr = config.server.listen.clone();
    let web_server = WebServer::new(config, controller, policy);
    web_server
        .start(&listen_addr, signals::wait_for_shutdown())
        .await
        .context("web server error")?;

    info!("helmform stopped.");
    Ok(())
}
