//! Signal handling for the daemon.
//!
//! SIGTERM, SIGINT and Ctrl+C end the process gracefully. On Unix, SIGHUP
//! re-reads the policy file without a restart.

use std::sync::Arc;

use tracing::{error, info, warn};

use helmform_core::policy::PolicyStore;

/// Wait for a shutdown signal (SIGTERM, SIGINT, or Ctrl+C).
///
/// This function resolves once any termination signal is received. If a
/// handler cannot be installed, that signal source is ignored.
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

/// Reload the policy on every SIGHUP until the process exits.
#[cfg(unix)]
pub async fn reload_policy_on_hangup(policy: Arc<PolicyStore>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler; reload via API only");
            return;
        }
    };
    while hangups.recv().await.is_some() {
        info!("received SIGHUP, reloading policy");
        match policy.reload() {
            Ok(rules) => info!(rules = rules.len(), "policy reloaded"),
            Err(e) => warn!(error = %e, "policy reload failed; previous rules stay active"),
        }
    }
}

#[cfg(not(unix))]
pub async fn reload_policy_on_hangup(_policy: Arc<PolicyStore>) {}
