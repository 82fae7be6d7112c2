//! helmform web server and REST API.
//!
//! Provides an Axum-based HTTP server with:
//! - Schema and values endpoints for the form UI
//! - The update endpoint that merges edits and syncs them to Git
//! - Policy inspection and hot reload
//! - Status and health endpoints

pub mod api;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use helmform_core::config::AppConfig;
use helmform_core::git::GitSyncController;
use helmform_core::policy::PolicyStore;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub controller: Arc<GitSyncController>,
    pub policy: Arc<PolicyStore>,
    pub config: AppConfig,
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    /// Create a new web server with the given dependencies.
    pub fn new(config: AppConfig, controller: Arc<GitSyncController>, policy: Arc<PolicyStore>) -> Self {
        Self {
            state: Arc::new(AppState {
                controller,
                policy,
                config,
            }),
        }
    }

    /// The fully layered router, without binding a socket.
    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.state))
    }

    /// Serve on `listen_addr` until `shutdown` resolves.
    pub async fn start<F>(self, listen_addr: &str, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listen_addr.parse()?;
        let app = self.router();

        info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("web server stopped");
        Ok(())
    }
}

/// Build the application router over `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);

    Router::new()
        .merge(api::schema::routes())
        .merge(api::values::routes())
        .merge(api::update::routes())
        .merge(api::config::routes())
        .merge(api::status::routes())
        // Middleware
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024)) // 2 MB max request body
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::HeaderName::from_static(api::values::SYNC_STATE_HEADER)]);

    if allowed_origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(origins))
}
