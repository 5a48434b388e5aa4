//! Server assembly.
//!
//! Opens the database, wires the event bus, engine registry, and issue
//! engine together, reconciles stale sessions left over from a previous
//! run, and serves the API until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::db::{BitkDb, DbHandle};
use crate::engines::EngineRegistry;
use crate::events::{EventBus, ProjectCache};
use crate::execution::IssueEngine;

pub struct ServerOptions {
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 4400,
            dev_mode: false,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Build the full application state from configuration.
pub fn build_state(config: Config) -> Result<Arc<AppState>> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    let db = DbHandle::new(BitkDb::new(&config.db_path).context("Failed to open database")?);

    // The workspace root can also come from settings when the environment
    // doesn't pin one.
    let mut config = config;
    if config.workspace_root == PathBuf::from("/") {
        let stored = db
            .lock_sync()
            .ok()
            .and_then(|guard| guard.get_setting("workspace:defaultPath").ok())
            .flatten();
        if let Some(stored) = stored {
            config.workspace_root = PathBuf::from(stored);
        }
    }

    let bus = EventBus::new();
    let registry = Arc::new(EngineRegistry::with_default_adapters());
    let engine = Arc::new(IssueEngine::new(
        db.clone(),
        bus.clone(),
        registry.clone(),
        config.workspace_root.clone(),
        config.max_concurrent,
    ));

    Ok(Arc::new(AppState {
        db,
        engine,
        bus,
        registry,
        project_cache: Arc::new(ProjectCache::default()),
        config,
    }))
}

/// Start the server and block until shutdown.
pub async fn start_server(config: Config, options: ServerOptions) -> Result<()> {
    let state = build_state(config)?;

    match state.engine.reconcile_stale_sessions().await {
        Ok(0) => {}
        Ok(count) => info!(count = count, "reconciled stale sessions from previous run"),
        Err(e) => warn!(error = %e, "startup reconciliation failed"),
    }
    let sweeper = state.engine.start_sweeper();

    let mut app = build_router(state.clone());
    if options.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if options.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(service = %state.config.service_name, addr = %local_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn state_builds_against_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: dir.path().join("nested/test.db"),
            ..Config::default()
        };
        let state = build_state(config).unwrap();
        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn workspace_root_falls_back_to_setting() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: dir.path().join("test.db"),
            ..Config::default()
        };
        {
            let db = BitkDb::new(&config.db_path).unwrap();
            db.set_setting("workspace:defaultPath", "/srv/workspaces")
                .unwrap();
        }
        let state = build_state(config).unwrap();
        assert_eq!(
            state.config.workspace_root,
            PathBuf::from("/srv/workspaces")
        );
    }
}
