//! Network module with deferred startup lifecycle.
//!
//! `new()` creates resources, `start()` binds the TCP listener, and
//! `serve()` accepts connections until shutdown is signalled. The split
//! lets the rest of the application wire shared state (cluster, registry,
//! orchestrator) between `start()` and `serve()`.

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::HttpConfig;
use crate::error::ServerError;

use super::handlers::{
    chat_handler, copy_handler, create_handler, delete_handler, distributed_metrics_handler,
    distributed_models_handler, distributed_nodes_handler, distributed_requests_handler,
    distributed_status_handler, embed_handler, generate_handler, health_handler,
    liveness_handler, model_replicas_handler, pull_handler, push_handler, readiness_handler,
    replication_status_handler, show_handler, tags_handler, version_handler, AppState,
};
use super::middleware::apply_http_layers;
use super::shutdown::ShutdownController;

/// Manages the HTTP server lifecycle.
pub struct NetworkModule {
    config: HttpConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Shared shutdown controller for other modules and signal handling.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router with all routes and middleware.
    #[must_use]
    pub fn build_router(&self, state: AppState) -> Router {
        let router = Router::new()
            // Inference
            .route("/api/generate", post(generate_handler))
            .route("/api/chat", post(chat_handler))
            .route("/api/embed", post(embed_handler))
            // Model lifecycle
            .route("/api/tags", get(tags_handler))
            .route("/api/pull", post(pull_handler))
            .route("/api/push", post(push_handler))
            .route("/api/create", post(create_handler))
            .route("/api/copy", post(copy_handler))
            .route("/api/delete", delete(delete_handler))
            .route("/api/show", post(show_handler))
            // Cluster observability
            .route("/api/distributed/status", get(distributed_status_handler))
            .route("/api/distributed/nodes", get(distributed_nodes_handler))
            .route("/api/distributed/models", get(distributed_models_handler))
            .route(
                "/api/distributed/models/{name}/replicas",
                get(model_replicas_handler),
            )
            .route("/api/distributed/metrics", get(distributed_metrics_handler))
            .route(
                "/api/distributed/requests",
                get(distributed_requests_handler),
            )
            .route(
                "/api/distributed/replication/status",
                get(replication_status_handler),
            )
            // Health and version
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/api/v1/version", get(version_handler))
            .with_state(state);

        apply_http_layers(router, &self.config)
    }

    /// Binds the TCP listener. Returns the bound port (useful with port
    /// 0 for OS-assigned ports in tests).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Fatal`] if the address cannot be bound; the
    /// process exits non-zero on startup failure.
    pub async fn start(&mut self) -> Result<u16, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Fatal(format!("bind {addr}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| ServerError::Fatal(format!("local_addr: {e}")))?
            .port();
        info!(host = %self.config.host, port, "HTTP listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until the shutdown controller fires, then drains.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Fatal`] when `start()` was not called or the
    /// accept loop fails.
    pub async fn serve(&mut self, router: Router) -> Result<(), ServerError> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ServerError::Fatal("serve() called before start()".to_string()))?;

        self.shutdown.set_ready();
        info!("HTTP server ready");

        let shutdown = Arc::clone(&self.shutdown);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| ServerError::Fatal(format!("serve: {e}")))?;

        self.shutdown.set_stopped();
        Ok(())
    }
}
