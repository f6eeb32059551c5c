//! HTTP surface: session WebSocket, health check and the web client
//!
//! ```text
//! GET /ws       upgrade to a voice session
//! GET /health   liveness
//! GET /*        static web client, when a directory is configured
//! ```

pub mod health;
pub mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::session::TurnServices;
use crate::Result;

/// Shared state for every connection
pub struct ApiState {
    pub services: TurnServices,
    /// Sent as the first agent message of each session
    pub greeting: String,
}

/// HTTP server for client sessions
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    static_dir: Option<PathBuf>,
}

impl ApiServer {
    #[must_use]
    pub fn new(services: TurnServices, greeting: String, port: u16) -> Self {
        Self {
            state: Arc::new(ApiState { services, greeting }),
            port,
            static_dir: None,
        }
    }

    /// Serve the web client from `dir`
    #[must_use]
    pub fn static_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.static_dir = dir;
        self
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let mut app = Router::new()
            .merge(health::router())
            .merge(websocket::router(Arc::clone(&self.state)));

        if let Some(dir) = &self.static_dir {
            tracing::info!(path = %dir.display(), "serving web client");
            app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
        }

        app.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until ctrl-c
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound or the server fails
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;
        tracing::info!(port = self.port, "API server listening");

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;
        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
