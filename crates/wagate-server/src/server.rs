use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use wagate_core::security::AdminToken;
use wagate_engine::InstanceManager;
use wagate_telemetry::SqliteLogSink;

use crate::auth::require_admin;
use crate::config::ServerConfig;
use crate::{handlers, sse};

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub logs: Option<Arc<SqliteLogSink>>,
    pub admin_token: Option<AdminToken>,
    pub sse_keepalive: Duration,
}

/// Build the router with all routes.
///
/// The SSE route is merged after the timeout layer so long-lived streams are
/// not cut off.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let admin = Router::new()
        .route("/instances", get(handlers::list_instances).post(handlers::create_instance))
        .route(
            "/instances/{name}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/instances/{name}/status", get(handlers::instance_status))
        .route("/instances/{name}/connect", post(handlers::connect_instance))
        .route("/instances/{name}/disconnect", post(handlers::disconnect_instance))
        .route("/instances/{name}/webhook", patch(handlers::update_webhook))
        .route("/instances/{name}/config", patch(handlers::update_config))
        .route("/instances/{name}/apikey", post(handlers::rotate_api_key))
        .route("/logs", get(handlers::logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/instances/{name}/qrcode", get(handlers::qrcode))
        .route("/instances/{name}/send/text", post(handlers::send_text))
        .route("/instances/{name}/send/media", post(handlers::send_media));

    let streaming = Router::new().route("/instances/{name}/sse", get(sse::instance_events));

    admin
        .merge(public)
        .layer(TimeoutLayer::new(config.request_timeout))
        .merge(streaming)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and start serving. Returns a handle to stop the server.
pub async fn start(
    config: ServerConfig,
    manager: Arc<InstanceManager>,
    logs: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        manager,
        logs,
        admin_token: config.admin_token.clone(),
        sse_keepalive: config.sse_keepalive,
    };
    if state.admin_token.is_none() {
        warn!("no admin token configured; management routes are open");
    }

    let router = build_router(state, &config);
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server terminated");
        }
    });

    info!(%addr, "wagate server started");

    Ok(ServerHandle {
        addr,
        shutdown,
        server,
        grace: config.shutdown_grace,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    grace: Duration,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for in-flight requests. Open SSE
    /// streams never finish on their own, so the wait is bounded.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if tokio::time::timeout(self.grace, &mut self.server).await.is_err() {
            warn!("graceful shutdown timed out; aborting open connections");
            self.server.abort();
        }
        info!("wagate server stopped");
    }
}
