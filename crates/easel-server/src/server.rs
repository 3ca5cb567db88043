use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use easel_settings::EaselSettings;
use easel_telemetry::metrics::MetricsRecorder;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Hub;
use crate::driver;

/// Build the HTTP router for health and stats.
pub fn build_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(hub)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listeners and start serving. Returns a handle to shut it down.
pub async fn start(
    settings: &EaselSettings,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let hub = Arc::new(Hub::new(settings, metrics));
    let shutdown = CancellationToken::new();

    let host = settings.server.host.as_str();
    let listener = TcpListener::bind((host, settings.server.port)).await?;
    let local_addr = listener.local_addr()?;
    let health_listener = TcpListener::bind((host, settings.server.health_port)).await?;
    let health_addr = health_listener.local_addr()?;

    let accept = tokio::spawn(accept_loop(listener, Arc::clone(&hub), shutdown.clone()));

    let router = build_router(Arc::clone(&hub));
    let health_shutdown = shutdown.clone();
    let health = tokio::spawn(async move {
        let served = axum::serve(health_listener, router)
            .with_graceful_shutdown(async move { health_shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "Health endpoint failed");
        }
    });

    let cleanup = driver::start_cleanup_task(
        Arc::clone(&hub),
        Duration::from_secs(settings.limits.cleanup_interval_secs.max(1)),
        shutdown.clone(),
    );

    tracing::info!(
        port = local_addr.port(),
        health_port = health_addr.port(),
        user_limit = settings.limits.user_limit,
        session_limit = settings.limits.session_limit,
        "Easel server started"
    );

    Ok(ServerHandle {
        addr: local_addr,
        health_addr,
        hub,
        shutdown,
        tasks: vec![accept, health, cleanup],
    })
}

async fn accept_loop(listener: TcpListener, hub: Arc<Hub>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        match hub.connect(peer) {
            Ok(handle) => {
                tokio::spawn(driver::serve_connection(stream, handle, Arc::clone(&hub)));
            }
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "Connection refused");
                drop(stream);
            }
        }
    }
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub health_addr: SocketAddr,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn health_port(&self) -> u16 {
        self.health_addr.port()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Stop accepting, close every connection and wait for the background
    /// tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.hub.connections().handles() {
            handle.close();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("Easel server stopped");
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": hub.connections().count(),
        "sessions": hub.sessions().count(),
    }))
}

/// Metrics and per-connection state.
async fn stats_handler(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "connections": hub.connections().connection_info(),
        "sessions": hub.sessions().ids(),
        "metrics": hub.metrics().snapshot(),
    }))
}
