use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broker::CommandBroker;
use crate::config::ServerConfig;
use crate::handlers;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<CommandBroker>,
    pub config: Arc<ServerConfig>,
    pub start_time: Instant,
    /// Present when a Prometheus recorder was installed at startup.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            broker: Arc::new(CommandBroker::new(config.broker_config())),
            config: Arc::new(config),
            start_time: Instant::now(),
            metrics,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/agents", get(handlers::list_agents))
        .route("/agents/{client_id}/subscribe", get(handlers::subscribe))
        .route("/agents/{client_id}/eval", post(handlers::eval))
        .route("/agents/{client_id}/screenshots", post(handlers::screenshots))
        .route("/agents/{client_id}/paste", post(handlers::paste))
        .route("/test_eval", get(handlers::test_eval))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, start the reaper, and serve. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let reaper_interval = config.reaper_interval();
    let state = AppState::new(config, metrics);
    let broker = Arc::clone(&state.broker);

    let reaper = broker.spawn_reaper(reaper_interval);

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "broker server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        broker,
        shutdown_tx: Some(shutdown_tx),
        server: Some(server),
        reaper,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    broker: Arc<CommandBroker>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn broker(&self) -> &Arc<CommandBroker> {
        &self.broker
    }

    /// Stop accepting connections and wait for in-flight HTTP requests.
    ///
    /// Open agent WebSockets are left to close on their own.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
        tracing::info!("broker server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.reaper.abort();
        if let Some(server) = &self.server {
            server.abort();
        }
    }
}
