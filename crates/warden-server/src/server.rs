//! `WardenServer`: axum HTTP + WebSocket front for the session broker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use warden_broker::SessionBroker;

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::{WS_CONNECTIONS_REJECTED_TOTAL, render};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SessionOptions, run_session};

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The broker every connection attaches to.
    pub broker: Arc<SessionBroker>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Attached WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The Warden server.
pub struct WardenServer {
    state: AppState,
}

impl WardenServer {
    /// Serve `broker` with `config`. Pass the handle returned by
    /// [`crate::metrics::install_recorder`] to enable `/metrics`.
    pub fn new(config: ServerConfig, broker: Arc<SessionBroker>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            state: AppState {
                broker,
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                connections: Arc::new(AtomicUsize::new(0)),
                metrics,
                start_time: Instant::now(),
            },
        }
    }

    /// Router with `/ws`, `/health` and `/metrics`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
    }

    /// Bind and serve in the background until shutdown.
    ///
    /// Returns the bound address (useful with port `0`). The serve task is
    /// tracked by the shutdown coordinator.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %e, "server error");
            }
        });
        self.state.shutdown.track(handle);

        info!(%addr, "warden server listening");
        Ok(addr)
    }

    /// Stop accepting connections, drain tracked tasks, then stop the broker.
    pub async fn shutdown_gracefully(&self, timeout: Duration) {
        info!("shutting down");
        self.state.shutdown.graceful_shutdown(timeout).await;
        self.state.broker.shutdown();
    }

    /// The broker.
    pub fn broker(&self) -> &Arc<SessionBroker> {
        &self.state.broker
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Attached WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

/// One admitted connection; frees its place on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(counter)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Some(slot) = ConnectionSlot::acquire(&state.connections, state.config.max_connections) else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(max = state.config.max_connections, "connection limit reached, rejecting");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let options = SessionOptions {
        channel_buffer: state.config.channel_buffer,
        ping_interval: state.config.ping_interval,
    };
    ws.on_upgrade(move |socket| async move {
        let _slot = slot;
        run_session(socket, state.broker, options, state.shutdown.token()).await;
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.broker.stats(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
