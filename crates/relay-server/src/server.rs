use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use relay_engine::is_valid_agent_id;
use relay_settings::RelaySettings;

use crate::client::{self, ClientRegistry};
use crate::error::ServerError;
use crate::gateway::GatewaySession;
use crate::hub::ChannelHub;
use crate::orchestrator::Orchestrator;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_send_queue: settings.server.max_send_queue,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<ChannelHub>,
    pub clients: Arc<ClientRegistry>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve until the handle is shut down.
pub async fn start(
    config: ServerConfig,
    hub: Arc<ChannelHub>,
    orchestrator: Arc<Orchestrator>,
) -> Result<ServerHandle, ServerError> {
    let clients = Arc::new(ClientRegistry::new(config.max_send_queue));
    let cleanup = client::start_cleanup_task(Arc::clone(&clients), CLEANUP_INTERVAL);

    let router = build_router(AppState {
        orchestrator,
        hub,
        clients,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "relay server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.cleanup.abort();
        let _ = self.server.await;
        tracing::info!(port = self.port, "relay server stopped");
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    user: String,
}

/// WebSocket upgrade handler. `?user=` names the identity the client
/// speaks as on the hub.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    if !is_valid_agent_id(&params.user) || params.user == state.orchestrator.config().id {
        return (StatusCode::BAD_REQUEST, "invalid user id").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, params.user, state))
}

async fn handle_socket(socket: WebSocket, user_id: String, state: AppState) {
    let (client, rx) = state.clients.register(user_id.as_str());
    tracing::info!(client_id = %client.id, user_id = %user_id, "websocket client connected");

    let gateway = GatewaySession::new(state.hub.connect(user_id), Arc::clone(&client));
    client::handle_ws_connection(socket, client, rx, state.clients, gateway).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.health())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.metrics().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorConfig;
    use relay_telemetry::MetricsRecorder;

    fn state() -> AppState {
        let hub = Arc::new(ChannelHub::new(64));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(hub.connect("orchestrator")),
            Arc::new(MetricsRecorder::new()),
        );
        AppState {
            orchestrator,
            hub,
            clients: Arc::new(ClientRegistry::new(32)),
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let s = state();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };

        let handle = start(config, s.hub, s.orchestrator).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agents"]["total"], 0);
        assert_eq!(body["sessions"]["active"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_lists_recorded_series() {
        let s = state();
        s.orchestrator
            .metrics()
            .counter_inc("messages.routed", &[("kind", "announce")], 2);
        s.orchestrator
            .metrics()
            .histogram_observe("session.duration_ms", &[], 40.0);
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, s.hub, s.orchestrator).await.unwrap();

        let url = format!("http://127.0.0.1:{}/metrics", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["taken_at"].is_string());
        let samples = body["samples"].as_array().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0]["name"], "messages.routed");
        assert_eq!(samples[0]["kind"], "counter");
        assert_eq!(samples[0]["labels"]["kind"], "announce");
        assert_eq!(samples[0]["value"], 2.0);
        assert_eq!(samples[1]["summary"]["count"], 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let s = state();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, s.hub, s.orchestrator).await.unwrap();

        let url = format!("http://127.0.0.1:{}/ws?user=alice", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert!(resp.status().is_client_error());

        handle.shutdown().await;
    }

    #[test]
    fn config_from_settings() {
        let mut settings = RelaySettings::default();
        settings.server.port = 4000;
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_send_queue, 256);
    }

    #[test]
    fn build_router_creates_routes() {
        let _router = build_router(state());
    }
}
