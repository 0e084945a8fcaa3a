use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use parley_core::ids::OwnerId;
use parley_core::provider::ModelClient;
use parley_settings::ServerSettings;
use parley_store::SessionStore;

use crate::handlers;
use crate::orchestrator::ChatOrchestrator;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub default_owner: OwnerId,
    pub cors_permissive: bool,
    pub stream_timeout: Duration,
    pub stream_channel_capacity: usize,
    /// Upper bound on producing response headers; streaming bodies are not
    /// limited by it.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            default_owner: OwnerId::from_raw(1),
            cors_permissive: true,
            stream_timeout: Duration::from_secs(90),
            stream_channel_capacity: 32,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            default_owner: settings.default_owner(),
            cors_permissive: settings.cors_permissive,
            stream_timeout: settings.stream_timeout(),
            stream_channel_capacity: settings.stream_channel_capacity,
            ..Default::default()
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub client: Arc<dyn ModelClient>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub default_owner: OwnerId,
    pub stream_timeout: Duration,
    pub stream_channel_capacity: usize,
}

impl AppState {
    pub fn new(config: &ServerConfig, store: SessionStore, client: Arc<dyn ModelClient>) -> Self {
        Self {
            orchestrator: Arc::new(ChatOrchestrator::new(store.clone(), Arc::clone(&client))),
            store,
            client,
            default_owner: config.default_owner,
            stream_timeout: config.stream_timeout,
            stream_channel_capacity: config.stream_channel_capacity,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/chat", post(handlers::chat))
        .route("/chat/stream", post(handlers::chat_stream))
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session)
                .put(handlers::update_session)
                .delete(handlers::delete_session),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http());

    if config.cors_permissive {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    store: SessionStore,
    client: Arc<dyn ModelClient>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(&config, store, client);
    let router = build_router(state, &config);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "parley server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server terminated with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        shutdown: Some(shutdown_tx),
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.server).await {
            tracing::warn!(error = %e, "server task did not shut down cleanly");
        }
        tracing::info!("parley server stopped");
    }
}
