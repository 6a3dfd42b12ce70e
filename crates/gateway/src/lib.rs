//! The Lily gateway: HTTP router and WebSocket hub on one port.
//!
//! `start()` is the composition root — it constructs every component in
//! dependency order (config → memory → sessions → registry → LLM →
//! agent → speech clients → worker pool → hub), spawns the background
//! tasks, registers with the coordination store, and serves until
//! shutdown. Components receive `Arc` handles; there is no ambient
//! lookup and no cyclic ownership.

pub mod http;
pub mod hub;
pub mod ws;

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use lily_agent::AgentEngine;
use lily_config::ConfigStore;
use lily_core::error::{Error, GatewayError};
use lily_core::event::EventBus;
use lily_core::model::LanguageModel;
use lily_core::tool::ToolRouter;
use lily_llm::GeminiClient;
use lily_memory::ConversationStore;
use lily_registry::{ServiceRegistration, ServiceRegistry};
use lily_session::SessionTracker;
use lily_speech::{EchoClient, TtsClient};
use lily_workers::WorkerPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use hub::ConnectionHub;

/// Everything the handlers need, shared by `Arc`.
pub struct GatewayState {
    pub config: Arc<ConfigStore>,
    pub memory: Arc<ConversationStore>,
    pub sessions: Arc<SessionTracker>,
    pub registry: Arc<ServiceRegistry>,
    pub agent: Arc<AgentEngine>,
    pub pool: Arc<WorkerPool>,
    pub hub: Arc<ConnectionHub>,
    pub tts: Arc<TtsClient>,
    pub echo: Arc<EchoClient>,
    pub event_bus: Arc<EventBus>,
    pub start_time: DateTime<Utc>,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    /// Discovered Echo WebSocket URL, falling back to the configured
    /// override.
    pub async fn resolve_echo_url(state: &SharedState) -> Option<String> {
        if let Some(url) = state.registry.websocket_url_for("echo").await {
            return Some(url);
        }
        let fallback = state.config.echo_ws_url();
        (!fallback.is_empty()).then_some(fallback)
    }

    /// Discovered TTS WebSocket URL, falling back to the configured
    /// override.
    pub async fn resolve_tts_url(state: &SharedState) -> Option<String> {
        if let Some(url) = state.registry.websocket_url_for("tts-provider").await {
            return Some(url);
        }
        let fallback = state.config.tts_ws_url();
        (!fallback.is_empty()).then_some(fallback)
    }
}

/// Construct the full component graph in dependency order.
pub fn build_state(config: Arc<ConfigStore>) -> SharedState {
    let event_bus = Arc::new(EventBus::default());
    let memory = Arc::new(ConversationStore::new());
    let sessions = Arc::new(SessionTracker::new(
        config.session_timeout_minutes(),
        Arc::clone(&event_bus),
    ));
    let (consul_host, consul_port) = config.consul_addr();
    let registry = Arc::new(ServiceRegistry::new(
        &consul_host,
        consul_port,
        config.service_name(),
    ));
    let llm: Arc<dyn LanguageModel> = Arc::new(GeminiClient::new(Arc::clone(&config)));
    let tools: Arc<dyn ToolRouter> = registry.clone();
    let agent = Arc::new(AgentEngine::new(
        llm,
        tools,
        Arc::clone(&memory),
        Arc::clone(&config),
        Arc::clone(&event_bus),
    ));

    let workers = config.max_concurrent_tasks();
    let queue_size = config.max_queue_size();
    let pool = if workers == 0 {
        Arc::new(WorkerPool::with_defaults(queue_size))
    } else {
        Arc::new(WorkerPool::new(workers, queue_size))
    };

    Arc::new(GatewayState {
        config,
        memory,
        sessions,
        registry,
        agent,
        pool,
        hub: Arc::new(ConnectionHub::new()),
        tts: Arc::new(TtsClient::new()),
        echo: Arc::new(EchoClient::new()),
        event_bus,
        start_time: Utc::now(),
    })
}

/// Build the router: WebSocket upgrade plus the REST surface, the
/// latter mounted both bare and under `/api`.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let api = Router::new()
        .route("/health", get(http::health))
        .route("/config", get(http::get_config).post(http::update_config))
        .route("/monitoring", get(http::monitoring))
        .route("/tools", get(http::tools))
        .route("/active-sessions", get(http::active_sessions))
        .route("/connected-users", get(http::connected_users))
        .route("/chat", post(http::chat))
        .route(
            "/conversation/{user_id}",
            get(http::get_conversation).delete(http::delete_conversation),
        )
        .route("/agent-loops", get(http::agent_loops))
        .route("/agent-loops/users", get(http::agent_loop_users))
        .route(
            "/agent-loops/{user_id}",
            get(http::agent_loops_for_user).delete(http::clear_agent_loops),
        );

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(api.clone())
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Register this gateway with the coordination store. A missing store is
/// logged, not fatal.
async fn register_self(state: &SharedState) {
    let domain = state.config.domain_name();
    let host = if domain.is_empty() {
        state.config.http_address()
    } else {
        domain
    };
    let tags = vec!["websocket".to_string(), format!("hostname={host}")];
    let registration = ServiceRegistration::new(
        &state.config.service_name(),
        &host,
        state.config.http_port(),
        tags,
    );
    if let Err(e) = state.registry.register_self(registration).await {
        warn!(error = %e, "Self-registration failed; running undiscoverable");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Bring the gateway up and serve until SIGINT/SIGTERM.
pub async fn start(config: Arc<ConfigStore>) -> Result<(), Error> {
    let state = build_state(config);

    let addr = format!(
        "{}:{}",
        state.config.http_address(),
        state.config.http_port()
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::BindFailed {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

    // Background tasks
    let refresher = Arc::clone(&state.registry).spawn_refresher();
    let sweeper = Arc::clone(&state.sessions).spawn_sweeper();
    let ping_sweep = ws::spawn_ping_sweep(Arc::clone(&state));
    let event_forwarder = ws::spawn_session_event_forwarder(Arc::clone(&state));
    let echo_connector = ws::spawn_echo_connector(Arc::clone(&state));

    register_self(&state).await;

    let app = build_router(Arc::clone(&state));
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    // Orderly teardown: become undiscoverable first, then stop tasks,
    // then drain the pool
    state.registry.deregister_all().await;
    refresher.stop();
    sweeper.abort();
    ping_sweep.abort();
    event_forwarder.abort();
    echo_connector.abort();
    state.echo.disconnect().await;
    state.pool.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}
