pub mod api;
pub mod auth;
pub mod carrier;
pub mod config;
pub mod error;
pub mod realtime;
pub mod state;
pub mod webhook;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use smsdesk_store::MessageStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::carrier::Carrier;
use crate::config::{RealtimeConfig, ServerConfig};
use crate::realtime::{ChannelHub, RealtimeTransport, SocketHub, TransportKind};
use crate::state::AppState;

/// Build the route table. Only the configured real-time transport is mounted.
pub fn build_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/health", get(api::health))
        .route("/me", get(api::me))
        .route("/assigned-phone-number", get(api::phone_numbers))
        .route("/contacts", get(api::contacts).post(api::create_contact))
        .route(
            "/contacts/{id}",
            axum::routing::patch(api::update_contact).delete(api::delete_contact),
        )
        .route("/conversation/{contact_id}", get(api::conversation))
        .route("/send", post(api::send))
        .route("/mark-read/{contact_id}", post(api::mark_read))
        .route("/webhook/sms", post(webhook::inbound_sms));

    let router = match state.fanout.transport().kind() {
        TransportKind::Socket => {
            router.route("/realtime/socket", get(realtime::socket::socket_handler))
        }
        TransportKind::Channel => {
            router.route("/realtime/channel", get(realtime::channel::channel_handler))
        }
    };
    router.with_state(state)
}

pub fn build_transport(config: &RealtimeConfig) -> Arc<dyn RealtimeTransport> {
    match config.transport {
        TransportKind::Socket => Arc::new(SocketHub::new(config.capacity)),
        TransportKind::Channel => Arc::new(ChannelHub::new(config.capacity, config.history)),
    }
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allow_origins value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(methods)
        .allow_headers(Any))
}

/// Open the store, seed it and assemble the application state.
pub fn prepare(config: &ServerConfig) -> Result<Arc<AppState>> {
    let store = match &config.database {
        Some(path) => MessageStore::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?,
        None => MessageStore::open_in_memory()?,
    };
    config.seed(&store)?;
    let carrier = Carrier::from_config(&config.carrier)?;
    let transport = build_transport(&config.realtime);
    tracing::info!(
        transport = %transport.kind(),
        carrier = carrier.name(),
        "server state ready"
    );
    Ok(AppState::new(Arc::new(store), transport, carrier))
}

/// Serve until `shutdown` resolves, then close real-time streams and drain.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cors: CorsLayer,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state.clone()).layer(cors);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            state.shutdown();
        })
        .await?;
    Ok(())
}

/// Spawn a server on `config.listen` in the background. Dropping or firing
/// the returned sender shuts it down.
pub async fn spawn_server(
    config: &ServerConfig,
) -> Result<(SocketAddr, Arc<AppState>, oneshot::Sender<()>)> {
    let state = prepare(config)?;
    let cors = build_cors(&config.allow_origins)?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task_state = state.clone();
    tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = serve(listener, task_state, cors, shutdown).await {
            tracing::error!("server stopped: {e}");
        }
    });

    Ok((addr, state, shutdown_tx))
}
