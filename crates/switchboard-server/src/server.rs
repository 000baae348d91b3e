//! `SwitchboardServer`: wires registry, dispatcher, heartbeat and the axum
//! router into one node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use switchboard_broker::{HubPeer, NoopBroker, RelayBroker, RelayHub};
use switchboard_core::{Broker, BrokerError};
use switchboard_settings::{BrokerKind, BrokerSettings, SwitchboardSettings};
use switchboard_telemetry::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse, NodeStatus};
use crate::heartbeat;
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::transport;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<ServerConfig>,
    /// Present when this node hosts the relay hub.
    pub relay_hub: Option<RelayHub>,
    pub prometheus: Option<PrometheusHandle>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/ws", get(transport::ws::ws_handler))
        .route("/sse", get(transport::sse::sse_handler))
        .route("/send", post(api::send_handler))
        .route("/broadcast", post(api::broadcast_handler))
        .route("/disconnect", post(api::disconnect_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(api::metrics_handler));
    if state.relay_hub.is_some() {
        router = router.route("/relay", get(transport::relay::relay_handler));
    }
    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// GET /health. Answers 503 while cross-node delivery is impaired.
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let node = NodeStatus {
        connections: state.registry.connection_count(),
        recipients: state.registry.recipient_count(),
        broker_connected: state.dispatcher.broker_connected(),
        subscribed: state.dispatcher.is_subscribed(),
    };
    let resp = health::health_check(
        state.dispatcher.node_id().as_str(),
        state.dispatcher.broker_name(),
        state.started_at,
        state.start_time,
        node,
    );
    let status = if resp.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

/// Connect the broker backend named by `settings`.
///
/// A relay node without a `relay_url` joins its own hub in-process.
pub async fn connect_broker(
    settings: &BrokerSettings,
    hub: Option<&RelayHub>,
) -> Result<Arc<dyn Broker>, BrokerError> {
    match settings.kind {
        BrokerKind::Local => Ok(Arc::new(NoopBroker)),
        BrokerKind::Relay => match (settings.relay_url.as_deref(), hub) {
            (Some(url), _) => Ok(Arc::new(RelayBroker::connect(url).await?)),
            (None, Some(hub)) => Ok(Arc::new(HubPeer::join(hub))),
            (None, None) => Err(BrokerError::Connect {
                url: String::new(),
                reason: "relay broker needs a relay url or a hosted hub".into(),
            }),
        },
    }
}

/// One switchboard node, ready to listen.
pub struct SwitchboardServer {
    config: Arc<ServerConfig>,
    registry: ConnectionRegistry,
    dispatcher: Arc<Dispatcher>,
    relay_hub: Option<RelayHub>,
    prometheus: Option<PrometheusHandle>,
}

impl SwitchboardServer {
    /// Start the dispatcher over `broker`. Fails if the fan-out topic cannot
    /// be subscribed.
    pub async fn new(
        config: ServerConfig,
        broker: Arc<dyn Broker>,
        relay_hub: Option<RelayHub>,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<Self, ServerError> {
        let registry = ConnectionRegistry::new(config.delivery);
        let dispatcher = Dispatcher::start(
            registry.clone(),
            broker,
            config.topic.clone(),
            config.node_id.clone(),
        )
        .await?;
        Ok(Self {
            config: Arc::new(config),
            registry,
            dispatcher: Arc::new(dispatcher),
            relay_hub,
            prometheus,
        })
    }

    /// Validate, resolve config, host the hub if asked, connect the broker
    /// and start.
    pub async fn from_settings(
        settings: &SwitchboardSettings,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<Self, ServerError> {
        settings.validate()?;
        let config = ServerConfig::from_settings(settings);
        let relay_hub = config.host_relay.then(RelayHub::new);
        let broker = connect_broker(&settings.broker, relay_hub.as_ref()).await?;
        Self::new(config, broker, relay_hub, prometheus).await
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        build_router(AppState {
            registry: self.registry.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            config: Arc::clone(&self.config),
            relay_hub: self.relay_hub.clone(),
            prometheus: self.prometheus.clone(),
            start_time: Instant::now(),
            started_at: Utc::now(),
        })
    }

    /// Bind, serve, and start the heartbeat. Returns once the port is bound.
    pub async fn listen(self) -> Result<ServerHandle, ServerError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let shutdown = ShutdownCoordinator::new();
        let router = self.router();
        let serve_token = shutdown.token();
        shutdown.spawn("http", async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "http server stopped");
            }
        });

        if let Some(interval) = self.config.heartbeat_interval {
            let registry = self.registry.clone();
            let token = shutdown.token();
            shutdown.spawn("heartbeat", async move {
                let _ = heartbeat::run_heartbeat(registry, interval, token).await;
            });
        }

        info!(
            addr = %local_addr,
            node = %self.config.node_id,
            broker = self.dispatcher.broker_name(),
            relay_hub = self.relay_hub.is_some(),
            "switchboard node listening"
        );

        Ok(ServerHandle {
            local_addr,
            registry: self.registry,
            dispatcher: self.dispatcher,
            relay_hub: self.relay_hub,
            shutdown,
        })
    }
}

/// Handle to a listening node.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    dispatcher: Arc<Dispatcher>,
    relay_hub: Option<RelayHub>,
    shutdown: ShutdownCoordinator,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Close every connection, stop the pump, drop relay peers, then drain
    /// background tasks.
    pub async fn shutdown(self) {
        let closed = self.registry.shutdown();
        info!(closed, "closed connections for shutdown");
        self.dispatcher.shutdown().await;
        if let Some(hub) = &self.relay_hub {
            hub.close();
        }
        self.shutdown.graceful_shutdown(None).await;
    }
}
