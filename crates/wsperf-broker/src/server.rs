use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use wsperf_core::messages::WSPERF_SUBPROTOCOL;
use wsperf_core::ConnectionId;

use crate::config::BrokerConfig;
use crate::event_bridge::EventBridge;
use crate::handlers::HandlerState;
use crate::observer::{self, ObserverRegistry};
use crate::registry::WorkerRegistry;
use crate::relay::ResultRelay;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::session::{run_worker_connection, WorkerEndpoint};
use crate::shutdown::ShutdownCoordinator;

/// Body of the rejection sent to clients that do not offer the subprotocol.
pub const SUBPROTOCOL_REQUIRED: &str = "You need to speak wsperf subprotocol with this server!";

/// Shared state of the observer-facing router.
#[derive(Clone)]
pub struct ObserverState {
    pub handler_state: Arc<HandlerState>,
    pub observers: Arc<ObserverRegistry>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
    pub heartbeat_interval: Duration,
    pub metrics: Option<PrometheusHandle>,
}

/// Router for the worker endpoint: `/` and `/ws`.
pub fn build_worker_router(endpoint: WorkerEndpoint) -> Router {
    Router::new()
        .route("/", get(worker_ws_handler))
        .route("/ws", get(worker_ws_handler))
        .with_state(endpoint)
        .layer(TraceLayer::new_for_http())
}

/// Router for observers: WebSocket RPC, health and metrics.
pub fn build_observer_router(state: ObserverState) -> Router {
    Router::new()
        .route("/ws", get(observer_ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn offers_subprotocol(headers: &HeaderMap, protocol: &str) -> bool {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|offered| offered.trim() == protocol)
}

async fn worker_ws_handler(
    State(endpoint): State<WorkerEndpoint>,
    headers: HeaderMap,
    extensions: Extensions,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !offers_subprotocol(&headers, WSPERF_SUBPROTOCOL) {
        warn!("rejecting worker without {WSPERF_SUBPROTOCOL} subprotocol");
        return (StatusCode::BAD_REQUEST, SUBPROTOCOL_REQUIRED).into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)), |info| info.0);

    ws.protocols([WSPERF_SUBPROTOCOL])
        .on_upgrade(move |socket| run_worker_connection(socket, peer, endpoint))
}

async fn observer_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ObserverState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, state))
}

async fn handle_observer_socket(socket: WebSocket, state: ObserverState) {
    let (observer_id, rx) = state.observers.register();
    info!(observer = %observer_id, "observer connected");

    let established = serde_json::json!({
        "type": "connection.established",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": { "clientId": observer_id },
    });
    let _ = state.observers.send_to(&observer_id, established.to_string());

    observer::handle_observer_connection(
        socket,
        observer_id,
        rx,
        state.observers,
        state.message_tx,
        state.heartbeat_interval,
    )
    .await;
}

async fn health_handler(State(state): State<ObserverState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "workers": state.handler_state.registry.count(),
        "observers": state.observers.count(),
    }))
}

async fn metrics_handler(State(state): State<ObserverState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Process incoming RPC messages from observers, one at a time.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    state: Arc<HandlerState>,
    observers: Arc<ObserverRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            received = rx.recv() => received,
            () = shutdown.cancelled() => break,
        };
        let Some((observer_id, raw_message)) = received else {
            break;
        };
        let response = match serde_json::from_str::<RpcRequest>(&raw_message) {
            Ok(request) => {
                let params = request.params.unwrap_or(serde_json::json!({}));
                crate::handlers::dispatch(&state, &request.method, &params, request.id)
            }
            Err(e) => {
                warn!(observer = %observer_id, error = %e, "unparseable observer request");
                RpcResponse::parse_error()
            }
        };

        if let Ok(json) = serde_json::to_string(&response) {
            let _ = observers.send_to(&observer_id, json);
        }
    }
}

async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    name: &'static str,
) {
    let service = router.into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, service)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        warn!(listener = name, error = %e, "listener stopped with error");
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, std::io::Error> {
    TcpListener::bind((host, port)).await
}

/// Start every listener of the broker. Returns once all sockets are bound.
pub async fn start(
    config: &BrokerConfig,
    metrics: Option<PrometheusHandle>,
) -> Result<BrokerHandle, std::io::Error> {
    let relay = ResultRelay::new(config.event_buffer);
    let registry = Arc::new(WorkerRegistry::new(relay.clone()));
    let observers = Arc::new(ObserverRegistry::new(config.send_queue));
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&registry));

    let bridge = EventBridge::new(Arc::clone(&observers)).start(relay.subscribe(), coordinator.token());
    coordinator.track(bridge);

    let handler_state = Arc::new(HandlerState::new(Arc::clone(&registry)));
    let (msg_tx, msg_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        Arc::clone(&handler_state),
        Arc::clone(&observers),
        coordinator.token(),
    ));
    coordinator.track(rpc);

    let endpoint = WorkerEndpoint {
        registry: Arc::clone(&registry),
        relay: relay.clone(),
        send_queue: config.send_queue,
        heartbeat_interval: config.heartbeat_interval(),
        shutdown: coordinator.token(),
    };
    let worker_listener = bind(&config.host, config.worker_port).await?;
    let worker_addr = worker_listener.local_addr()?;
    let worker_server = tokio::spawn(serve(
        worker_listener,
        build_worker_router(endpoint),
        coordinator.token(),
        "worker",
    ));
    coordinator.track(worker_server);

    let observer_state = ObserverState {
        handler_state,
        observers: Arc::clone(&observers),
        message_tx: msg_tx,
        heartbeat_interval: config.heartbeat_interval(),
        metrics,
    };
    let observer_listener = bind(&config.host, config.observer_port).await?;
    let observer_addr = observer_listener.local_addr()?;
    let observer_server = tokio::spawn(serve(
        observer_listener,
        build_observer_router(observer_state),
        coordinator.token(),
        "observer",
    ));
    coordinator.track(observer_server);

    let static_addr = match &config.static_dir {
        Some(dir) => {
            let listener = bind(&config.host, config.static_port).await?;
            let addr = listener.local_addr()?;
            let router = Router::new()
                .fallback_service(ServeDir::new(dir))
                .layer(TraceLayer::new_for_http());
            let static_server = tokio::spawn(serve(listener, router, coordinator.token(), "static"));
            coordinator.track(static_server);
            info!(%addr, dir = %dir.display(), "static files served");
            Some(addr)
        }
        None => None,
    };

    info!(%worker_addr, %observer_addr, "wsperf broker started");

    Ok(BrokerHandle {
        worker_addr,
        observer_addr,
        static_addr,
        registry,
        coordinator,
    })
}

/// Handle returned by [`start`]. Keeps the broker's tasks and state reachable.
pub struct BrokerHandle {
    pub worker_addr: SocketAddr,
    pub observer_addr: SocketAddr,
    pub static_addr: Option<SocketAddr>,
    pub registry: Arc<WorkerRegistry>,
    coordinator: ShutdownCoordinator,
}

impl BrokerHandle {
    /// Token cancelled when the broker begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.coordinator.token()
    }

    /// Clear the registry, stop the listeners and wait for background tasks.
    pub async fn shutdown(self) {
        let report = self.coordinator.run().await;
        info!(
            workers = report.workers_removed,
            timed_out = report.timed_out,
            "wsperf broker stopped"
        );
    }
}
