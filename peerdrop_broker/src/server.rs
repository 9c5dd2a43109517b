//! WebSocket front end for the broker

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::store::MemoryRoomStore;
use anyhow::Result;
use axum::{
    Router,
    extract::{
        ConnectInfo, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Floor for keep-alive pings; `tokio::time::interval` rejects zero
const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

pub struct AppState {
    pub broker: Broker,
    pub config: BrokerConfig,
    connections: AtomicUsize,
}

impl AppState {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            broker: Broker::new(MemoryRoomStore::new(), config.max_room_peers),
            config,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Claim a connection slot, or `None` when the broker is full
    fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.max_connections;
        self.connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ConnectionSlot(self.clone()))
    }
}

/// Releases its connection slot on drop
struct ConnectionSlot(Arc<AppState>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn not_found_handler() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Middleware to add security headers
async fn add_security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );

    response
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let client = addr.to_string();

    let Some(slot) = state.try_acquire() else {
        tracing::warn!("Refusing {}: connection limit reached", client);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, slot, client))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot, client: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn = state.broker.connect(tx);
    tracing::info!("conn {} opened from {}", conn.id, client);

    let ping_interval = state.config.ping_interval.max(MIN_PING_INTERVAL);
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => state.broker.handle_text(&conn, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("conn {} read error: {}", conn.id, e);
                break;
            }
        }
    }

    state.broker.disconnect(&conn).await;
    writer.abort();
    tracing::info!("conn {} closed", conn.id);
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(add_security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until `cancel` fires
pub async fn serve(listener: TcpListener, state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let router = create_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        cancel.cancelled().await;
        tracing::info!("Broker shutting down gracefully");
    })
    .await?;
    Ok(())
}

/// Bind `config.bind_addr` and serve until `cancel` fires
pub async fn start_broker(config: BrokerConfig, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Broker listening on ws://{}/ws", listener.local_addr()?);
    serve(listener, Arc::new(AppState::new(config)), cancel).await
}

/// Bind an ephemeral localhost port and serve in the background
pub async fn spawn_local(config: BrokerConfig) -> Result<(SocketAddr, CancellationToken)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let cancel = CancellationToken::new();
    let state = Arc::new(AppState::new(config));
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(listener, state, token).await {
            tracing::error!("Broker stopped: {}", e);
        }
    });
    Ok((addr, cancel))
}
