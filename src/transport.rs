//! WebSocket endpoint and static file serving under the secret path prefix

use crate::connection::{Connection, Frame, TransportError};
use crate::registry::Registry;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::borrow::Cow;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tower_http::services::ServeDir;

/// Unanswered pings tolerated before the connection is considered dead
pub const MAX_MISSED_PONGS: u32 = 2;

/// [`Connection`] over an axum WebSocket with a ping based liveness check
pub struct WebSocketConnection {
    socket: WebSocket,
    heartbeat: Interval,
    missed_pongs: u32,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, heartbeat: Duration) -> Self {
        let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            socket,
            heartbeat,
            missed_pongs: 0,
        }
    }
}

fn ws_error(e: axum::Error) -> TransportError {
    TransportError::WebSocket(e.to_string())
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Frame {
        loop {
            tokio::select! {
                message = self.socket.recv() => {
                    // Any traffic proves the peer is alive
                    self.missed_pongs = 0;
                    match message {
                        None => return Frame::Closed(None),
                        Some(Err(e)) => return Frame::Error(ws_error(e)),
                        Some(Ok(Message::Text(text))) => return Frame::Text(text),
                        Some(Ok(Message::Close(frame))) => {
                            return Frame::Closed(frame.map(|frame| frame.code))
                        }
                        // axum answers pings itself
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Binary(data))) => {
                            log::debug!("Ignoring {} byte binary message", data.len());
                        }
                    }
                }
                _ = self.heartbeat.tick() => {
                    if self.missed_pongs >= MAX_MISSED_PONGS {
                        return Frame::Error(TransportError::HeartbeatTimeout(self.missed_pongs));
                    }
                    self.missed_pongs += 1;
                    if let Err(e) = self.socket.send(Message::Ping(Vec::new())).await {
                        return Frame::Error(ws_error(e));
                    }
                }
            }
        }
    }

    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(text.to_string()))
            .await
            .map_err(ws_error)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: Cow::Owned(reason.to_string()),
            })))
            .await
            .map_err(ws_error)
    }
}

#[derive(Clone)]
struct TransportState {
    registry: Arc<Registry>,
    heartbeat: Duration,
}

async fn websocket(
    ws: WebSocketUpgrade,
    State(state): State<TransportState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let connection = WebSocketConnection::new(socket, state.heartbeat);
        state.registry.accept(Box::new(connection)).await;
    })
}

/// Routes served under `/{prefix}`: the WebSocket endpoint and, when a web root
/// is given, the browser client's files
pub fn router(
    registry: Arc<Registry>,
    prefix: &str,
    web_root: Option<PathBuf>,
    heartbeat: Duration,
) -> Router {
    let mut scoped = Router::new().route("/websocket", get(websocket));
    if let Some(root) = web_root {
        log::info!("Serving client files from {:?}", root);
        scoped = scoped.fallback_service(ServeDir::new(root));
    }
    Router::new()
        .nest(&format!("/{}", prefix), scoped)
        .with_state(TransportState {
            registry,
            heartbeat,
        })
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener, TransportError> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })
}

/// Serve until `stop` resolves. Live sessions are closed through the registry
/// before the listener goes away.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    registry: Arc<Registry>,
    stop: impl Future<Output = ()> + Send + 'static,
) -> Result<(), TransportError> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Listening on {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            stop.await;
            registry.shutdown().await;
        })
        .await?;
    log::info!("Server stopped");
    Ok(())
}
