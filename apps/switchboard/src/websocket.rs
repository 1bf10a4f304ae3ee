use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use metrics::gauge;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{decode_frame, encode_frame, OutboundEvent};
use crate::registry::ConnectionId;
use crate::router::Emitter;
use crate::server::AppState;

/// Live connections and the channel feeding each one's writer task.
#[derive(Default)]
pub struct ConnectionHub {
    senders: DashMap<ConnectionId, mpsc::UnboundedSender<OutboundEvent>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, connection: ConnectionId) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(connection, tx);
        gauge!("switchboard_connections", self.senders.len() as f64);
        rx
    }

    fn detach(&self, connection: ConnectionId) {
        self.senders.remove(&connection);
        gauge!("switchboard_connections", self.senders.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl Emitter for ConnectionHub {
    fn emit(&self, connection: ConnectionId, event: OutboundEvent) -> bool {
        match self.senders.get(&connection) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let connection = ConnectionId::new();
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.hub.attach(connection);

    info!(connection_id = %connection, remote_addr = %remote_addr, "connection opened");

    let ping_interval = state.config.ping_interval;
    let writer = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(ping_interval);
        // The first tick completes immediately.
        keepalive.tick().await;
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match encode_frame(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(connection_id = %connection, "failed to encode {}: {}", event.name(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Message sender task ended for connection {}", connection);
    });

    read_frames(&mut receiver, &state, connection, state.config.idle_timeout).await;

    // Clean up on disconnect
    state.router.disconnect(connection);
    state.hub.detach(connection);
    writer.abort();

    info!(connection_id = %connection, remote_addr = %remote_addr, "connection closed");
}

async fn read_frames(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &AppState,
    connection: ConnectionId,
    idle_timeout: Duration,
) {
    loop {
        let msg = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error from connection {}: {}", connection, e);
                return;
            }
            Ok(None) => return,
            Err(_) => {
                info!(connection_id = %connection, "idle timeout; closing connection");
                return;
            }
        };

        match msg {
            Message::Text(text) => handle_frame(state, connection, &text),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => handle_frame(state, connection, text),
                Err(_) => debug!(
                    "Ignoring non-UTF8 Binary frame from connection {} ({} bytes)",
                    connection,
                    data.len()
                ),
            },
            Message::Close(_) => {
                debug!("Received Close frame from connection {}", connection);
                return;
            }
            // Ping/Pong only refresh the idle timer.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

fn handle_frame(state: &AppState, connection: ConnectionId, text: &str) {
    match decode_frame(text) {
        Ok(event) => {
            let name = event.name();
            let outcome = state.router.dispatch(connection, event);
            debug!(connection_id = %connection, event = name, ?outcome, "frame handled");
        }
        Err(e) => {
            debug!(connection_id = %connection, "dropping unparseable frame: {}", e);
        }
    }
}
