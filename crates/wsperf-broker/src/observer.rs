use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use metrics::gauge;
use tokio::sync::mpsc;
use wsperf_core::ConnectionId;

use crate::metrics::OBSERVERS_CONNECTED;
use crate::session::GOING_AWAY_CLOSE_CODE;

/// Registry of all connected observer sessions.
pub struct ObserverRegistry {
    observers: DashMap<ConnectionId, mpsc::Sender<String>>,
    max_send_queue: usize,
}

impl ObserverRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            observers: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new observer and return its ID + outbound queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let _ = self.observers.insert(id.clone(), tx);
        gauge!(OBSERVERS_CONNECTED).set(self.observers.len() as f64);
        (id, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        if self.observers.remove(id).is_some() {
            gauge!(OBSERVERS_CONNECTED).set(self.observers.len() as f64);
        }
    }

    /// Send a message to one observer. Drops the message if its queue is full.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(tx) = self.observers.get(id) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    observer = %id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send a message to every observer. Returns how many queued it.
    pub fn broadcast_all(&self, message: &str) -> usize {
        self.observers
            .iter()
            .filter(|entry| entry.value().try_send(message.to_string()).is_ok())
            .count()
    }

    pub fn count(&self) -> usize {
        self.observers.len()
    }

    /// Drop every observer's queue. Writers send what is already queued, then
    /// close their socket.
    pub fn close_all(&self) -> usize {
        let closed = self.observers.len();
        self.observers.clear();
        gauge!(OBSERVERS_CONNECTED).set(0.0);
        closed
    }
}

/// Handle an observer connection: split into reader/writer with heartbeat.
pub async fn handle_observer_connection(
    socket: WebSocket,
    observer_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ObserverRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward queued messages to the socket + periodic ping.
    // Ends once the registry drops this observer's queue.
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let frame = CloseFrame {
                                code: GOING_AWAY_CLOSE_CODE,
                                reason: "broker shutting down".into(),
                            };
                            let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader task: forward requests to the RPC processor
    let reader_id = observer_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send((reader_id.clone(), text.to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&observer_id);
    tracing::info!(observer = %observer_id, "observer disconnected");
}
