//! Per-connection state for one worker.
//!
//! A connection starts `Connecting`, becomes `Ready` on its first
//! `test_welcome`, and ends `Closed`. Any protocol violation closes the
//! connection with code 3000; the worker is expected to reconnect on its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use wsperf_core::{
    CaseDefinition, ConnectionId, ProtocolError, RunId, TestCommand, WorkerId, WorkerMessage,
    WorkerRecord,
};

use crate::metrics::{
    COMMANDS_DROPPED_TOTAL, COMMANDS_SENT_TOTAL, PROTOCOL_ERRORS_TOTAL, WORKER_CONNECTIONS_TOTAL,
};
use crate::registry::{RegistryError, WorkerRegistry};
use crate::relay::ResultRelay;

/// Close code for broker-side faults (RFC 6455 "internal error").
pub const INTERNAL_ERROR_CLOSE_CODE: u16 = 1011;
/// Close code sent to workers when the broker shuts down.
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;

/// Close reasons must fit in a control frame (125 bytes minus the code).
const MAX_CLOSE_REASON: usize = 123;

/// Frames handed to a worker's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Pending close frame. Set once, outside the bounded command queue, so a
/// full queue can never swallow it.
#[derive(Debug, Default)]
struct CloseSignal {
    frame: Mutex<Option<(u16, String)>>,
    raised: CancellationToken,
}

/// Receive side of a worker connection, drained by the writer task.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<String>,
    close: Arc<CloseSignal>,
}

impl OutboundQueue {
    /// Next frame to write. A pending close is returned ahead of any queued
    /// command; `None` once the close has been taken or every handle is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            () = self.close.raised.cancelled() => {}
            text = self.rx.recv() => return text.map(Outbound::Text),
        }
        self.take_close()
    }

    pub fn try_recv(&mut self) -> Result<Outbound, mpsc::error::TryRecvError> {
        if self.close.raised.is_cancelled() {
            return self.take_close().ok_or(mpsc::error::TryRecvError::Disconnected);
        }
        self.rx.try_recv().map(Outbound::Text)
    }

    fn take_close(&self) -> Option<Outbound> {
        self.close
            .frame
            .lock()
            .take()
            .map(|(code, reason)| Outbound::Close { code, reason })
    }
}

/// Send side of a worker connection. Cheap to clone; the registry keeps one
/// per registered worker.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    connection_id: ConnectionId,
    tx: mpsc::Sender<String>,
    close: Arc<CloseSignal>,
}

impl WorkerHandle {
    /// Create the handle and writer queue for one connection. `capacity`
    /// bounds the commands waiting to be written.
    pub fn channel(connection_id: ConnectionId, capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let close = Arc::new(CloseSignal::default());
        let handle = Self {
            connection_id,
            tx,
            close: Arc::clone(&close),
        };
        (handle, OutboundQueue { rx, close })
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Queue the `message_test` command for `run_id`. Never waits; returns
    /// `false` when the connection is gone, closing, or its queue is full.
    pub fn run_case(&self, run_id: &RunId, case: &CaseDefinition) -> bool {
        let command = TestCommand::new(run_id, case);
        debug!(
            session = %self.connection_id,
            run_id = %run_id,
            name = command.name,
            command = %command,
            "sending test command"
        );
        if !self.close.raised.is_cancelled() && self.tx.try_send(command.to_string()).is_ok() {
            counter!(COMMANDS_SENT_TOTAL).increment(1);
            true
        } else {
            counter!(COMMANDS_DROPPED_TOTAL).increment(1);
            false
        }
    }

    /// Request a close frame. The writer sends it before any queued command
    /// and then stops. Only the first request per connection wins.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        let mut frame = self.close.frame.lock();
        if self.close.raised.is_cancelled() || self.tx.is_closed() {
            return false;
        }
        *frame = Some((code, truncate_reason(reason).to_owned()));
        self.close.raised.cancel();
        true
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Closed,
}

/// Why a session must close its connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SessionError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => ProtocolError::CLOSE_CODE,
            Self::Registry(_) => INTERNAL_ERROR_CLOSE_CODE,
        }
    }
}

/// Protocol state for one worker connection.
///
/// Holds only its own connection id as a back-reference into the registry;
/// the worker record itself is owned by [`WorkerRegistry`].
pub struct WorkerSession {
    worker_id: WorkerId,
    peer: SocketAddr,
    state: SessionState,
    handle: WorkerHandle,
    registry: Arc<WorkerRegistry>,
    relay: ResultRelay,
}

impl WorkerSession {
    /// Start a session for a freshly accepted connection. The worker identity
    /// is minted here, before the welcome arrives.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        relay: ResultRelay,
        handle: WorkerHandle,
        peer: SocketAddr,
    ) -> Self {
        let worker_id = registry.next_worker_id();
        Self {
            worker_id,
            peer,
            state: SessionState::Connecting,
            handle,
            registry,
            relay,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.handle.connection_id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle one text frame.
    ///
    /// `test_data` and `test_complete` are only relayed once the session is
    /// `Ready`. Before the welcome they are logged and dropped rather than
    /// published under the id minted at connect: no run can have been sent to
    /// an unregistered worker, so such results cannot belong to a known run.
    pub fn on_text(&mut self, text: &str) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let message = WorkerMessage::decode(text)?;
        debug!(worker_id = %self.worker_id, kind = message.kind(), ?message, "worker message");

        match message {
            WorkerMessage::Error { details } => {
                error!(
                    worker_id = %self.worker_id,
                    details = %serde_json::Value::Object(details),
                    "received ERROR from worker"
                );
            }
            WorkerMessage::TestComplete { token } => match (self.state, token) {
                (SessionState::Ready, Some(run_id)) => {
                    self.relay.on_complete(self.worker_id.clone(), run_id);
                }
                (SessionState::Ready, None) => {
                    debug!(worker_id = %self.worker_id, "test_complete without token");
                }
                _ => warn!(worker_id = %self.worker_id, "test_complete before welcome, dropped"),
            },
            WorkerMessage::TestData { token, data } => {
                if self.state == SessionState::Ready {
                    self.relay.on_result(self.worker_id.clone(), token, data);
                } else {
                    warn!(worker_id = %self.worker_id, run_id = %token, "test_data before welcome, dropped");
                }
            }
            WorkerMessage::TestWelcome { version, ident } => {
                if self.state == SessionState::Ready {
                    return Err(ProtocolError::DuplicateWelcome.into());
                }
                let record = WorkerRecord {
                    id: self.worker_id.clone(),
                    host: self.peer.ip().to_string(),
                    port: self.peer.port(),
                    version,
                    ident,
                };
                self.registry.add(self.handle.clone(), record)?;
                self.state = SessionState::Ready;
            }
        }
        Ok(())
    }

    /// Binary frames are never part of the protocol.
    pub fn on_binary(&mut self) -> Result<(), SessionError> {
        Err(ProtocolError::BinaryMessage.into())
    }

    /// Mark the session closed and drop its registry entry, whatever state it
    /// was in.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        let _ = self.registry.remove(self.handle.connection_id());
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.close();
        }
    }
}

/// Shared state for the worker-facing endpoint.
#[derive(Clone)]
pub struct WorkerEndpoint {
    pub registry: Arc<WorkerRegistry>,
    pub relay: ResultRelay,
    pub send_queue: usize,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Drive one upgraded worker connection until it closes.
pub async fn run_worker_connection(socket: WebSocket, peer: SocketAddr, endpoint: WorkerEndpoint) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut queue) = WorkerHandle::channel(ConnectionId::new(), endpoint.send_queue);
    let mut session = WorkerSession::new(
        Arc::clone(&endpoint.registry),
        endpoint.relay.clone(),
        handle.clone(),
        peer,
    );

    counter!(WORKER_CONNECTIONS_TOTAL).increment(1);
    info!(
        worker_id = %session.worker_id(),
        session = %session.connection_id(),
        %peer,
        "worker connected"
    );

    // Writer task: forward queued frames to the socket + periodic ping
    let heartbeat = endpoint.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                frame = queue.recv() => {
                    match frame {
                        Some(Outbound::Text(text)) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let frame = CloseFrame { code, reason: reason.into() };
                            let _ = ws_tx.send(Message::Close(Some(frame))).await;
                            break;
                        }
                        None => {
                            let _ = ws_tx.close().await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: frames from one worker are handled strictly in arrival order.
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = endpoint.shutdown.cancelled() => {
                handle.close(GOING_AWAY_CLOSE_CODE, "broker shutting down");
                break;
            }
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(worker_id = %session.worker_id(), error = %e, "worker socket error");
                break;
            }
            None => break,
        };

        let outcome = match frame {
            Message::Text(text) => session.on_text(text.as_str()),
            Message::Binary(_) => session.on_binary(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                trace!(worker_id = %session.worker_id(), "control frame");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            match &e {
                SessionError::Protocol(p) => {
                    counter!(PROTOCOL_ERRORS_TOTAL, "kind" => p.error_kind()).increment(1);
                    error!(worker_id = %session.worker_id(), %peer, "WSPERF_PROTOCOL_ERROR - {e}");
                }
                SessionError::Registry(_) => {
                    error!(worker_id = %session.worker_id(), %peer, "worker registry fault: {e}");
                }
            }
            handle.close(e.close_code(), &e.to_string());
            break;
        }
    }

    let worker_id = session.worker_id().clone();
    session.close();
    drop(session);
    drop(handle);
    let _ = writer.await;
    info!(worker_id = %worker_id, %peer, "worker disconnected");
}
