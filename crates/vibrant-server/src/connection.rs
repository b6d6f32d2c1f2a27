//! Agent WebSocket lifecycle: validate the client id, register, pump frames,
//! deregister.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use vibrant_core::{ClientId, ClientIdError, CommandPayload};

use crate::broker::{CommandBroker, DispatchOutcome};
use crate::fanout::AgentConnection;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Validating,
    Active,
    Closed,
}

/// Why a connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    IdleTimeout,
    TransportError,
    WriterStopped,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::TransportError => "transport_error",
            Self::WriterStopped => "writer_stopped",
        }
    }
}

/// One agent connection's membership in its client's fan-out.
pub struct AgentSession {
    connection: Arc<AgentConnection>,
    broker: Arc<CommandBroker>,
    state: Mutex<ConnectionState>,
}

impl AgentSession {
    /// Parse the path's client id. A malformed id never reaches `Active`.
    pub fn validate(
        raw_client_id: &str,
        broker: Arc<CommandBroker>,
        queue_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<Arc<String>>), ClientIdError> {
        let client_id = ClientId::parse(raw_client_id)?;
        let (connection, rx) = AgentConnection::channel(client_id, queue_capacity);
        let session = Self {
            connection,
            broker,
            state: Mutex::new(ConnectionState::Validating),
        };
        Ok((session, rx))
    }

    pub fn client_id(&self) -> &ClientId {
        &self.connection.client_id
    }

    pub fn connection(&self) -> &Arc<AgentConnection> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Register with the fan-out. Returns `false` unless the session was
    /// still validating.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Validating {
            return false;
        }
        let members = self.broker.fanouts().register(Arc::clone(&self.connection));
        *state = ConnectionState::Active;
        info!(
            client_id = %self.connection.client_id,
            connection_id = %self.connection.id,
            members,
            "agent connected"
        );
        true
    }

    /// Leave the fan-out. Safe to call more than once.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return;
        }
        let was_active = *state == ConnectionState::Active;
        *state = ConnectionState::Closed;
        drop(state);

        if was_active && self.broker.fanouts().deregister(&self.connection) {
            let remaining = self
                .broker
                .fanouts()
                .get(&self.connection.client_id)
                .map_or(0, |f| f.count());
            info!(
                client_id = %self.connection.client_id,
                connection_id = %self.connection.id,
                remaining,
                "agent disconnected"
            );
        }
    }

    /// Hand one inbound text frame to the broker.
    pub fn handle_text(&self, text: &str) -> DispatchOutcome {
        let outcome = self.broker.dispatch(&self.connection.client_id, text);
        if !matches!(outcome, DispatchOutcome::Resolved(_)) {
            debug!(connection_id = %self.connection.id, ?outcome, "agent message not applied");
        }
        outcome
    }

    /// Evaluate `script` on this client after `delay`.
    pub fn spawn_welcome(&self, script: String, delay: Duration) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let client_id = self.connection.client_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match broker.send(&client_id, CommandPayload::evaluate(script)) {
                Ok(request_id) => debug!(client_id = %client_id, request_id = %request_id, "sent welcome script"),
                Err(e) => warn!(client_id = %client_id, error = %e, "failed to send welcome script"),
            }
        })
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Timing for a running connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionTimings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

/// Run an agent connection until it closes.
///
/// The writer task forwards queued envelopes and sends periodic Ping frames.
/// The reader loop dispatches every text frame and closes the connection
/// after `idle_timeout` without any inbound frame (pongs count).
#[instrument(skip_all, fields(client_id = %session.client_id()))]
pub async fn run_connection(
    ws: WebSocket,
    session: AgentSession,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    timings: ConnectionTimings,
    welcome: Option<(String, Duration)>,
) -> CloseReason {
    let (mut ws_tx, mut ws_rx) = ws.split();

    if !session.start() {
        return CloseReason::PeerClosed;
    }
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    let welcome_task = welcome.map(|(script, delay)| session.spawn_welcome(script, delay));

    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(timings.heartbeat_interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut last_seen = tokio::time::Instant::now();
    let reason = loop {
        let idle_deadline = last_seen + timings.idle_timeout;
        tokio::select! {
            frame = ws_rx.next() => {
                last_seen = tokio::time::Instant::now();
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_text(text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            session.handle_text(text);
                        }
                        Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read failed");
                        break CloseReason::TransportError;
                    }
                }
            }
            () = tokio::time::sleep_until(idle_deadline) => {
                info!(idle_secs = timings.idle_timeout.as_secs(), "closing idle agent connection");
                break CloseReason::IdleTimeout;
            }
            _ = &mut writer => break CloseReason::WriterStopped,
        }
    };

    session.close();
    writer.abort();
    if let Some(task) = welcome_task {
        task.abort();
    }
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(reason = reason.as_str(), "agent connection closed");
    reason
}
