//! Relay client: the engine's WebSocket link to the presence hub.
//!
//! DESIGN
//! ======
//! One background task owns the socket. The engine talks to it through a
//! [`RelayHandle`] (outbound queue + status watch) and receives decoded hub
//! messages on an `mpsc` channel. The relay is best effort: sends made while
//! the link is down are dropped, never queued for replay, because the ledger
//! subscription delivers the authoritative state anyway.
//!
//! Reconnect policy: after a failed connect or a dropped session the task
//! waits `base × 2^(attempt-1)` and tries again, up to `max_attempts` times.
//! A successful connect resets the counter. Once the attempts run out the
//! status becomes [`ConnectionStatus::Disconnected`] and the task exits.

#[cfg(test)]
#[path = "relay_test.rs"]
mod relay_test;

use std::time::Duration;

use frames::Message;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::consts::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, RELAY_QUEUE_CAPACITY};
use crate::error::ErrorCode;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay not connected")]
    NotConnected,
    #[error("relay queue full")]
    QueueFull,
    #[error("relay task stopped")]
    Closed,
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "E_RELAY_NOT_CONNECTED",
            Self::QueueFull => "E_RELAY_QUEUE_FULL",
            Self::Closed => "E_RELAY_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::QueueFull)
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hub WebSocket endpoint, e.g. `ws://127.0.0.1:3001/ws`.
    pub url: String,
    /// Sent as `identify` right after every successful connect.
    pub identity: Option<String>,
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub queue_capacity: usize,
}

impl RelayConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3001/ws".into(),
            identity: None,
            base_delay: RECONNECT_BASE_DELAY,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            queue_capacity: RELAY_QUEUE_CAPACITY,
        }
    }
}

/// Delay before reconnect attempt number `attempt` (1-based).
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1 << exponent)
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cheap, cloneable sender side of the relay link.
#[derive(Clone)]
pub struct RelayHandle {
    outbound: mpsc::Sender<Message>,
    status: watch::Receiver<ConnectionStatus>,
}

impl RelayHandle {
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch status transitions.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Queue a message for the hub.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotConnected`] while the link is down,
    /// [`RelayError::QueueFull`] under backpressure and
    /// [`RelayError::Closed`] once the relay task has exited.
    pub fn send(&self, message: Message) -> Result<(), RelayError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(RelayError::NotConnected);
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RelayError::Closed,
        })
    }
}

// =============================================================================
// TASK
// =============================================================================

enum SessionEnd {
    /// The socket dropped; try to reconnect.
    Dropped,
    /// The engine went away; stop for good.
    Shutdown,
}

/// Start the relay task. Returns the send handle, the stream of decoded
/// hub messages, and the task handle.
#[must_use]
pub fn spawn(config: RelayConfig) -> (RelayHandle, mpsc::Receiver<Message>, JoinHandle<()>) {
    let (out_tx, out_rx) = mpsc::channel(config.queue_capacity);
    let (in_tx, in_rx) = mpsc::channel(config.queue_capacity);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);

    let task = tokio::spawn(run(config, out_rx, in_tx, status_tx));
    (RelayHandle { outbound: out_tx, status: status_rx }, in_rx, task)
}

async fn run(
    config: RelayConfig,
    mut out_rx: mpsc::Receiver<Message>,
    in_tx: mpsc::Sender<Message>,
    status: watch::Sender<ConnectionStatus>,
) {
    let mut attempt: u32 = 0;
    loop {
        status.send_replace(if attempt == 0 {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Reconnecting { attempt }
        });

        match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                attempt = 0;
                status.send_replace(ConnectionStatus::Connected);
                info!(url = %config.url, "relay: connected");

                match session(socket, &config, &mut out_rx, &in_tx).await {
                    SessionEnd::Shutdown => {
                        status.send_replace(ConnectionStatus::Disconnected);
                        info!("relay: shut down");
                        return;
                    }
                    SessionEnd::Dropped => warn!(url = %config.url, "relay: connection lost"),
                }
            }
            Err(e) => warn!(url = %config.url, attempt, error = %e, "relay: connect failed"),
        }

        attempt += 1;
        if attempt > config.max_attempts {
            status.send_replace(ConnectionStatus::Disconnected);
            warn!(attempts = config.max_attempts, "relay: giving up; running on ledger confirmations only");
            return;
        }
        status.send_replace(ConnectionStatus::Reconnecting { attempt });
        let delay = backoff_delay(attempt, config.base_delay);
        debug!(attempt, delay_ms = delay.as_millis(), "relay: waiting before reconnect");
        tokio::time::sleep(delay).await;
    }
}

async fn session(
    socket: Socket,
    config: &RelayConfig,
    out_rx: &mut mpsc::Receiver<Message>,
    in_tx: &mpsc::Sender<Message>,
) -> SessionEnd {
    let (mut writer, mut reader) = socket.split();

    if let Some(identity) = &config.identity {
        let hello = Message::Identify(frames::Identify { identity: identity.clone() });
        if !write(&mut writer, &hello).await {
            return SessionEnd::Dropped;
        }
    }

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(message) = outbound else {
                    if writer.send(WsMessage::Close(None)).await.is_err() {
                        debug!("relay: close frame not delivered");
                    }
                    return SessionEnd::Shutdown;
                };
                if !write(&mut writer, &message).await {
                    return SessionEnd::Dropped;
                }
            }
            inbound = reader.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => match frames::decode(&text) {
                        Ok(message) => {
                            if in_tx.send(message).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(e) => warn!(error = %e, "relay: undecodable hub message"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "relay: read failed");
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }
}

async fn write<S>(writer: &mut S, message: &Message) -> bool
where
    S: futures::Sink<WsMessage> + Unpin,
{
    let text = match frames::encode(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(kind = message.kind(), error = %e, "relay: encode failed; dropping message");
            return true;
        }
    };
    writer.send(WsMessage::Text(text.into())).await.is_ok()
}
