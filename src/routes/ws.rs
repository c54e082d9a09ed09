//! WebSocket handler: presence relay.
//!
//! DESIGN
//! ======
//! On upgrade, registers a session and enters a `select!` loop:
//! - Incoming client messages → decode + dispatch by message type
//! - Queued outbound items from peers and the liveness task → forward
//!
//! Handler functions validate, stamp and record, then return an `Outcome`.
//! The dispatch layer owns all outbound concerns: reply to the sender or
//! fan out to peers.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register → send `welcome` → broadcast `user_joined`
//! 2. Client sends messages → dispatch → handler returns Outcome
//! 3. Close, socket error or eviction → remove → broadcast `user_left`

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use frames::{CodecError, CursorMoved, Message, PixelPainted, Presence, RegionData, Welcome};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::{presence, stats};
use crate::state::{AppState, Outbound};

const UNKNOWN_OWNER: &str = "unknown";

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. Handlers never send directly.
#[derive(Debug)]
enum Outcome {
    /// Fan out to every session except the sender. No reply.
    BroadcastExcludeSender(Message),
    /// Send to the sender only.
    Reply(Message),
    /// Nothing to send.
    Done,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let (client_tx, mut client_rx) = mpsc::channel::<Outbound>(state.config.session_queue);
    let (session_id, active_sessions) = presence::register(&state, client_tx).await;

    let welcome = Message::Welcome(Welcome {
        session_id: session_id.to_string(),
        active_sessions,
        recent_paints: state.history.read().await.recent(state.config.welcome_replay),
    });
    if send_message(&mut socket, &welcome).await.is_err() {
        presence::remove(&state, session_id).await;
        return;
    }

    let joined = Message::UserJoined(Presence { session_id: session_id.to_string(), timestamp: frames::now_ms() });
    presence::broadcast(&state, &joined, Some(session_id)).await;
    info!(%session_id, active = active_sessions, "ws: session connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                presence::touch(&state, session_id).await;
                match msg {
                    WsMessage::Text(text) => {
                        let replies = process_inbound_text(&state, session_id, &text).await;
                        for reply in replies {
                            let _ = send_message(&mut socket, &reply).await;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            out = client_rx.recv() => {
                // None: the liveness sweep evicted this session.
                let Some(out) = out else { break };
                let sent = match out {
                    Outbound::Message(message) => send_message(&mut socket, &message).await,
                    Outbound::Ping => socket.send(WsMessage::Ping(Bytes::new())).await.map_err(|_| ()),
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    if presence::remove(&state, session_id).await.is_some() {
        presence::announce_departure(&state, session_id).await;
    }
    info!(%session_id, "ws: session disconnected");
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Decode and process one inbound text message and return messages for the
/// sender. Kept apart from the socket so tests can drive dispatch directly.
async fn process_inbound_text(state: &AppState, session_id: Uuid, text: &str) -> Vec<Message> {
    let message = match frames::decode(text) {
        Ok(m) => m,
        Err(CodecError::UnknownType(kind)) => {
            debug!(%session_id, %kind, "ws: ignoring unknown message type");
            return vec![];
        }
        Err(e) => {
            warn!(%session_id, error = %e, "ws: invalid inbound message");
            return vec![Message::error(format!("invalid message: {e}"))];
        }
    };

    let outcome = match message {
        Message::Identify(identify) => {
            info!(%session_id, identity = %identify.identity, "ws: session identified");
            presence::identify(state, session_id, identify.identity).await;
            Outcome::Done
        }
        Message::PixelPainted(paint) => handle_paint(state, session_id, paint).await,
        Message::CursorMoved(cursor) => handle_cursor(state, session_id, cursor).await,
        Message::JoinRegion(region) => {
            let pixels = state.history.read().await.in_region(&region);
            Outcome::Reply(Message::RegionData(RegionData { region, pixels }))
        }
        Message::RequestCanvasData => Outcome::Reply(Message::CanvasData(stats::canvas_data(state).await)),
        other => {
            debug!(%session_id, kind = other.kind(), "ws: ignoring hub-bound message type");
            Outcome::Done
        }
    };

    match outcome {
        Outcome::BroadcastExcludeSender(message) => {
            presence::broadcast(state, &message, Some(session_id)).await;
            vec![]
        }
        Outcome::Reply(message) => vec![message],
        Outcome::Done => vec![],
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Stamp owner and timestamp defaults, record in history, relay to peers.
async fn handle_paint(state: &AppState, session_id: Uuid, mut paint: PixelPainted) -> Outcome {
    if paint.owner.is_empty() {
        paint.owner = presence::identity_of(state, session_id)
            .await
            .unwrap_or_else(|| UNKNOWN_OWNER.to_owned());
    }
    if paint.timestamp == 0 {
        paint.timestamp = frames::now_ms();
    }
    info!(%session_id, x = paint.x, y = paint.y, owner = %paint.owner, "ws: pixel painted");

    state.history.write().await.push(paint.clone());
    Outcome::BroadcastExcludeSender(Message::PixelPainted(paint))
}

/// Cursor pings carry the hub-assigned session id and the hub's clock.
async fn handle_cursor(state: &AppState, session_id: Uuid, mut cursor: CursorMoved) -> Outcome {
    cursor.session_id = session_id.to_string();
    cursor.timestamp = frames::now_ms();
    presence::record_cursor(state, session_id, cursor.clone()).await;
    Outcome::BroadcastExcludeSender(Message::CursorMoved(cursor))
}

// =============================================================================
// SEND
// =============================================================================

async fn send_message(socket: &mut WebSocket, message: &Message) -> Result<(), ()> {
    let json = match frames::encode(message) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, kind = message.kind(), "ws: failed to encode message");
            return Err(());
        }
    };
    match message {
        Message::CursorMoved(_) => {}
        Message::Error(err) => warn!(message = %err.message, "ws: send error"),
        other => debug!(kind = other.kind(), "ws: send message"),
    }
    socket.send(WsMessage::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
