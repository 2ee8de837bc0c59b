//! WebSocket connection driver — one reader loop and one writer task
//! per connection.
//!
//! The reader authenticates the first frame, then feeds application
//! frames to the hub. The writer drains the bounded outbound queue,
//! keeps the connection alive with pings, and flushes before closing
//! when the done signal fires.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use pairlink_core::envelope::Envelope;
use pairlink_core::types::{code, is_agent_only, is_forwardable, msg, AuthOkPayload, ErrorPayload, StatusPayload};
use pairlink_core::Role;
use pairlink_services::{Connection, Hub, Session, DAILY_QUOTA_BYTES, MAX_MESSAGE_SIZE};

use crate::handlers::ApiState;

/// Per-frame write deadline.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Read deadline, refreshed by any inbound frame (pongs included).
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Transport-level cap, above the application limit so the hub's size
/// check can answer with an error envelope instead of the socket dying.
const TRANSPORT_MESSAGE_LIMIT: usize = 2 * MAX_MESSAGE_SIZE;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.max_message_size(TRANSPORT_MESSAGE_LIMIT)
        .on_upgrade(move |socket| handle_socket(socket, state.hub.clone()))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();

    // First frame must be auth.
    let raw = match timeout(PONG_WAIT, stream.next()).await {
        Ok(Some(Ok(Message::Text(t)))) => t,
        _ => return,
    };

    let env = match Envelope::decode(&raw) {
        Ok(env) => env,
        Err(_) => {
            send_now(&mut sink, error_frame(code::INVALID_MESSAGE, "Invalid JSON")).await;
            return;
        }
    };
    if env.kind != msg::AUTH {
        send_now(
            &mut sink,
            error_frame(code::UNAUTHORIZED, "First message must be auth"),
        )
        .await;
        return;
    }

    let (conn, outbound_rx) = Connection::new();
    let session = match hub.authenticate(&conn, &env) {
        Ok(session) => session,
        Err(e) => {
            send_now(&mut sink, auth_fail_frame(&e.to_string())).await;
            return;
        }
    };

    let paired = session.is_paired();
    send_now(&mut sink, auth_ok_frame(&hub, &session.token, paired)).await;

    // Tell the peer we came online.
    if paired {
        if let Some(role) = conn.role() {
            if let Some(peer) = session.peer_of(role) {
                if let Some(frame) = status_frame("online") {
                    peer.try_send(frame);
                }
            }
        }
    }

    let writer = tokio::spawn(write_pump(sink, outbound_rx, conn.done.clone()));

    read_pump(&hub, &session, &conn, &mut stream).await;

    hub.disconnect(&session, &conn);
    conn.done.cancel();
    let _ = writer.await;
}

async fn read_pump(
    hub: &Arc<Hub>,
    session: &Arc<Session>,
    conn: &Arc<Connection>,
    stream: &mut SplitStream<WebSocket>,
) {
    loop {
        tokio::select! {
            _ = conn.done.cancelled() => return,
            next = timeout(PONG_WAIT, stream.next()) => {
                let message = match next {
                    Err(_) => {
                        tracing::info!("read deadline expired");
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(e))) => {
                        tracing::info!(error = %e, "ws read error");
                        return;
                    }
                    Ok(Some(Ok(m))) => m,
                };

                match message {
                    Message::Text(raw) => handle_frame(hub, session, conn, raw.as_str()),
                    Message::Pong(_) => conn.touch_ping(),
                    Message::Close(_) => return,
                    _ => {}
                }
            }
        }
    }
}

fn handle_frame(hub: &Arc<Hub>, session: &Arc<Session>, conn: &Arc<Connection>, raw: &str) {
    let env = match Envelope::decode(raw) {
        Ok(env) => env,
        Err(_) => {
            enqueue_error(conn, code::INVALID_MESSAGE, "Invalid JSON message");
            return;
        }
    };

    // Streaming types only flow agent → phone.
    if conn.role() == Some(Role::Phone) && is_agent_only(&env.kind) {
        enqueue_error(conn, code::INVALID_MESSAGE, "Phone cannot send stream messages");
        return;
    }

    match env.kind.as_str() {
        msg::PING => {
            if let Ok(pong) = Envelope::new(msg::PONG, serde_json::Value::Null) {
                if let Ok(frame) = pong.encode() {
                    conn.try_send(frame);
                }
            }
        }
        kind if is_forwardable(kind) => hub.forward(session, conn, raw),
        _ => {} // unknown types are silently ignored
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await; // fires immediately; skip the first

    loop {
        tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(frame) => {
                    if send_deadline(&mut sink, Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if send_deadline(&mut sink, Message::Ping(Default::default())).await.is_err() {
                    return;
                }
            }
            _ = done.cancelled() => {
                // Drain what was accepted, then close.
                while let Ok(frame) = outbound.try_recv() {
                    if send_deadline(&mut sink, Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                return;
            }
        }
    }
}

async fn send_deadline(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
) -> Result<(), ()> {
    match timeout(WRITE_WAIT, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

/// Direct send for the pre-auth phase, before the writer task exists.
async fn send_now(sink: &mut SplitSink<WebSocket, Message>, frame: Option<String>) {
    if let Some(frame) = frame {
        let _ = timeout(WRITE_WAIT, sink.send(Message::Text(frame.into()))).await;
    }
}

fn enqueue_error(conn: &Arc<Connection>, code: &str, message: &str) {
    if let Some(frame) = error_frame(code, message) {
        conn.try_send(frame);
    }
}

fn error_frame(code: &str, message: &str) -> Option<String> {
    let env = Envelope::new(
        msg::CHAT_ERROR,
        ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
            retry_after_ms: 0,
        },
    )
    .ok()?;
    env.encode().ok()
}

fn auth_fail_frame(message: &str) -> Option<String> {
    let env = Envelope::new(
        msg::AUTH_FAIL,
        ErrorPayload {
            code: code::UNAUTHORIZED.to_string(),
            message: message.to_string(),
            retry_after_ms: 0,
        },
    )
    .ok()?;
    env.encode().ok()
}

fn auth_ok_frame(hub: &Arc<Hub>, token: &str, paired: bool) -> Option<String> {
    let env = Envelope::new(
        msg::AUTH_OK,
        AuthOkPayload {
            paired,
            daily_quota_bytes: DAILY_QUOTA_BYTES,
            daily_used_bytes: hub.daily_usage(token).unwrap_or(0),
        },
    )
    .ok()?;
    env.encode().ok()
}

fn status_frame(peer_state: &str) -> Option<String> {
    let env = Envelope::new(
        msg::STATUS,
        StatusPayload {
            peer: peer_state.to_string(),
        },
    )
    .ok()?;
    env.encode().ok()
}
