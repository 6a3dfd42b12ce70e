//! WebSocket endpoint: connection lifecycle and frame routing.
//!
//! Frames in: `register:<user_id>`, application-level `ping`, JSON chat
//! frames `{type?, user_id, text}`, and binary audio for the STT
//! provider. Frames out: `registered`, `pong`, typed JSON replies, and
//! synthesized audio pushed as binary.

use crate::{GatewayState, SharedState};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use lily_core::error::QueueError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REGISTER_PREFIX: &str = "register:";

/// An inbound chat frame.
#[derive(Debug, Deserialize)]
pub struct ChatFrame {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub user_id: String,
    pub text: String,
}

/// Parse a JSON chat frame; anything without `user_id`/`text` is invalid.
pub fn parse_chat_frame(payload: &str) -> Option<ChatFrame> {
    serde_json::from_str(payload).ok()
}

/// Build the typed JSON reply for a chat frame.
pub fn reply_frame(kind: &str, user_id: &str, text: &str) -> String {
    json!({"type": kind, "user_id": user_id, "text": text}).to_string()
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let conn_id = Uuid::new_v4();
    let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();
    state.hub.add(conn_id, sender).await;

    let (mut sink, mut stream) = socket.split();

    // Writer task owns the sink; the hub only ever touches the channel
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(%conn_id, error = %e, "Socket read error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                handle_text_frame(&state, conn_id, text.as_str()).await;
            }
            Message::Binary(data) => {
                // Forward audio verbatim to the STT provider
                if let Err(e) = state.echo.send_audio(data.to_vec()).await {
                    debug!(%conn_id, error = %e, "Audio frame dropped, Echo unavailable");
                }
            }
            Message::Pong(_) => state.hub.touch_pong(conn_id).await,
            Message::Close(_) => break,
            Message::Ping(_) => {} // axum answers protocol pings itself
        }
    }

    state.hub.remove(conn_id).await;
    writer.abort();
    debug!(%conn_id, "Socket closed");
}

async fn handle_text_frame(state: &SharedState, conn_id: Uuid, payload: &str) {
    // Application-level keepalive
    if payload == "ping" {
        let _ = state
            .hub
            .send_to_conn(conn_id, Message::Text("pong".into()))
            .await;
        return;
    }

    if let Some(user_id) = payload.strip_prefix(REGISTER_PREFIX) {
        state.hub.register(conn_id, user_id).await;
        let _ = state
            .hub
            .send_to_conn(conn_id, Message::Text("registered".into()))
            .await;
        return;
    }

    let Some(frame) = parse_chat_frame(payload) else {
        warn!(%conn_id, "Dropping malformed text frame");
        return;
    };
    dispatch_chat(state, frame).await;
}

/// Route a chat frame by its `type` and submit the agent work.
pub async fn dispatch_chat(state: &SharedState, frame: ChatFrame) {
    let kind = frame.kind.as_deref().unwrap_or("message").to_string();
    let user_id = frame.user_id.clone();

    match kind.as_str() {
        "session_start" => state.sessions.start(&user_id).await,
        "session_end" => {} // session ends after the reply is sent
        _ => state.sessions.touch(&user_id).await,
    }

    let reply_kind = match kind.as_str() {
        "session_start" => "session_start",
        "session_end" => "session_end",
        _ => "response",
    }
    .to_string();

    let job_state = Arc::clone(state);
    let text = frame.text;
    let job = async move {
        let reply = job_state.agent.run(&text, &user_id).await;
        let frame = reply_frame(&reply_kind, &user_id, &reply);
        if let Err(e) = job_state
            .hub
            .send_to_user(&user_id, Message::Text(frame.into()))
            .await
        {
            info!(user_id = %user_id, error = %e, "Reply dropped, client gone");
        }
        if reply_kind == "session_end" {
            job_state.sessions.end(&user_id).await;
        }
    };

    if let Err(e) = state.pool.submit(job) {
        let reason = match e {
            QueueError::QueueFull => "Server busy, please retry shortly",
            QueueError::ShutDown => "Server shutting down",
        };
        warn!(user_id = %frame.user_id, error = %e, "Chat frame rejected");
        let _ = state
            .hub
            .send_to_user(
                &frame.user_id,
                Message::Text(reply_frame("error", &frame.user_id, reason).into()),
            )
            .await;
    }
}

/// Consume Echo transcriptions: rebroadcast each frame, and treat final
/// ones as chat input from the transcribed client (or the configured
/// default user).
pub fn spawn_transcription_consumer(
    state: SharedState,
    mut transcriptions: mpsc::Receiver<lily_speech::Transcription>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(transcription) = transcriptions.recv().await {
            let payload = match serde_json::to_string(&transcription) {
                Ok(json) => format!("transcription:{json}"),
                Err(_) => continue,
            };
            state.hub.broadcast_text(&payload).await;

            if transcription.is_final() && !transcription.text.trim().is_empty() {
                let user_id = transcription
                    .client_id
                    .clone()
                    .unwrap_or_else(|| state.config.stt_default_user());
                info!(user_id = %user_id, "Final transcription routed to agent");
                dispatch_chat(
                    &state,
                    ChatFrame {
                        kind: None,
                        user_id,
                        text: transcription.text.clone(),
                    },
                )
                .await;
            }
        }
    })
}

/// Periodic liveness sweep driving [`crate::hub::ConnectionHub::sweep`].
pub fn spawn_ping_sweep(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(state.config.ping_interval_secs().max(1));
        let timeout = std::time::Duration::from_secs(state.config.pong_timeout_secs().max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let closed = state.hub.sweep(timeout).await;
            if !closed.is_empty() {
                info!(count = closed.len(), "Ping sweep closed stale connections");
            }
        }
    })
}

/// Forward session-expiry events to every connected client.
pub fn spawn_session_event_forwarder(state: SharedState) -> tokio::task::JoinHandle<()> {
    use tokio::sync::broadcast::error::RecvError;

    let mut events = state.event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if let lily_core::event::DomainEvent::SessionExpired { user_id, timestamp } =
                event.as_ref()
            {
                let frame = json!({
                    "type": "session_expired",
                    "user_id": user_id,
                    "timestamp": timestamp.to_rfc3339(),
                })
                .to_string();
                state.hub.broadcast_text(&frame).await;
            }
        }
    })
}

/// Keep trying to reach the Echo provider and wire its transcript
/// stream into the gateway.
pub fn spawn_echo_connector(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let retry = std::time::Duration::from_secs(15);
        loop {
            if !state.echo.is_connected() {
                if let Some(url) = GatewayState::resolve_echo_url(&state).await {
                    match state.echo.connect(&url).await {
                        Ok(rx) => {
                            info!(url = %url, "Echo connected");
                            spawn_transcription_consumer(Arc::clone(&state), rx);
                        }
                        Err(e) => debug!(url = %url, error = %e, "Echo connect failed"),
                    }
                }
            }
            tokio::time::sleep(retry).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_frame_parses_with_and_without_type() {
        let frame =
            parse_chat_frame(r#"{"type":"session_start","user_id":"u1","text":"hi"}"#).unwrap();
        assert_eq!(frame.kind.as_deref(), Some("session_start"));
        assert_eq!(frame.user_id, "u1");

        let frame = parse_chat_frame(r#"{"user_id":"u2","text":"yo"}"#).unwrap();
        assert!(frame.kind.is_none());
        assert_eq!(frame.text, "yo");
    }

    #[test]
    fn chat_frame_rejects_missing_fields() {
        assert!(parse_chat_frame(r#"{"user_id":"u1"}"#).is_none());
        assert!(parse_chat_frame(r#"{"text":"hi"}"#).is_none());
        assert!(parse_chat_frame("not json").is_none());
    }

    #[test]
    fn reply_frame_shape() {
        let frame = reply_frame("response", "u1", "yo");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["text"], "yo");
    }
}
