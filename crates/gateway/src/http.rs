//! REST handlers, mounted both bare and under `/api`.

use crate::{GatewayState, SharedState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{SecondsFormat, Utc};
use lily_core::error::QueueError;
use lily_speech::TtsRequest;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({"status": "UP"}))
}

/// GET /config — masked view of the LLM configuration.
pub async fn get_config(State(state): State<SharedState>) -> Json<Value> {
    let keys = state.config.gemini_api_keys();
    Json(json!({
        "gemini_api_keys": state.config.masked_keys(),
        "gemini_api_key_count": keys.len(),
        "gemini_model": state.config.gemini_model(),
        "gemini_system_prompt": state.config.gemini_system_prompt(),
    }))
}

/// POST /config — partial update of the LLM fields, persisted on change.
pub async fn update_config(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Response {
    let keys = body.get("gemini_api_keys").and_then(|k| k.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|k| k.as_str())
            .map(str::to_string)
            .collect::<Vec<_>>()
    });
    let model = body
        .get("gemini_model")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    let prompt = body
        .get("gemini_system_prompt")
        .and_then(|p| p.as_str())
        .map(str::to_string);

    match state.config.update_llm(keys, model, prompt) {
        Ok(true) => {
            info!("LLM configuration updated");
            Json(json!({"message": "Configuration updated"})).into_response()
        }
        Ok(false) => Json(json!({"message": "No changes"})).into_response(),
        Err(e) => {
            warn!(error = %e, "Config persist failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// GET /monitoring — service-health snapshot.
pub async fn monitoring(State(state): State<SharedState>) -> Json<Value> {
    let services: Vec<Value> = state
        .registry
        .services()
        .await
        .into_iter()
        .map(|s| json!({"name": s.name, "http_url": s.http_url, "mcp": s.mcp}))
        .collect();
    let uptime = (Utc::now() - state.start_time).num_seconds();
    Json(json!({
        "status": "UP",
        "service_name": state.config.service_name(),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": now_iso(),
        "uptime_seconds": uptime,
        "services": services,
        "tool_count": state.registry.tool_count().await,
        "connected_users": state.hub.connected_users().await.len(),
        "active_sessions": state.sessions.list_active().await.len(),
    }))
}

/// GET /tools — per-server tool lists.
pub async fn tools(State(state): State<SharedState>) -> Json<Value> {
    let servers: Vec<Value> = state
        .registry
        .tools_per_server()
        .await
        .into_iter()
        .map(|(server_url, tools)| json!({"server_url": server_url, "tools": tools}))
        .collect();
    Json(json!({"servers": servers}))
}

/// GET /active-sessions
pub async fn active_sessions(State(state): State<SharedState>) -> Json<Value> {
    let sessions = state.sessions.list_active().await;
    Json(json!({"count": sessions.len(), "sessions": sessions}))
}

/// GET /connected-users
pub async fn connected_users(State(state): State<SharedState>) -> Json<Value> {
    let user_ids = state.hub.connected_users().await;
    Json(json!({
        "user_ids": user_ids,
        "count": user_ids.len(),
        "timestamp": now_iso(),
    }))
}

/// POST /chat — deferred reply: the response body is written only when
/// the agent job completes on the worker pool.
pub async fn chat(State(state): State<SharedState>, Json(body): Json<Value>) -> Response {
    let (Some(message), Some(user_id)) = (
        body.get("message").and_then(|m| m.as_str()).map(str::to_string),
        body.get("user_id").and_then(|u| u.as_str()).map(str::to_string),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing 'message' or 'user_id'"})),
        )
            .into_response();
    };

    let tts = parse_tts_options(&body);
    state.sessions.touch(&user_id).await;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<String>();
    let job_state = Arc::clone(&state);
    let job_user = user_id.clone();
    let job = async move {
        let reply = job_state.agent.run(&message, &job_user).await;
        let _ = done_tx.send(reply.clone());
        if let Some(tts_request) = tts {
            synthesize_and_push(&job_state, &job_user, &reply, tts_request).await;
        }
    };

    if let Err(e) = state.pool.submit(job) {
        let status = match e {
            QueueError::QueueFull | QueueError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        return (status, Json(json!({"error": "Server busy, please retry shortly"})))
            .into_response();
    }

    match done_rx.await {
        Ok(reply) => Json(json!({"response": reply, "timestamp": now_iso()})).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Agent job was dropped"})),
        )
            .into_response(),
    }
}

/// Pull the TTS options out of a chat body, if enabled.
fn parse_tts_options(body: &Value) -> Option<TtsRequest> {
    let tts = body.get("tts")?;
    if !tts.get("enabled").and_then(|e| e.as_bool()).unwrap_or(false) {
        return None;
    }
    let params = tts.get("params").cloned().unwrap_or_else(|| json!({}));
    let mut request = TtsRequest::new("");
    if let Some(speaker) = params.get("speaker").and_then(|s| s.as_i64()) {
        request.speaker = speaker as i32;
    }
    if let Some(rate) = params.get("sample_rate").and_then(|r| r.as_u64()) {
        request.sample_rate = rate as u32;
    }
    if let Some(model) = params.get("model").and_then(|m| m.as_str()) {
        request.model = model.to_string();
    }
    if let Some(lang) = params.get("lang").and_then(|l| l.as_str()) {
        request.lang = lang.to_string();
    }
    Some(request)
}

/// Synthesize the reply and push the audio to the user's WebSocket.
/// TTS failure degrades to text-only; it never fails the chat.
async fn synthesize_and_push(
    state: &SharedState,
    user_id: &str,
    reply: &str,
    mut request: TtsRequest,
) {
    let Some(url) = GatewayState::resolve_tts_url(state).await else {
        warn!("TTS requested but no provider URL is known");
        return;
    };
    request.text = reply.to_string();
    match state.tts.synthesize(&url, &request).await {
        Ok(audio) if !audio.is_empty() => {
            if let Err(e) = state
                .hub
                .send_to_user(user_id, axum::extract::ws::Message::Binary(audio.into()))
                .await
            {
                info!(user_id = %user_id, error = %e, "Audio dropped, client not connected");
            }
        }
        Ok(_) => info!(user_id = %user_id, "TTS produced no audio"),
        Err(e) => warn!(user_id = %user_id, error = %e, "TTS failed, text-only reply"),
    }
}

/// GET /conversation/{user_id}
pub async fn get_conversation(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    let conversation: Vec<Value> = state
        .memory
        .get(&user_id)
        .await
        .into_iter()
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "content": m.content,
                "timestamp": m.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            })
        })
        .collect();
    Json(json!({"user_id": user_id, "conversation": conversation}))
}

/// DELETE /conversation/{user_id}
pub async fn delete_conversation(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    state.memory.clear(&user_id).await;
    info!(user_id = %user_id, "Conversation cleared");
    Json(json!({"message": "Conversation cleared", "user_id": user_id}))
}

/// GET /agent-loops — the most recently completed loop.
pub async fn agent_loops(State(state): State<SharedState>) -> Json<Value> {
    match state.agent.last_loop().await {
        Some(record) => {
            let mut body = serde_json::to_value(&record).unwrap_or_else(|_| json!({}));
            if let Some(map) = body.as_object_mut() {
                map.insert("exists".into(), json!(true));
            }
            Json(body)
        }
        None => Json(json!({"exists": false, "message": "No agent loops available"})),
    }
}

/// GET /agent-loops/users — user ids with retained loops.
pub async fn agent_loop_users(State(state): State<SharedState>) -> Json<Value> {
    let user_ids = state.agent.users_with_loops().await;
    Json(json!({"user_ids": user_ids, "count": user_ids.len()}))
}

/// GET /agent-loops/{user_id} — the retained ring buffer for one user.
pub async fn agent_loops_for_user(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    let loops = state.agent.loops_for_user(&user_id).await;
    Json(json!({"user_id": user_id, "loops": loops}))
}

/// DELETE /agent-loops/{user_id}
pub async fn clear_agent_loops(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    state.agent.clear_loops(&user_id).await;
    Json(json!({"message": format!("Agent loops cleared for user {user_id}")}))
}
