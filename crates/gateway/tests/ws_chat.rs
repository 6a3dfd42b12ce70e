//! WebSocket end-to-end: registration, keepalive, and chat replies
//! against a live gateway bound to an ephemeral port.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use lily_agent::AgentEngine;
use lily_config::{ConfigData, ConfigStore};
use lily_core::event::EventBus;
use lily_core::model::LanguageModel;
use lily_core::tool::ToolRouter;
use lily_gateway::{build_router, ConnectionHub, GatewayState};
use lily_memory::ConversationStore;
use lily_registry::ServiceRegistry;
use lily_session::SessionTracker;
use lily_speech::{EchoClient, TtsClient};
use lily_workers::WorkerPool;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Model that always replies with the same text.
struct CannedModel(String);

#[async_trait]
impl LanguageModel for CannedModel {
    fn name(&self) -> &str {
        "canned"
    }
    async fn generate(&self, _prompt: &str, _tools: &[Value]) -> Value {
        json!({"candidates": [{"content": {"parts": [{"text": self.0.clone()}]}}]})
    }
}

struct NoTools;

#[async_trait]
impl ToolRouter for NoTools {
    async fn catalog(&self) -> Vec<Value> {
        vec![]
    }
    async fn execute(&self, _tool_name: &str, _params: Value) -> Value {
        json!({"status": "error", "message": "no servers"})
    }
}

fn gateway_state(reply: &str) -> Arc<GatewayState> {
    let config = Arc::new(ConfigStore::new(
        ConfigData {
            gemini_api_keys: vec!["test-key-0000".into()],
            ..ConfigData::default()
        },
        "/tmp/lily-ws-test-unused.json",
    ));
    let event_bus = Arc::new(EventBus::default());
    let memory = Arc::new(ConversationStore::new());
    let sessions = Arc::new(SessionTracker::new(30, Arc::clone(&event_bus)));
    let registry = Arc::new(ServiceRegistry::new("localhost", 8500, "lily-core"));
    let agent = Arc::new(AgentEngine::new(
        Arc::new(CannedModel(reply.to_string())),
        Arc::new(NoTools),
        Arc::clone(&memory),
        Arc::clone(&config),
        Arc::clone(&event_bus),
    ));
    Arc::new(GatewayState {
        config,
        memory,
        sessions,
        registry,
        agent,
        pool: Arc::new(WorkerPool::new(2, 16)),
        hub: Arc::new(ConnectionHub::new()),
        tts: Arc::new(TtsClient::new()),
        echo: Arc::new(EchoClient::new()),
        event_bus,
        start_time: Utc::now(),
    })
}

async fn serve(state: Arc<GatewayState>) -> String {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn next_text(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> String {
    loop {
        let frame = ws.next().await.expect("socket open").expect("read ok");
        match frame {
            Message::Text(text) => return text.to_string(),
            // The server may interleave protocol pings
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn register_ping_and_chat_roundtrip() {
    let state = gateway_state("FINAL_RESPONSE: yo");
    let url = serve(Arc::clone(&state)).await;

    let (mut ws, _) = connect_async(&url).await.unwrap();

    ws.send(Message::Text("register:u2".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "registered");
    assert!(state.hub.is_registered("u2").await);

    // Application-level keepalive
    ws.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");

    ws.send(Message::Text(
        json!({"type": "message", "user_id": "u2", "text": "hi"})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["user_id"], "u2");
    assert_eq!(reply["text"], "yo");

    // Both turns landed in memory
    let conversation = state.memory.get("u2").await;
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[0].content, "hi");
    assert_eq!(conversation[1].content, "yo");
}

#[tokio::test]
async fn session_start_frame_activates_session() {
    let state = gateway_state("FINAL_RESPONSE: welcome");
    let url = serve(Arc::clone(&state)).await;

    let (mut ws, _) = connect_async(&url).await.unwrap();
    ws.send(Message::Text("register:u5".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "registered");

    ws.send(Message::Text(
        json!({"type": "session_start", "user_id": "u5", "text": "hello"})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["type"], "session_start");
    assert_eq!(reply["text"], "welcome");
    assert!(state.sessions.is_active("u5").await);
}

#[tokio::test]
async fn session_end_frame_replies_then_deactivates() {
    let state = gateway_state("FINAL_RESPONSE: bye");
    let url = serve(Arc::clone(&state)).await;
    state.sessions.start("u6").await;

    let (mut ws, _) = connect_async(&url).await.unwrap();
    ws.send(Message::Text("register:u6".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "registered");

    ws.send(Message::Text(
        json!({"type": "session_end", "user_id": "u6", "text": "goodbye"})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["type"], "session_end");
    assert_eq!(reply["text"], "bye");

    // The session ends after the reply is delivered
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while state.sessions.is_active("u6").await {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session should end after the reply");
}

#[tokio::test]
async fn malformed_chat_frame_is_dropped() {
    let state = gateway_state("FINAL_RESPONSE: unused");
    let url = serve(Arc::clone(&state)).await;

    let (mut ws, _) = connect_async(&url).await.unwrap();
    ws.send(Message::Text("register:u7".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "registered");

    ws.send(Message::Text("{\"garbage\": true}".into()))
        .await
        .unwrap();
    // The frame is dropped silently; the connection stays usable
    ws.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");
}
