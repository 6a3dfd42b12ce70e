//! In-process conversation memory.
//!
//! One ordered message log per user id, created lazily on first append.
//! Conversations do not survive the process; callers are expected to
//! bound context size themselves.

use lily_core::message::{Message, Role};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Per-user append-only conversation store.
///
/// All operations are atomic under one async RwLock; appends to a single
/// conversation preserve the real-time order of the calls.
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// The ordered message log for a user; empty if none exists.
    pub async fn get(&self, user_id: &str) -> Vec<Message> {
        self.conversations
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Stamp `now` and push a message, creating the conversation lazily.
    pub async fn append(&self, user_id: &str, role: Role, content: impl Into<String>) -> Message {
        let message = Message::new(role, content);
        let mut guard = self.conversations.write().await;
        guard
            .entry(user_id.to_string())
            .or_default()
            .push(message.clone());
        debug!(user_id = %user_id, role = %role, "Message appended");
        message
    }

    /// Remove the user's conversation entirely. Idempotent.
    pub async fn clear(&self, user_id: &str) {
        self.conversations.write().await.remove(user_id);
    }

    /// Number of messages stored for a user.
    pub async fn len(&self, user_id: &str) -> usize {
        self.conversations
            .read()
            .await
            .get(user_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
