//! Session records — liveness of a user's recent interaction, separate
//! from any WebSocket connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity record for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub active: bool,
}

impl SessionInfo {
    /// A fresh, active session starting now.
    pub fn start(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            start_time: now,
            last_activity: now,
            active: true,
        }
    }
}
