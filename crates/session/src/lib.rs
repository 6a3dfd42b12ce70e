//! Session tracking with idle expiry.
//!
//! Sessions record user activity independently of WebSocket connections.
//! A background sweep marks sessions inactive once they cross the idle
//! threshold and publishes a `SessionExpired` event; the gateway turns
//! that into a broadcast frame.

use chrono::{DateTime, Duration, Utc};
use lily_core::event::{DomainEvent, EventBus};
use lily_core::session::SessionInfo;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// How often the expiry sweep runs.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// Tracks per-user sessions and expires idle ones.
pub struct SessionTracker {
    sessions: RwLock<HashMap<String, SessionInfo>>,
    timeout: Duration,
    event_bus: Arc<EventBus>,
}

impl SessionTracker {
    pub fn new(timeout_minutes: i64, event_bus: Arc<EventBus>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout: Duration::minutes(timeout_minutes),
            event_bus,
        }
    }

    /// Start (or restart) a session for the user.
    pub async fn start(&self, user_id: &str) {
        let session = SessionInfo::start(user_id);
        self.sessions
            .write()
            .await
            .insert(user_id.to_string(), session);
        info!(user_id = %user_id, "Session started");
        self.event_bus.publish(DomainEvent::SessionStarted {
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Mark the session inactive. No-op for unknown users; idempotent.
    pub async fn end(&self, user_id: &str) {
        let mut ended = false;
        {
            let mut guard = self.sessions.write().await;
            if let Some(session) = guard.get_mut(user_id) {
                if session.active {
                    session.active = false;
                    ended = true;
                }
            }
        }
        if ended {
            info!(user_id = %user_id, "Session ended");
            self.event_bus.publish(DomainEvent::SessionEnded {
                user_id: user_id.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Refresh the activity timestamp of an active session.
    ///
    /// Touching an inactive or absent session is a no-op — it must not
    /// re-activate.
    pub async fn touch(&self, user_id: &str) {
        let mut guard = self.sessions.write().await;
        if let Some(session) = guard.get_mut(user_id) {
            if session.active {
                session.last_activity = Utc::now();
            }
        }
    }

    pub async fn is_active(&self, user_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(user_id)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Snapshot of all known sessions, active and not.
    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Snapshot of currently active sessions.
    pub async fn list_active(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    /// Expire every active session idle since before `now - timeout`.
    ///
    /// Returns the expired user ids. Events are published outside the
    /// lock.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        {
            let mut guard = self.sessions.write().await;
            for (user_id, session) in guard.iter_mut() {
                if session.active && now - session.last_activity >= self.timeout {
                    session.active = false;
                    expired.push(user_id.clone());
                }
            }
        }
        for user_id in &expired {
            info!(user_id = %user_id, "Session expired");
            self.event_bus.publish(DomainEvent::SessionExpired {
                user_id: user_id.clone(),
                timestamp: now,
            });
        }
        expired
    }

    /// Spawn the periodic sweep task. Aborts with the returned handle.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = self;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so a fresh start
            // doesn't sweep before anyone has a chance to touch
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracker.sweep(Utc::now()).await;
            }
        })
    }
}
