//! Configuration store for Lily.
//!
//! A single mutable record guarded by one lock. Values come from three
//! layers, lowest precedence first: compiled defaults, environment
//! variables (read once at startup), and the JSON config file (loaded
//! after the environment, so a saved file wins for the persisted LLM
//! fields). Only the LLM-related fields are persisted; everything else
//! is deployment wiring.

use lily_core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Default idle threshold before a session expires.
const DEFAULT_SESSION_TIMEOUT_MINUTES: i64 = 30;

/// The mutable configuration record.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConfigData {
    // Server
    pub http_address: String,
    pub http_port: u16,

    // Coordination store
    pub consul_host: String,
    pub consul_port: u16,
    pub service_name: String,

    // LLM (persisted)
    pub gemini_api_keys: Vec<String>,
    pub gemini_model: String,
    pub gemini_system_prompt: String,

    // WebSocket liveness
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,

    // Worker pool
    pub max_queue_size: usize,
    pub max_concurrent_tasks: usize,

    // Speech fallbacks when discovery yields nothing
    pub echo_ws_url: String,
    pub tts_ws_url: String,

    // Sessions
    pub session_timeout_minutes: i64,

    /// User id attributed to STT transcriptions without a client id
    pub stt_default_user: String,

    /// Public hostname advertised in the registration tags
    pub domain_name: String,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0".into(),
            http_port: 8000,
            consul_host: "localhost".into(),
            consul_port: 8500,
            service_name: "lily-core".into(),
            gemini_api_keys: Vec::new(),
            gemini_model: "gemini-2.5-flash".into(),
            gemini_system_prompt: "You are Lily, a helpful and friendly AI assistant.".into(),
            ping_interval_secs: 30,
            pong_timeout_secs: 60,
            max_queue_size: 1000,
            max_concurrent_tasks: 10,
            echo_ws_url: String::new(),
            tts_ws_url: String::new(),
            session_timeout_minutes: DEFAULT_SESSION_TIMEOUT_MINUTES,
            stt_default_user: "default_user".into(),
            domain_name: String::new(),
        }
    }
}

/// The subset of config that survives restarts.
#[derive(Serialize, Deserialize)]
struct PersistedLlmConfig {
    #[serde(default)]
    gemini_api_keys: Vec<String>,
    #[serde(default)]
    gemini_model: String,
    #[serde(default)]
    gemini_system_prompt: String,
}

struct Inner {
    data: ConfigData,
    /// Rotation cursor for `next_key`; advances under the same lock as the read
    key_cursor: usize,
}

/// Thread-safe configuration store.
///
/// All reads and writes go through one lock; the key-rotation cursor is
/// updated atomically with the key read.
pub struct ConfigStore {
    inner: Mutex<Inner>,
    file_path: PathBuf,
}

impl ConfigStore {
    pub fn new(data: ConfigData, file_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner { data, key_cursor: 0 }),
            file_path: file_path.into(),
        }
    }

    /// Build a store from defaults, environment, then the config file.
    pub fn bootstrap(file_path: impl Into<PathBuf>) -> Self {
        let mut data = ConfigData::default();
        load_env(&mut data);
        let store = Self::new(data, file_path);
        if let Err(e) = store.load_file() {
            warn!(error = %e, "Config file not loaded; continuing with env/defaults");
        }
        store
    }

    /// A snapshot of the full config.
    pub fn snapshot(&self) -> ConfigData {
        self.inner.lock().unwrap().data.clone()
    }

    pub fn http_address(&self) -> String {
        self.inner.lock().unwrap().data.http_address.clone()
    }

    pub fn http_port(&self) -> u16 {
        self.inner.lock().unwrap().data.http_port
    }

    pub fn service_name(&self) -> String {
        self.inner.lock().unwrap().data.service_name.clone()
    }

    pub fn consul_addr(&self) -> (String, u16) {
        let g = self.inner.lock().unwrap();
        (g.data.consul_host.clone(), g.data.consul_port)
    }

    pub fn gemini_model(&self) -> String {
        self.inner.lock().unwrap().data.gemini_model.clone()
    }

    pub fn gemini_system_prompt(&self) -> String {
        self.inner.lock().unwrap().data.gemini_system_prompt.clone()
    }

    pub fn gemini_api_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().data.gemini_api_keys.clone()
    }

    pub fn ping_interval_secs(&self) -> u64 {
        self.inner.lock().unwrap().data.ping_interval_secs
    }

    pub fn pong_timeout_secs(&self) -> u64 {
        self.inner.lock().unwrap().data.pong_timeout_secs
    }

    pub fn max_queue_size(&self) -> usize {
        self.inner.lock().unwrap().data.max_queue_size
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.inner.lock().unwrap().data.max_concurrent_tasks
    }

    pub fn echo_ws_url(&self) -> String {
        self.inner.lock().unwrap().data.echo_ws_url.clone()
    }

    pub fn tts_ws_url(&self) -> String {
        self.inner.lock().unwrap().data.tts_ws_url.clone()
    }

    pub fn session_timeout_minutes(&self) -> i64 {
        self.inner.lock().unwrap().data.session_timeout_minutes
    }

    pub fn stt_default_user(&self) -> String {
        self.inner.lock().unwrap().data.stt_default_user.clone()
    }

    pub fn domain_name(&self) -> String {
        self.inner.lock().unwrap().data.domain_name.clone()
    }

    /// The current key, advancing the cursor modulo the key count.
    /// Empty string when no keys are configured.
    pub fn next_key(&self) -> String {
        let mut g = self.inner.lock().unwrap();
        if g.data.gemini_api_keys.is_empty() {
            return String::new();
        }
        let idx = g.key_cursor % g.data.gemini_api_keys.len();
        g.key_cursor = (idx + 1) % g.data.gemini_api_keys.len();
        g.data.gemini_api_keys[idx].clone()
    }

    /// Partially update the LLM fields and persist when anything changed.
    ///
    /// Returns whether a change was applied.
    pub fn update_llm(
        &self,
        keys: Option<Vec<String>>,
        model: Option<String>,
        system_prompt: Option<String>,
    ) -> Result<bool, ConfigError> {
        let mut updated = false;
        {
            let mut g = self.inner.lock().unwrap();
            if let Some(keys) = keys {
                if !keys.is_empty() {
                    g.data.gemini_api_keys = keys;
                    g.key_cursor = 0;
                    updated = true;
                }
            }
            if let Some(model) = model {
                g.data.gemini_model = model;
                updated = true;
            }
            if let Some(prompt) = system_prompt {
                g.data.gemini_system_prompt = prompt;
                updated = true;
            }
        }
        if updated {
            self.save_file()?;
        }
        Ok(updated)
    }

    /// API keys masked for display: `"..." + last4`, or `"****"` for
    /// keys too short to mask meaningfully.
    pub fn masked_keys(&self) -> Vec<String> {
        self.gemini_api_keys()
            .iter()
            .map(|k| {
                if k.len() > 4 {
                    format!("...{}", &k[k.len() - 4..])
                } else {
                    "****".to_string()
                }
            })
            .collect()
    }

    /// Load the persisted LLM fields from the JSON config file.
    pub fn load_file(&self) -> Result<(), ConfigError> {
        let path = &self.file_path;
        if !path.exists() {
            info!(path = %path.display(), "No config file found, using env/defaults");
            return Ok(());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let persisted: PersistedLlmConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut g = self.inner.lock().unwrap();
        if !persisted.gemini_api_keys.is_empty() {
            g.data.gemini_api_keys = persisted.gemini_api_keys;
            g.key_cursor = 0;
        }
        if !persisted.gemini_model.is_empty() {
            g.data.gemini_model = persisted.gemini_model;
        }
        if !persisted.gemini_system_prompt.is_empty() {
            g.data.gemini_system_prompt = persisted.gemini_system_prompt;
        }
        Ok(())
    }

    /// Write the persisted LLM fields to the JSON config file.
    pub fn save_file(&self) -> Result<(), ConfigError> {
        let persisted = {
            let g = self.inner.lock().unwrap();
            PersistedLlmConfig {
                gemini_api_keys: g.data.gemini_api_keys.clone(),
                gemini_model: g.data.gemini_model.clone(),
                gemini_system_prompt: g.data.gemini_system_prompt.clone(),
            }
        };
        let json = serde_json::to_string_pretty(&persisted).map_err(|e| ConfigError::WriteError {
            path: self.file_path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                    path: self.file_path.display().to_string(),
                    reason: e.to_string(),
                })?;
            }
        }
        std::fs::write(&self.file_path, json).map_err(|e| ConfigError::WriteError {
            path: self.file_path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!(path = %self.file_path.display(), "Configuration saved");
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

/// Redact keys in Debug output.
impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.inner.lock().unwrap();
        f.debug_struct("ConfigStore")
            .field("http_address", &g.data.http_address)
            .field("http_port", &g.data.http_port)
            .field("service_name", &g.data.service_name)
            .field("gemini_api_keys", &format!("[{} redacted]", g.data.gemini_api_keys.len()))
            .field("gemini_model", &g.data.gemini_model)
            .finish_non_exhaustive()
    }
}

/// Apply recognized environment variables on top of `data`.
pub fn load_env(data: &mut ConfigData) {
    if let Ok(v) = std::env::var("LILY_HTTP_ADDRESS") {
        data.http_address = v;
    }
    if let Ok(v) = std::env::var("LILY_HTTP_PORT") {
        if let Ok(port) = v.parse() {
            data.http_port = port;
        }
    }
    // Legacy split-port deployments; the unified gateway binds one port
    if let Ok(v) = std::env::var("LILY_WEBSOCKET_PORT") {
        if data.http_port == ConfigData::default().http_port {
            if let Ok(port) = v.parse() {
                data.http_port = port;
            }
        }
    }
    if let Ok(v) = std::env::var("CONSUL_HOST") {
        data.consul_host = v;
    }
    if let Ok(v) = std::env::var("CONSUL_PORT") {
        if let Ok(port) = v.parse() {
            data.consul_port = port;
        }
    }
    if let Ok(v) = std::env::var("CONSUL_HTTP_ADDR") {
        // host:port form, scheme optional
        let trimmed = v
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        if let Some((host, port)) = trimmed.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                data.consul_host = host.to_string();
                data.consul_port = port;
            }
        } else {
            data.consul_host = trimmed.to_string();
        }
    }
    if let Ok(v) = std::env::var("LILY_SERVICE_NAME") {
        data.service_name = v;
    }
    if let Ok(v) = std::env::var("GEMINI_API_KEYS") {
        let keys: Vec<String> = v
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if !keys.is_empty() {
            data.gemini_api_keys = keys;
        }
    }
    if let Ok(v) = std::env::var("ECHO_WS_URL") {
        data.echo_ws_url = v;
    }
    if let Ok(v) = std::env::var("TTS_PROVIDER_URL") {
        data.tts_ws_url = v;
    }
    if let Ok(v) = std::env::var("DOMAIN_NAME") {
        data.domain_name = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_keys(keys: &[&str]) -> ConfigStore {
        let data = ConfigData {
            gemini_api_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..ConfigData::default()
        };
        ConfigStore::new(data, "/tmp/lily-test-config-unused.json")
    }

    #[test]
    fn defaults_are_sane() {
        let data = ConfigData::default();
        assert_eq!(data.http_port, 8000);
        assert_eq!(data.consul_port, 8500);
        assert_eq!(data.service_name, "lily-core");
        assert_eq!(data.session_timeout_minutes, 30);
        assert_eq!(data.stt_default_user, "default_user");
    }

    #[test]
    fn next_key_rotates_fairly() {
        let store = store_with_keys(&["a", "b", "c"]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..9 {
            *counts.entry(store.next_key()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 3);
        assert_eq!(counts["b"], 3);
        assert_eq!(counts["c"], 3);
    }

    #[test]
    fn next_key_preserves_rotation_order() {
        let store = store_with_keys(&["k1", "k2"]);
        assert_eq!(store.next_key(), "k1");
        assert_eq!(store.next_key(), "k2");
        assert_eq!(store.next_key(), "k1");
    }

    #[test]
    fn next_key_empty_returns_empty_string() {
        let store = store_with_keys(&[]);
        assert_eq!(store.next_key(), "");
        assert_eq!(store.next_key(), "");
    }

    #[test]
    fn masked_keys_show_last_four() {
        let store = store_with_keys(&["AIzaSyExample1234", "ab"]);
        let masked = store.masked_keys();
        assert_eq!(masked[0], "...1234");
        assert_eq!(masked[1], "****");
    }

    #[test]
    fn update_llm_reports_changes() {
        let path = std::env::temp_dir().join("lily-config-update-test.json");
        let _ = std::fs::remove_file(&path);
        let store = ConfigStore::new(ConfigData::default(), &path);

        let updated = store
            .update_llm(None, Some("gemini-2.5-pro".into()), None)
            .unwrap();
        assert!(updated);
        assert_eq!(store.gemini_model(), "gemini-2.5-pro");
        assert!(path.exists());

        let updated = store.update_llm(None, None, None).unwrap();
        assert!(!updated);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn update_llm_ignores_empty_key_list() {
        let path = std::env::temp_dir().join("lily-config-emptykeys-test.json");
        let _ = std::fs::remove_file(&path);
        let store = store_with_keys(&["keep-me-1234"]);
        let store = ConfigStore::new(store.snapshot(), &path);

        let updated = store.update_llm(Some(vec![]), None, None).unwrap();
        assert!(!updated);
        assert_eq!(store.gemini_api_keys(), vec!["keep-me-1234".to_string()]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let path = std::env::temp_dir().join("lily-config-roundtrip-test.json");
        let _ = std::fs::remove_file(&path);

        let data = ConfigData {
            gemini_api_keys: vec!["key-one-9999".into()],
            gemini_model: "gemini-2.5-pro".into(),
            gemini_system_prompt: "Be brief.".into(),
            ..ConfigData::default()
        };
        let store = ConfigStore::new(data, &path);
        store.save_file().unwrap();

        let fresh = ConfigStore::new(ConfigData::default(), &path);
        fresh.load_file().unwrap();
        assert_eq!(fresh.gemini_api_keys(), vec!["key-one-9999".to_string()]);
        assert_eq!(fresh.gemini_model(), "gemini-2.5-pro");
        assert_eq!(fresh.gemini_system_prompt(), "Be brief.");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_file_missing_is_ok() {
        let store = ConfigStore::new(ConfigData::default(), "/nonexistent/lily/config.json");
        assert!(store.load_file().is_ok());
    }

    #[test]
    fn debug_redacts_keys() {
        let store = store_with_keys(&["super-secret-key"]);
        let dbg = format!("{store:?}");
        assert!(!dbg.contains("super-secret-key"));
        assert!(dbg.contains("redacted"));
    }
}
