//! Peer discovery and the merged tool catalog.

use crate::consul::{ConsulClient, HealthyInstance, ServiceRegistration};
use crate::executor;
use async_trait::async_trait;
use lily_core::error::RegistryError;
use lily_core::service::ServiceInfo;
use lily_core::tool::{tool_name, ToolRouter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Cadence of the periodic refresh.
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Backoff after a failed refresh.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Build a [`ServiceInfo`] from a healthy instance's tags.
///
/// Requires a `hostname=` tag; services without one are not addressable
/// from outside and are skipped. URL scheme derivation:
/// - http → `https://{host}/api`
/// - ws   → `wss://{host}/ws`
/// - mcp  → `https://{host}/mcp` (only when tagged `mcp`)
pub fn derive_service_info(instance: &HealthyInstance) -> Option<ServiceInfo> {
    let host = instance
        .tags
        .iter()
        .find_map(|t| t.strip_prefix("hostname="))?;
    if host.is_empty() {
        return None;
    }
    let mcp = instance.tags.iter().any(|t| t == "mcp");
    let websocket = instance.tags.iter().any(|t| t == "websocket");
    Some(ServiceInfo {
        id: if instance.id.is_empty() {
            instance.service.clone()
        } else {
            instance.id.clone()
        },
        name: instance.service.clone(),
        http_url: format!("https://{host}/api"),
        websocket_url: if websocket {
            format!("wss://{host}/ws")
        } else {
            String::new()
        },
        mcp_url: if mcp {
            format!("https://{host}/mcp")
        } else {
            String::new()
        },
        mcp,
    })
}

/// Handle for stopping the background refresh task.
pub struct RefreshHandle(tokio::task::JoinHandle<()>);

impl RefreshHandle {
    pub fn stop(self) {
        self.0.abort();
    }
}

/// The registry of peer services and their tools.
///
/// Owns the ServiceInfo set, the merged tool catalog, and the rotation
/// of its own registrations with the coordination store. Discovery
/// failures never poison the last known good set.
pub struct ServiceRegistry {
    consul: ConsulClient,
    self_name: String,
    services: RwLock<Vec<ServiceInfo>>,
    /// Merged catalog keyed by tool name; later discovery wins
    tools: RwLock<HashMap<String, serde_json::Value>>,
    /// Per-server tool lists keyed by mcp url, kept for introspection
    tools_per_server: RwLock<HashMap<String, Vec<serde_json::Value>>>,
    registered_ids: Mutex<Vec<String>>,
    http: reqwest::Client,
}

impl ServiceRegistry {
    pub fn new(consul_host: &str, consul_port: u16, self_name: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(executor::TOOL_CALL_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            consul: ConsulClient::new(consul_host, consul_port),
            self_name: self_name.into(),
            services: RwLock::new(Vec::new()),
            tools: RwLock::new(HashMap::new()),
            tools_per_server: RwLock::new(HashMap::new()),
            registered_ids: Mutex::new(Vec::new()),
            http,
        }
    }

    /// Current peer set.
    pub async fn services(&self) -> Vec<ServiceInfo> {
        self.services.read().await.clone()
    }

    /// Per-server tool lists, keyed by MCP url.
    pub async fn tools_per_server(&self) -> HashMap<String, Vec<serde_json::Value>> {
        self.tools_per_server.read().await.clone()
    }

    /// Number of tools in the merged catalog.
    pub async fn tool_count(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Resolve a discovered WebSocket URL by service name, if any.
    pub async fn websocket_url_for(&self, service_name: &str) -> Option<String> {
        self.services
            .read()
            .await
            .iter()
            .find(|s| s.name == service_name && !s.websocket_url.is_empty())
            .map(|s| s.websocket_url.clone())
    }

    /// Query the coordination store and rebuild the peer set.
    ///
    /// Keeps the previous set when the store is unreachable.
    pub async fn discover(&self) -> Result<(), RegistryError> {
        let names = self.consul.list_services().await?;
        let mut discovered = Vec::new();

        for name in names {
            if name == self.self_name || name == "consul" {
                continue;
            }
            match self.consul.healthy_instances(&name).await {
                Ok(instances) => {
                    // First healthy instance wins
                    if let Some(info) = instances.first().and_then(derive_service_info) {
                        discovered.push(info);
                    }
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Skipping service, health lookup failed");
                }
            }
        }

        info!(count = discovered.len(), "Service discovery complete");
        *self.services.write().await = discovered;
        Ok(())
    }

    /// Refresh per-server tool lists and rebuild the merged catalog.
    ///
    /// A server that fails to answer keeps its previously known tools as
    /// long as it is still in the discovered set; servers that dropped
    /// out of discovery lose their entries.
    pub async fn refresh_tools(&self) {
        let mcp_urls: Vec<String> = self
            .services
            .read()
            .await
            .iter()
            .filter(|s| s.mcp && !s.mcp_url.is_empty())
            .map(|s| s.mcp_url.clone())
            .collect();

        for url in &mcp_urls {
            match executor::list_tools(&self.http, url).await {
                Ok(tools) => {
                    debug!(server = %url, count = tools.len(), "Tool list refreshed");
                    self.tools_per_server
                        .write()
                        .await
                        .insert(url.clone(), tools);
                }
                Err(e) => {
                    warn!(server = %url, error = %e, "Tool refresh failed, keeping last known tools");
                }
            }
        }

        // Drop servers that discovery no longer knows about
        self.tools_per_server
            .write()
            .await
            .retain(|url, _| mcp_urls.iter().any(|u| u == url));

        self.rebuild_catalog(&mcp_urls).await;
    }

    /// Merge per-server lists into the name-keyed catalog, in server
    /// order so that the later discovery wins on name collisions.
    async fn rebuild_catalog(&self, server_order: &[String]) {
        let per_server = self.tools_per_server.read().await;
        let mut merged = HashMap::new();
        for url in server_order {
            if let Some(tools) = per_server.get(url) {
                for tool in tools {
                    if let Some(name) = tool_name(tool) {
                        merged.insert(name.to_string(), tool.clone());
                    }
                }
            }
        }
        drop(per_server);
        let count = merged.len();
        *self.tools.write().await = merged;
        debug!(tool_count = count, "Tool catalog rebuilt");
    }

    /// One full refresh cycle: discovery, then tools.
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        self.discover().await?;
        self.refresh_tools().await;
        Ok(())
    }

    /// Spawn the periodic refresh loop (30 s cadence, 5 s error backoff).
    pub fn spawn_refresher(self: Arc<Self>) -> RefreshHandle {
        let registry = self;
        let handle = tokio::spawn(async move {
            loop {
                match registry.refresh().await {
                    Ok(()) => tokio::time::sleep(REFRESH_INTERVAL).await,
                    Err(e) => {
                        warn!(error = %e, "Registry refresh failed, retrying shortly");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        });
        RefreshHandle(handle)
    }

    /// Register this process with the coordination store.
    pub async fn register_self(&self, registration: ServiceRegistration) -> Result<(), RegistryError> {
        self.consul.register(&registration).await?;
        info!(service_id = %registration.id, "Registered with coordination store");
        self.registered_ids.lock().await.push(registration.id);
        Ok(())
    }

    /// Deregister every id that registered successfully.
    pub async fn deregister_all(&self) {
        let ids = std::mem::take(&mut *self.registered_ids.lock().await);
        for id in ids {
            match self.consul.deregister(&id).await {
                Ok(()) => info!(service_id = %id, "Deregistered"),
                Err(e) => warn!(service_id = %id, error = %e, "Deregistration failed"),
            }
        }
    }
}

#[async_trait]
impl ToolRouter for ServiceRegistry {
    async fn catalog(&self) -> Vec<serde_json::Value> {
        self.tools.read().await.values().cloned().collect()
    }

    async fn execute(&self, tool_name: &str, params: serde_json::Value) -> serde_json::Value {
        let servers: Vec<String> = self
            .services
            .read()
            .await
            .iter()
            .filter(|s| s.mcp && !s.mcp_url.is_empty())
            .map(|s| s.mcp_url.clone())
            .collect();
        executor::execute_tool(&self.http, &servers, tool_name, params).await
    }
}
