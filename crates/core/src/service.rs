//! Discovered peer services.

use serde::{Deserialize, Serialize};

/// A peer discovered through the coordination store.
///
/// URLs are derived from the instance's `hostname=` tag; `mcp_url` is
/// populated only for services carrying the `mcp` tag. The last known
/// good set is retained when a refresh fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub http_url: String,

    /// Empty when the service exposes no WebSocket endpoint
    #[serde(default)]
    pub websocket_url: String,

    /// Empty unless the service is MCP-enabled
    #[serde(default)]
    pub mcp_url: String,

    /// Whether the service answers MCP JSON-RPC
    pub mcp: bool,
}
