//! The ToolRouter trait and helpers for working with discovered tools.
//!
//! Tools are JSON objects owned by remote MCP servers; their schemas are
//! not ours to type. The catalog therefore deals in `serde_json::Value`
//! with accessor helpers, and names key the merged catalog.

use async_trait::async_trait;

/// The seam between the agent loop and the MCP tool servers.
#[async_trait]
pub trait ToolRouter: Send + Sync {
    /// The current merged tool catalog across all discovered servers.
    async fn catalog(&self) -> Vec<serde_json::Value>;

    /// Execute a tool by name, trying each known server in turn.
    ///
    /// Never fails: when every server errors, the returned value is
    /// `{"status":"error", "message": ..., "error_details": [...]}` and
    /// the loop feeds it back to the model like any other result.
    async fn execute(&self, tool_name: &str, params: serde_json::Value) -> serde_json::Value;
}

/// The `name` field of a tool object, if present.
pub fn tool_name(tool: &serde_json::Value) -> Option<&str> {
    tool.get("name").and_then(|n| n.as_str())
}

/// The `description` field of a tool object, or empty.
pub fn tool_description(tool: &serde_json::Value) -> &str {
    tool.get("description").and_then(|d| d.as_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_read_tool_fields() {
        let tool = serde_json::json!({
            "name": "web_search",
            "description": "Search the web",
            "inputSchema": {"type": "object", "properties": {}}
        });
        assert_eq!(tool_name(&tool), Some("web_search"));
        assert_eq!(tool_description(&tool), "Search the web");
    }

    #[test]
    fn accessors_tolerate_missing_fields() {
        let tool = serde_json::json!({"inputSchema": {}});
        assert_eq!(tool_name(&tool), None);
        assert_eq!(tool_description(&tool), "");
    }
}
