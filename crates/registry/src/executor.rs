//! MCP JSON-RPC calls: `tools/list` and the fallback-chain `tools/call`.
//!
//! Execution never throws out of this module: per-server failures are
//! captured as structured error records and the aggregate failure is an
//! error-shaped JSON value the agent loop feeds back to the model.

use lily_core::error::RegistryError;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Hard timeout for any single MCP request.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A response counts as success when it carries any of these markers.
pub fn is_success(body: &Value) -> bool {
    body.get("status").and_then(|s| s.as_str()) == Some("success")
        || body.get("result").is_some()
        || body.get("content").is_some()
}

/// Structured record of one failed attempt against one server.
pub fn attempt_error(
    server: &str,
    message: String,
    http_status: Option<u16>,
    error_body: Option<String>,
    error_type: &str,
) -> Value {
    let mut record = json!({
        "server": server,
        "message": message,
        "error_type": error_type,
    });
    if let Some(status) = http_status {
        record["http_status"] = json!(status);
    }
    if let Some(body) = error_body {
        record["error_body"] = json!(body);
    }
    record
}

/// The aggregate failure value returned when every server failed.
pub fn aggregate_failure(tool_name: &str, errors: Vec<Value>) -> Value {
    let mut message = format!("Tool '{tool_name}' not found or failed to execute.");
    if errors.is_empty() {
        message.push_str(" No servers available or discovered.");
    } else {
        message.push_str(" Details:");
        for (i, err) in errors.iter().enumerate() {
            let detail = err.get("message").and_then(|m| m.as_str()).unwrap_or("unknown");
            let server = err.get("server").and_then(|s| s.as_str()).unwrap_or("?");
            message.push_str(&format!("\n{}. {server} - {detail}", i + 1));
        }
    }
    json!({
        "status": "error",
        "message": message,
        "error_details": errors,
    })
}

/// Fetch the tool list from one MCP server.
pub async fn list_tools(
    client: &reqwest::Client,
    mcp_url: &str,
) -> Result<Vec<Value>, RegistryError> {
    let request = json!({
        "jsonrpc": "2.0",
        "method": "tools/list",
        "id": 1,
    });
    let response = client
        .post(mcp_url)
        .json(&request)
        .send()
        .await
        .map_err(|e| RegistryError::StoreUnreachable(e.to_string()))?;
    if !response.status().is_success() {
        return Err(RegistryError::MalformedCatalog(format!(
            "tools/list returned {}",
            response.status()
        )));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| RegistryError::MalformedCatalog(e.to_string()))?;
    Ok(parse_tools_response(&body))
}

/// Extract the tool array from a `tools/list` response body.
pub fn parse_tools_response(body: &Value) -> Vec<Value> {
    body.get("result")
        .and_then(|r| r.get("tools"))
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Run `tools/call` against each server in turn until one succeeds.
///
/// No server is tried twice within one call. The first success wins and
/// its body is returned verbatim; exhaustion yields the aggregate error
/// value.
pub async fn execute_tool(
    client: &reqwest::Client,
    servers: &[String],
    tool_name: &str,
    params: Value,
) -> Value {
    let mut errors = Vec::new();

    for server in servers {
        match call_tool_on_server(client, server, tool_name, &params).await {
            Ok(body) if is_success(&body) => {
                debug!(tool = %tool_name, server = %server, "Tool executed");
                return body;
            }
            Ok(body) => {
                let detail = body
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("Unknown error")
                    .to_string();
                warn!(tool = %tool_name, server = %server, detail = %detail, "Tool reported failure");
                errors.push(attempt_error(server, detail, None, None, "tool_error"));
            }
            Err(record) => {
                warn!(tool = %tool_name, server = %server, "Tool call failed");
                errors.push(record);
            }
        }
    }

    aggregate_failure(tool_name, errors)
}

/// One `tools/call` attempt; failure is a structured attempt record.
async fn call_tool_on_server(
    client: &reqwest::Client,
    server: &str,
    tool_name: &str,
    params: &Value,
) -> Result<Value, Value> {
    let request = json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "id": 1,
        "params": {
            "name": tool_name,
            "arguments": params,
        },
    });

    let response = client
        .post(server)
        .json(&request)
        .send()
        .await
        .map_err(|e| {
            attempt_error(server, e.to_string(), None, None, "transport_error")
        })?;

    let status = response.status();
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        return Err(attempt_error(
            server,
            format!("HTTP error: {}", status.as_u16()),
            Some(status.as_u16()),
            Some(error_body),
            "http_error",
        ));
    }

    response.json().await.map_err(|e| {
        attempt_error(
            server,
            format!("JSON extraction error: {e}"),
            None,
            None,
            "invalid_response",
        )
    })
}
