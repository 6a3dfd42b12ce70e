//! Gemini generateContent client.
//!
//! Builds the request body (prompt contents plus function declarations
//! translated from the MCP tool schemas), rotates through the configured
//! API keys one call at a time, and returns the parsed response body.
//! Any failure — transport, timeout, non-200, unparseable body — yields
//! an empty JSON object: callers treat that as "no candidate" and keep
//! going.

use async_trait::async_trait;
use lily_config::ConfigStore;
use lily_core::model::LanguageModel;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use lily_core::model::first_candidate_text;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the Gemini generateContent endpoint.
pub struct GeminiClient {
    base_url: String,
    config: Arc<ConfigStore>,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            config,
            client,
        }
    }

    /// Point at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Build the generateContent request body.
///
/// `contents` carries the whole composed prompt as a single user turn;
/// non-empty tool catalogs become `functionDeclarations`.
pub fn build_request_body(prompt: &str, tools: &[Value]) -> Value {
    let mut body = json!({
        "contents": [{
            "role": "user",
            "parts": [{"text": prompt}],
        }],
    });
    let declarations = translate_tools(tools);
    if !declarations.is_empty() {
        body["tools"] = json!([{"functionDeclarations": declarations}]);
    }
    body
}

/// Translate MCP tool objects into Gemini function declarations.
///
/// `inputSchema` maps to `parameters` with `type` forced to `"OBJECT"`;
/// `properties` and `required` carry over when present. Tools without a
/// name are skipped.
pub fn translate_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            let description = tool
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("");
            let mut parameters = json!({"type": "OBJECT"});
            if let Some(schema) = tool.get("inputSchema") {
                if let Some(props) = schema.get("properties") {
                    parameters["properties"] = props.clone();
                }
                if let Some(required) = schema.get("required") {
                    parameters["required"] = required.clone();
                }
            }
            Some(json!({
                "name": name,
                "description": description,
                "parameters": parameters,
            }))
        })
        .collect()
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, prompt: &str, tools: &[Value]) -> Value {
        let key = self.config.next_key();
        if key.is_empty() {
            warn!("No Gemini API key configured");
            return json!({});
        }
        let model = self.config.gemini_model();
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, key
        );
        let body = build_request_body(prompt, tools);

        debug!(model = %model, tools = tools.len(), "Sending generateContent request");

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "LLM request failed");
                return json!({});
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %error_body, "LLM returned error status");
            return json!({});
        }

        match response.json::<Value>().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Unparseable LLM response");
                json!({})
            }
        }
    }
}
