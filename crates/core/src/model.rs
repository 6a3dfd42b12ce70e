//! The LanguageModel trait — the abstraction over the remote LLM endpoint.
//!
//! The agent loop calls `generate()` without knowing which backend is
//! configured. The contract is deliberately lossless: the implementation
//! returns the parsed response body as-is, and callers treat an empty
//! object as "no candidate".

use async_trait::async_trait;

/// The seam between the agent loop and the remote LLM.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// A human-readable name for this backend (e.g., "gemini").
    fn name(&self) -> &str;

    /// Send a prompt plus the current tool catalog and return the parsed
    /// response body.
    ///
    /// On any transport error, timeout, or non-200 status this returns an
    /// empty JSON object rather than failing — degraded responses are
    /// information the loop feeds back into its context, not exceptions.
    async fn generate(&self, prompt: &str, tools: &[serde_json::Value]) -> serde_json::Value;
}

/// The first candidate's first text part of a generateContent-shaped
/// response body, if any.
pub fn first_candidate_text(response: &serde_json::Value) -> Option<String> {
    response
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?
        .first()?
        .get("text")?
        .as_str()
        .map(str::to_string)
}
