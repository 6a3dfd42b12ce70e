//! Classification of a model reply into the three step kinds.
//!
//! The model is instructed to answer with exactly one of two prefixes;
//! anything else is treated as continued analysis. Malformed tool-call
//! JSON degrades to a thinking step — the loop never aborts on shape
//! failures.

use serde_json::Value;

const TOOL_CALL_PREFIX: &str = "TOOL_CALL:";
const FINAL_RESPONSE_PREFIX: &str = "FINAL_RESPONSE:";

/// What the model decided to do this iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ToolCall {
        tool_name: String,
        reasoning: String,
        parameters: Value,
    },
    Final(String),
    Thinking(String),
}

/// Classify one model reply.
pub fn classify(text: &str) -> Decision {
    let trimmed = text.trim();

    if let Some(payload) = trimmed.strip_prefix(TOOL_CALL_PREFIX) {
        return match serde_json::from_str::<Value>(payload.trim()) {
            Ok(call) => {
                let Some(tool_name) = call.get("tool_name").and_then(|n| n.as_str()) else {
                    return Decision::Thinking(
                        "Error parsing tool call: missing 'tool_name'".into(),
                    );
                };
                Decision::ToolCall {
                    tool_name: tool_name.to_string(),
                    reasoning: call
                        .get("reasoning")
                        .and_then(|r| r.as_str())
                        .unwrap_or("")
                        .to_string(),
                    parameters: call
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default())),
                }
            }
            Err(e) => Decision::Thinking(format!("Error parsing tool call: {e}")),
        };
    }

    if let Some(answer) = trimmed.strip_prefix(FINAL_RESPONSE_PREFIX) {
        return Decision::Final(answer.trim().to_string());
    }

    Decision::Thinking(trimmed.to_string())
}
