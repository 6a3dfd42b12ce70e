//! Agent loop records — the typed trace of one reasoning run.
//!
//! Every chat request drives one [`AgentLoopRecord`]: an ordered sequence
//! of steps (thinking, tool calls, the final response) with timing. The
//! gateway exposes the latest record for introspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of step the model took in one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStepType {
    /// Free-form reasoning that did not resolve to a tool call or answer
    Thinking,
    /// A tool invocation against an MCP server
    ToolCall,
    /// The terminal answer returned to the client
    Response,
}

/// One iteration of the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// 1-based, contiguous within a loop
    pub step_number: u32,

    #[serde(rename = "type")]
    pub step_type: AgentStepType,

    /// The model's stated reasoning for this step
    pub reasoning: String,

    /// Tool name; empty unless `step_type` is `ToolCall`
    #[serde(default)]
    pub tool_name: String,

    /// Arguments passed to the tool
    #[serde(default)]
    pub tool_parameters: serde_json::Value,

    /// Whatever the tool server returned
    #[serde(default)]
    pub tool_result: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    /// Wall-clock seconds spent in this step
    pub duration_seconds: f64,
}

/// The full trace of one agent run for one user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopRecord {
    pub user_id: String,
    pub user_message: String,

    /// Steps in execution order; numbered 1..=N with no gaps
    pub steps: Vec<AgentStep>,

    /// The payload the client receives
    pub final_response: String,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub completed: bool,
    pub duration_seconds: f64,
}

impl AgentLoopRecord {
    /// Start a new, not-yet-completed record.
    pub fn begin(user_id: impl Into<String>, user_message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            user_message: user_message.into(),
            steps: Vec::new(),
            final_response: String::new(),
            start_time: now,
            end_time: now,
            completed: false,
            duration_seconds: 0.0,
        }
    }

    /// Mark the loop finished and fix up end time and duration.
    pub fn finish(&mut self) {
        self.end_time = Utc::now();
        self.duration_seconds = (self.end_time - self.start_time)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        self.completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AgentStepType::ToolCall).unwrap(),
            "\"tool_call\""
        );
        assert_eq!(
            serde_json::to_string(&AgentStepType::Thinking).unwrap(),
            "\"thinking\""
        );
    }

    #[test]
    fn step_serialization_roundtrip() {
        let step = AgentStep {
            step_number: 3,
            step_type: AgentStepType::ToolCall,
            reasoning: "need weather data".into(),
            tool_name: "weather".into(),
            tool_parameters: serde_json::json!({"city": "Oslo"}),
            tool_result: serde_json::json!({"status": "success", "temp": 4}),
            timestamp: Utc::now(),
            duration_seconds: 0.42,
        };
        let json = serde_json::to_string(&step).unwrap();
        let back: AgentStep = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step_number, 3);
        assert_eq!(back.step_type, AgentStepType::ToolCall);
        assert_eq!(back.tool_name, "weather");
        assert_eq!(back.tool_parameters["city"], "Oslo");
        assert_eq!(back.duration_seconds, 0.42);
    }

    #[test]
    fn finish_sets_completed_and_duration() {
        let mut rec = AgentLoopRecord::begin("u1", "hi");
        assert!(!rec.completed);
        rec.final_response = "hello".into();
        rec.finish();
        assert!(rec.completed);
        assert!(rec.end_time >= rec.start_time);
        assert!(rec.duration_seconds >= 0.0);
    }
}
