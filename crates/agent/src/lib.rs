//! The agent loop engine.
//!
//! One [`AgentEngine::run`] call drives one reasoning loop: prompt the
//! model with the accumulated context and the tool catalog, classify its
//! reply, execute tool calls, and repeat until it commits to a final
//! response or hits the safety ceiling.

mod decision;
mod engine;

pub use decision::{classify, Decision};
pub use engine::AgentEngine;
