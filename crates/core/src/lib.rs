//! # Lily Core
//!
//! Domain types, traits, and error definitions for the Lily conversational
//! gateway. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every remote seam (the LLM endpoint, the MCP tool servers) is defined as
//! a trait here. Implementations live in their respective crates. This
//! enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod agent;
pub mod error;
pub mod event;
pub mod message;
pub mod model;
pub mod service;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentLoopRecord, AgentStep, AgentStepType};
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, Role};
pub use model::LanguageModel;
pub use service::ServiceInfo;
pub use session::SessionInfo;
pub use tool::ToolRouter;
