//! Service discovery, tool catalog, and tool execution.
//!
//! The registry keeps three things current: the set of peer services
//! discovered through the coordination store, the merged MCP tool
//! catalog across those peers, and the owner process's own registration.
//! It also routes `tools/call` requests across the known MCP servers
//! with structured per-attempt error capture.

mod consul;
mod discovery;
mod executor;

pub use consul::{ConsulClient, HealthCheck, ServiceRegistration};
pub use discovery::{derive_service_info, RefreshHandle, ServiceRegistry};
