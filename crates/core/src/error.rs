//! Error types for the Lily domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant. Components never let
//! errors cross a module boundary as panics; remote failures become
//! structured values that the caller branches on.

use thiserror::Error;

/// The top-level error type for all Lily operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Speech error: {0}")]
    Speech(#[from] SpeechError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Coordination store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("Service registration failed for {service_id}: {reason}")]
    RegistrationFailed { service_id: String, reason: String },

    #[error("Deregistration failed for {service_id}: {reason}")]
    DeregistrationFailed { service_id: String, reason: String },

    #[error("Malformed catalog response: {0}")]
    MalformedCatalog(String),
}

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Provider reported failure: {0}")]
    ProviderFailure(String),

    #[error("Synthesis exhausted {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Stream closed before any audio arrived")]
    EmptyStream,

    #[error("Not connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("Send failed to {user_id}: {reason}")]
    SendFailed { user_id: String, reason: String },

    #[error("Bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Worker queue is full")]
    QueueFull,

    #[error("Worker pool is shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: String, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: String, reason: String },

    #[error("Failed to write config file at {path}: {reason}")]
    WriteError { path: String, reason: String },
}
