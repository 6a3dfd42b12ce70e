//! Minimal client for the Consul-compatible coordination store.
//!
//! Four endpoints: catalog listing, healthy-instance lookup, agent
//! service registration and deregistration.

use lily_core::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A healthy instance of a service, as reported by the health endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthyInstance {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Port", default)]
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthyInstance,
}

/// Health check attached to a self-registration.
///
/// Exactly one of `http`/`tcp` is set: TCP when the service speaks
/// WebSocket on its main port, HTTP `/health` otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "Timeout")]
    pub timeout: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_after: String,
}

impl HealthCheck {
    /// HTTP check against `/health` on the given address.
    pub fn http(host: &str, port: u16) -> Self {
        Self {
            http: Some(format!("http://{host}:{port}/health")),
            tcp: None,
            interval: "10s".into(),
            timeout: "2s".into(),
            deregister_after: "1m".into(),
        }
    }

    /// Plain TCP connect check, used for WebSocket-speaking services.
    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            http: None,
            tcp: Some(format!("{host}:{port}")),
            interval: "10s".into(),
            timeout: "2s".into(),
            deregister_after: "1m".into(),
        }
    }
}

/// Payload for `PUT /v1/agent/service/register`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Check")]
    pub check: HealthCheck,
}

impl ServiceRegistration {
    /// Build a registration with the `{name}-{host}-{port}` id convention.
    pub fn new(name: &str, host: &str, port: u16, tags: Vec<String>) -> Self {
        let check = if tags.iter().any(|t| t == "websocket") {
            HealthCheck::tcp(host, port)
        } else {
            HealthCheck::http(host, port)
        };
        Self {
            id: format!("{name}-{host}-{port}"),
            name: name.to_string(),
            tags,
            address: host.to_string(),
            port,
            check,
        }
    }
}

/// HTTP client for the coordination store.
pub struct ConsulClient {
    base_url: String,
    client: reqwest::Client,
}

impl ConsulClient {
    pub fn new(host: &str, port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            base_url: format!("http://{host}:{port}"),
            client,
        }
    }

    /// Names of every service in the catalog.
    pub async fn list_services(&self) -> Result<Vec<String>, RegistryError> {
        let url = format!("{}/v1/catalog/services", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::StoreUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RegistryError::MalformedCatalog(format!(
                "catalog returned {}",
                response.status()
            )));
        }
        let services: HashMap<String, Vec<String>> = response
            .json()
            .await
            .map_err(|e| RegistryError::MalformedCatalog(e.to_string()))?;
        Ok(services.into_keys().collect())
    }

    /// Healthy instances of a named service (`passing=true`).
    pub async fn healthy_instances(
        &self,
        name: &str,
    ) -> Result<Vec<HealthyInstance>, RegistryError> {
        let url = format!("{}/v1/health/service/{name}?passing=true", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::StoreUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RegistryError::MalformedCatalog(format!(
                "health endpoint returned {}",
                response.status()
            )));
        }
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| RegistryError::MalformedCatalog(e.to_string()))?;
        Ok(entries.into_iter().map(|e| e.service).collect())
    }

    /// Register a service with the local agent.
    pub async fn register(&self, registration: &ServiceRegistration) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        debug!(service_id = %registration.id, "Registering service");
        let response = self
            .client
            .put(&url)
            .json(registration)
            .send()
            .await
            .map_err(|e| RegistryError::RegistrationFailed {
                service_id: registration.id.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(RegistryError::RegistrationFailed {
                service_id: registration.id.clone(),
                reason: format!("store returned {}", response.status()),
            });
        }
        Ok(())
    }

    /// Remove a previously registered service id.
    pub async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/deregister/{service_id}", self.base_url);
        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| RegistryError::DeregistrationFailed {
                service_id: service_id.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(RegistryError::DeregistrationFailed {
                service_id: service_id.to_string(),
                reason: format!("store returned {}", response.status()),
            });
        }
        Ok(())
    }
}
