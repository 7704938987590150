//! Cloud provider boundary.
//!
//! The engine never talks to a cloud directly. Every side effect goes
//! through [`Provider`], whose failures are classified so the executor can
//! tell a retryable hiccup from a permanent refusal.

mod http;
mod memory;

pub use http::HttpProvider;
pub use memory::{MemoryProvider, ProviderCall};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{ConfigError, ProviderError, Result};
use crate::resource::{ResourceDescriptor, ResourceKind};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Provider-computed attribute holding a public IP's address.
pub const IP_ADDRESS_ATTR: &str = "ip_address";

/// Attribute map as stored by a provider.
pub type Attributes = BTreeMap<String, Value>;

/// A descriptor reference resolved to its target's provider identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRef {
    /// Kind of the referenced resource.
    pub kind: ResourceKind,
    /// Name of the referenced resource.
    pub name: String,
    /// Identifier the provider assigned to it.
    pub provider_id: String,
}

/// Capability to create, inspect, change and remove cloud resources.
///
/// `references` on create and update lists every reference of the
/// descriptor, resolved against the applied state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates the resource and returns its provider-assigned identifier.
    async fn create(&self, descriptor: &ResourceDescriptor, references: &[ResolvedRef]) -> ProviderResult<String>;

    /// Reads the live attributes of a resource, including provider-computed
    /// ones such as a public IP's `ip_address`.
    async fn read(&self, kind: ResourceKind, id: &str) -> ProviderResult<Attributes>;

    /// Replaces the attributes and references of an existing resource.
    async fn update(&self, id: &str, descriptor: &ResourceDescriptor, references: &[ResolvedRef]) -> ProviderResult<()>;

    /// Deletes a resource. Returns [`ProviderError::NotFound`] if it is already gone.
    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()>;
}

/// Builds the provider selected in the configuration.
///
/// # Errors
///
/// Returns an error if the http provider has no endpoint or its client
/// cannot be built.
pub fn create_provider(config: &ProviderConfig, token: Option<String>) -> Result<Arc<dyn Provider>> {
    match config.kind {
        ProviderKind::Memory => {
            warn!("Using the in-memory provider; nothing will be provisioned");
            Ok(Arc::new(MemoryProvider::new()))
        }
        ProviderKind::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| ConfigError::missing("provider.endpoint"))?;
            info!("Using HTTP provider at {endpoint}");
            let provider = HttpProvider::new(endpoint, token, config.request_timeout_secs)?;
            Ok(Arc::new(provider))
        }
    }
}
