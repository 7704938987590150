//! In-memory simulated cloud.
//!
//! Keeps resources in a map, hands out identifiers and public addresses,
//! and can be told to fail calls for a named resource. Used as the default
//! provider for dry local runs and throughout the tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::resource::{ResourceDescriptor, ResourceKind};

use super::{Attributes, Provider, ProviderResult, ResolvedRef, IP_ADDRESS_ATTR};

/// A call observed by the memory provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    /// `create` for the named resource.
    Create(String),
    /// `read` for the named resource.
    Read(String),
    /// `update` for the named resource.
    Update(String),
    /// `delete` for the named resource.
    Delete(String),
}

impl ProviderCall {
    /// Name of the resource the call targeted.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Create(name) | Self::Read(name) | Self::Update(name) | Self::Delete(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredResource {
    name: String,
    kind: ResourceKind,
    attributes: Attributes,
    references: Vec<ResolvedRef>,
}

#[derive(Debug, Clone)]
struct Fault {
    error: ProviderError,
    /// Remaining failures; `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Cloud {
    resources: HashMap<String, StoredResource>,
    faults: HashMap<String, Fault>,
    calls: Vec<ProviderCall>,
    next_address: u32,
}

impl Cloud {
    /// Consumes one injected failure for `name`, if any.
    fn take_fault(&mut self, name: &str) -> Option<ProviderError> {
        let fault = self.faults.get_mut(name)?;
        let error = fault.error.clone();
        match fault.remaining {
            None => {}
            Some(0) => return None,
            Some(n) => fault.remaining = Some(n - 1),
        }
        Some(error)
    }

    fn name_of(&self, id: &str) -> String {
        self.resources
            .get(id)
            .map_or_else(|| id.to_string(), |r| r.name.clone())
    }
}

/// Simulated provider backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    cloud: Mutex<Cloud>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the in-flight counter when a call finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryProvider {
    /// Creates an empty simulated cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every call for `name` fail with `error`.
    #[must_use]
    pub fn fail_always(mut self, name: &str, error: ProviderError) -> Self {
        self.cloud.get_mut().faults.insert(
            name.to_string(),
            Fault {
                error,
                remaining: None,
            },
        );
        self
    }

    /// Makes the next `times` calls for `name` fail with `error`.
    #[must_use]
    pub fn fail_times(mut self, name: &str, times: u32, error: ProviderError) -> Self {
        self.cloud.get_mut().faults.insert(
            name.to_string(),
            Fault {
                error,
                remaining: Some(times),
            },
        );
        self
    }

    /// Every call received so far, in arrival order.
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.cloud.lock().await.calls.clone()
    }

    /// Names of the resources currently present.
    pub async fn resource_names(&self) -> Vec<String> {
        let cloud = self.cloud.lock().await;
        let mut names: Vec<String> = cloud.resources.values().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    /// References the named resource was last created or updated with.
    pub async fn references_of(&self, name: &str) -> Option<Vec<ResolvedRef>> {
        let cloud = self.cloud.lock().await;
        cloud
            .resources
            .values()
            .find(|r| r.name == name)
            .map(|r| r.references.clone())
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create(&self, descriptor: &ResourceDescriptor, references: &[ResolvedRef]) -> ProviderResult<String> {
        let _guard = self.enter().await;
        let mut cloud = self.cloud.lock().await;
        cloud.calls.push(ProviderCall::Create(descriptor.name.clone()));

        if let Some(error) = cloud.take_fault(&descriptor.name) {
            return Err(error);
        }

        let id = format!(
            "/{}/{}/{}",
            descriptor.kind,
            descriptor.name,
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let mut attributes = descriptor.attributes.clone();
        if descriptor.kind == ResourceKind::PublicIp {
            cloud.next_address += 1;
            let address = format!("20.42.{}.{}", cloud.next_address / 250, cloud.next_address % 250 + 4);
            attributes.insert(IP_ADDRESS_ATTR.to_string(), Value::String(address));
        }

        debug!("Simulated create of {} as {id}", descriptor.name);
        cloud.resources.insert(
            id.clone(),
            StoredResource {
                name: descriptor.name.clone(),
                kind: descriptor.kind,
                attributes,
                references: references.to_vec(),
            },
        );

        Ok(id)
    }

    async fn read(&self, kind: ResourceKind, id: &str) -> ProviderResult<Attributes> {
        let _guard = self.enter().await;
        let mut cloud = self.cloud.lock().await;
        let name = cloud.name_of(id);
        cloud.calls.push(ProviderCall::Read(name.clone()));

        if let Some(error) = cloud.take_fault(&name) {
            return Err(error);
        }

        cloud
            .resources
            .get(id)
            .filter(|r| r.kind == kind)
            .map(|r| r.attributes.clone())
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }

    async fn update(&self, id: &str, descriptor: &ResourceDescriptor, references: &[ResolvedRef]) -> ProviderResult<()> {
        let _guard = self.enter().await;
        let mut cloud = self.cloud.lock().await;
        let name = cloud.name_of(id);
        cloud.calls.push(ProviderCall::Update(name.clone()));

        if let Some(error) = cloud.take_fault(&name) {
            return Err(error);
        }

        let resource = cloud
            .resources
            .get_mut(id)
            .filter(|r| r.kind == descriptor.kind)
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })?;

        let computed = resource.attributes.get(IP_ADDRESS_ATTR).cloned();
        resource.attributes = descriptor.attributes.clone();
        resource.references = references.to_vec();
        if let Some(address) = computed {
            resource.attributes.insert(IP_ADDRESS_ATTR.to_string(), address);
        }

        debug!("Simulated update of {name}");
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()> {
        let _guard = self.enter().await;
        let mut cloud = self.cloud.lock().await;
        let name = cloud.name_of(id);
        cloud.calls.push(ProviderCall::Delete(name.clone()));

        if let Some(error) = cloud.take_fault(&name) {
            return Err(error);
        }

        let exists = cloud.resources.get(id).is_some_and(|r| r.kind == kind);
        if !exists {
            return Err(ProviderError::NotFound { id: id.to_string() });
        }

        cloud.resources.remove(id);
        debug!("Simulated delete of {name}");
        Ok(())
    }
}
