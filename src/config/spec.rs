//! Configuration specification types.
//!
//! [`RawConfig`] maps one-to-one onto `kestrel.yaml` with every field
//! optional; [`KestrelConfig`] is the resolved form handed to each
//! component, with defaults applied and required keys checked.

use serde::{Deserialize, Serialize};

/// Default region, as in the original cluster declaration.
pub const DEFAULT_LOCATION: &str = "East US";

/// Default VM size.
pub const DEFAULT_VM_SIZE: &str = "Standard_B2s";

/// Default number of cluster nodes (three for HA).
pub const DEFAULT_NODE_COUNT: u32 = 3;

/// Configuration file as written by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawConfig {
    /// Cluster parameters.
    #[serde(default)]
    pub cluster: RawClusterConfig,
    /// State file settings.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Cluster parameters as written by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawClusterConfig {
    /// Resource group name (required).
    #[serde(default)]
    pub resource_group: Option<String>,
    /// Region.
    #[serde(default)]
    pub location: Option<String>,
    /// VM size for every node.
    #[serde(default)]
    pub vm_size: Option<String>,
    /// Administrator username (required).
    #[serde(default)]
    pub admin_username: Option<String>,
    /// Public key material.
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Path to a public key file, used when `ssh_key` is absent.
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    /// Number of nodes.
    #[serde(default)]
    pub node_count: Option<u32>,
    /// Network layout.
    #[serde(default)]
    pub network: NetworkConfig,
    /// OS image for every node.
    #[serde(default)]
    pub image: ImageConfig,
}

/// Resolved configuration passed into every component.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KestrelConfig {
    /// Cluster parameters.
    pub cluster: ClusterConfig,
    /// State file settings.
    pub state: StateConfig,
    /// Provider settings.
    pub provider: ProviderConfig,
    /// Executor tuning.
    pub executor: ExecutorConfig,
}

/// Resolved cluster parameters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Resource group name.
    pub resource_group: String,
    /// Region.
    pub location: String,
    /// VM size for every node.
    pub vm_size: String,
    /// Administrator username.
    pub admin_username: String,
    /// Public key material.
    #[serde(skip_serializing)]
    pub ssh_public_key: String,
    /// Number of nodes.
    pub node_count: u32,
    /// Network layout.
    pub network: NetworkConfig,
    /// OS image for every node.
    pub image: ImageConfig,
}

/// Network layout of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Virtual network name.
    #[serde(default = "default_vnet_name")]
    pub vnet_name: String,
    /// Virtual network address space.
    #[serde(default = "default_address_space")]
    pub address_space: String,
    /// Subnet name.
    #[serde(default = "default_subnet_name")]
    pub subnet_name: String,
    /// Subnet prefix.
    #[serde(default = "default_subnet_prefix")]
    pub subnet_prefix: String,
}

/// OS image reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    /// Image publisher.
    #[serde(default = "default_publisher")]
    pub publisher: String,
    /// Image offer.
    #[serde(default = "default_offer")]
    pub offer: String,
    /// Image SKU.
    #[serde(default = "default_sku")]
    pub sku: String,
}

/// State file settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory holding the state and lock files.
    #[serde(default)]
    pub path: Option<String>,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process simulated cloud.
    #[default]
    Memory,
    /// HTTP/JSON resource API.
    Http,
}

/// Provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which provider to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the resource API (http provider only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout in seconds (http provider only).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per operation for transient failures (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Upper bound for the retry delay in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Timeout for a single provider call in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Whole-cycle timeout in seconds; unset means no limit.
    #[serde(default)]
    pub apply_timeout_secs: Option<u64>,
}

// Default value functions

fn default_vnet_name() -> String {
    String::from("k3s-vnet")
}

fn default_address_space() -> String {
    String::from("10.0.0.0/16")
}

fn default_subnet_name() -> String {
    String::from("k3s-subnet")
}

fn default_subnet_prefix() -> String {
    String::from("10.0.1.0/24")
}

fn default_publisher() -> String {
    String::from("Canonical")
}

fn default_offer() -> String {
    String::from("UbuntuServer")
}

fn default_sku() -> String {
    String::from("18.04-LTS")
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_initial_backoff() -> u64 {
    500
}

const fn default_max_backoff() -> u64 {
    30_000
}

const fn default_operation_timeout() -> u64 {
    300
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            vnet_name: default_vnet_name(),
            address_space: default_address_space(),
            subnet_name: default_subnet_name(),
            subnet_prefix: default_subnet_prefix(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            publisher: default_publisher(),
            offer: default_offer(),
            sku: default_sku(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            operation_timeout_secs: default_operation_timeout(),
            apply_timeout_secs: None,
        }
    }
}

impl ClusterConfig {
    /// Name of the VM for node `index`.
    #[must_use]
    pub fn node_name(index: u32) -> String {
        format!("k3s-node-{index}")
    }

    /// Name of the public IP for node `index`.
    #[must_use]
    pub fn public_ip_name(index: u32) -> String {
        format!("public-ip-{index}")
    }

    /// Name of the network interface for node `index`.
    #[must_use]
    pub fn nic_name(index: u32) -> String {
        format!("nic-{index}")
    }
}
