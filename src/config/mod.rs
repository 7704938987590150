//! Configuration module for the Kestrel provisioning engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing `kestrel.yaml` and applying environment overrides
//! - Resolving defaults and required keys into an explicit [`KestrelConfig`]
//! - Validation of configuration values

mod spec;
mod parser;
mod validator;

pub use spec::{
    ClusterConfig, ExecutorConfig, ImageConfig, KestrelConfig, NetworkConfig, ProviderConfig,
    ProviderKind, RawClusterConfig, RawConfig, StateConfig, DEFAULT_LOCATION, DEFAULT_NODE_COUNT,
    DEFAULT_VM_SIZE,
};
pub use parser::{ConfigParser, find_config_file, DEFAULT_CONFIG_FILES};
pub use validator::{ConfigValidator, ValidationResult};
