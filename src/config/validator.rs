//! Configuration validation.
//!
//! Checks resolved cluster, provider and executor settings before any
//! descriptor is generated from them.

use crate::error::{ConfigError, KestrelError, Result};
use crate::resource::is_valid_name;
use tracing::debug;

use super::spec::{ExecutorConfig, KestrelConfig, ProviderConfig, ProviderKind};

/// Upper bound on cluster size; larger clusters are almost certainly a typo.
const MAX_NODES: u32 = 64;

/// Key type prefixes accepted for public key material.
const KEY_PREFIXES: &[&str] = &["ssh-rsa", "ssh-ed25519", "ecdsa-sha2-", "sk-ssh-", "sk-ecdsa-"];

/// Validator for resolved configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The key that failed validation.
    pub key: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error as [`ConfigError::InvalidValue`].
    pub fn validate(&self, config: &KestrelConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first) = result.errors.first() {
            return Err(KestrelError::Config(ConfigError::invalid(
                first.key.clone(),
                first.message.clone(),
            )));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &KestrelConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_cluster(config, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_executor(&config.executor, &mut result);

        result
    }

    fn validate_cluster(config: &KestrelConfig, result: &mut ValidationResult) {
        let cluster = &config.cluster;

        if !is_valid_name(&cluster.resource_group) {
            result.error(
                "cluster.resource_group",
                format!(
                    "'{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    cluster.resource_group
                ),
            );
        }

        if cluster.node_count == 0 {
            result.error("cluster.node_count", "must be at least 1");
        } else if cluster.node_count > MAX_NODES {
            result.error(
                "cluster.node_count",
                format!("must be at most {MAX_NODES}"),
            );
        } else if cluster.node_count % 2 == 0 {
            result.warnings.push(format!(
                "cluster.node_count: {} nodes cannot tolerate more failures than {}",
                cluster.node_count,
                cluster.node_count - 1
            ));
        }

        if cluster.admin_username.eq_ignore_ascii_case("root")
            || cluster.admin_username.eq_ignore_ascii_case("admin")
        {
            result.error(
                "cluster.admin_username",
                format!("'{}' is reserved", cluster.admin_username),
            );
        }

        if !KEY_PREFIXES
            .iter()
            .any(|p| cluster.ssh_public_key.starts_with(p))
        {
            result.error(
                "cluster.ssh_key",
                "does not look like an OpenSSH public key",
            );
        }

        if cluster.location.trim().is_empty() {
            result.error("cluster.location", "must not be empty");
        }

        if cluster.vm_size.trim().is_empty() {
            result.error("cluster.vm_size", "must not be empty");
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => {
                if provider.endpoint.as_deref().is_none_or(str::is_empty) {
                    result.error(
                        "provider.endpoint",
                        "is required when using the http provider",
                    );
                }
            }
            ProviderKind::Memory => {
                result
                    .warnings
                    .push(String::from("provider.kind: memory provider only simulates resources"));
            }
        }
    }

    fn validate_executor(executor: &ExecutorConfig, result: &mut ValidationResult) {
        if executor.concurrency == 0 {
            result.error("executor.concurrency", "must be at least 1");
        }

        if executor.max_attempts == 0 {
            result.error("executor.max_attempts", "must be at least 1");
        }

        if executor.initial_backoff_ms > executor.max_backoff_ms {
            result.error(
                "executor.initial_backoff_ms",
                "must not exceed executor.max_backoff_ms",
            );
        }

        if executor.operation_timeout_secs == 0 {
            result.error("executor.operation_timeout_secs", "must be at least 1");
        }
    }
}

impl ValidationResult {
    fn error(&mut self, key: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            key: key.to_string(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn config(yaml: &str) -> KestrelConfig {
        let parser = ConfigParser::new();
        parser.resolve(parser.parse_yaml(yaml, None).unwrap()).unwrap()
    }

    const BASE: &str = "cluster:\n  resource_group: k3s-rg\n  admin_username: azureuser\n  ssh_key: ssh-rsa AAAA\n";

    #[test]
    fn test_default_cluster_is_valid() {
        let result = ConfigValidator::new().validate(&config(BASE));
        assert!(result.is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let yaml = "cluster:\n  resource_group: K3S_RG\n  admin_username: root\n  ssh_key: not-a-key\n  node_count: 0\nexecutor:\n  concurrency: 0\n";
        let result = ConfigValidator::new().check(&config(yaml));
        let keys: Vec<&str> = result.errors.iter().map(|e| e.key.as_str()).collect();

        assert!(keys.contains(&"cluster.resource_group"));
        assert!(keys.contains(&"cluster.admin_username"));
        assert!(keys.contains(&"cluster.ssh_key"));
        assert!(keys.contains(&"cluster.node_count"));
        assert!(keys.contains(&"executor.concurrency"));
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let yaml = format!("{BASE}provider:\n  kind: http\n");
        let err = ConfigValidator::new().validate(&config(&yaml)).unwrap_err();
        assert!(err.to_string().contains("provider.endpoint"));
    }

    #[test]
    fn test_even_node_count_warns() {
        let yaml = format!("{BASE}  node_count: 2\n");
        let result = ConfigValidator::new().validate(&config(&yaml)).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("node_count")));
    }
}
