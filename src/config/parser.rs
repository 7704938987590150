//! Configuration parser for loading and resolving `kestrel.yaml`.
//!
//! Loading happens in three steps: the YAML file is parsed into a
//! [`RawConfig`], `KESTREL_*` environment variables are applied on top, and
//! the result is resolved into a [`KestrelConfig`] with defaults filled in
//! and required keys checked.

use crate::error::{ConfigError, KestrelError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{
    ClusterConfig, DEFAULT_LOCATION, DEFAULT_NODE_COUNT, DEFAULT_VM_SIZE, KestrelConfig, RawConfig,
};

/// Configuration parser for loading cluster configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads and resolves configuration from a YAML file, applying
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or a required
    /// key is missing.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<KestrelConfig> {
        let mut raw = self.load_file(path)?;
        Self::apply_env_overrides(&mut raw, |var| std::env::var(var).ok())?;
        self.resolve(raw)
    }

    /// Loads the raw configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<RawConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(KestrelError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            KestrelError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses raw configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<RawConfig> {
        debug!("Parsing YAML configuration");

        // An empty document deserializes as unit; treat it as all-defaults.
        if content.trim().is_empty() {
            return Ok(RawConfig::default());
        }

        serde_yaml::from_str(content).map_err(|e| {
            KestrelError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })
    }

    /// Applies `KESTREL_CLUSTER_*` and `KESTREL_PROVIDER_ENDPOINT`
    /// overrides, reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `KESTREL_CLUSTER_NODE_COUNT`
    /// is not a non-negative integer.
    fn apply_env_overrides(raw: &mut RawConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let cluster = &mut raw.cluster;

        let overrides: [(&str, &mut Option<String>); 6] = [
            ("KESTREL_CLUSTER_RESOURCE_GROUP", &mut cluster.resource_group),
            ("KESTREL_CLUSTER_LOCATION", &mut cluster.location),
            ("KESTREL_CLUSTER_VM_SIZE", &mut cluster.vm_size),
            ("KESTREL_CLUSTER_ADMIN_USERNAME", &mut cluster.admin_username),
            ("KESTREL_CLUSTER_SSH_KEY", &mut cluster.ssh_key),
            ("KESTREL_CLUSTER_SSH_KEY_PATH", &mut cluster.ssh_key_path),
        ];

        for (var, slot) in overrides {
            if let Some(value) = lookup(var) {
                debug!("Overriding {var} from environment");
                *slot = Some(value);
            }
        }

        if let Some(value) = lookup("KESTREL_CLUSTER_NODE_COUNT") {
            let count = value.trim().parse().map_err(|e| {
                ConfigError::invalid(
                    "KESTREL_CLUSTER_NODE_COUNT",
                    format!("'{value}' is not a node count: {e}"),
                )
            })?;
            debug!("Overriding KESTREL_CLUSTER_NODE_COUNT from environment");
            cluster.node_count = Some(count);
        }

        if let Some(endpoint) = lookup("KESTREL_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            raw.provider.endpoint = Some(endpoint);
        }

        Ok(())
    }

    /// Resolves a raw configuration into the form components consume.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingConfig`] naming the first required key
    /// that is absent, or an error if the public key file cannot be read.
    pub fn resolve(&self, raw: RawConfig) -> Result<KestrelConfig> {
        let cluster = raw.cluster;

        let resource_group = require(cluster.resource_group, "cluster.resource_group")?;
        let admin_username = require(cluster.admin_username, "cluster.admin_username")?;

        let ssh_public_key = match (cluster.ssh_key, cluster.ssh_key_path) {
            (Some(key), _) if !key.trim().is_empty() => key.trim().to_string(),
            (_, Some(path)) if !path.trim().is_empty() => self.read_public_key(&path)?,
            _ => return Err(ConfigError::missing("cluster.ssh_key").into()),
        };

        Ok(KestrelConfig {
            cluster: ClusterConfig {
                resource_group,
                location: cluster.location.unwrap_or_else(|| String::from(DEFAULT_LOCATION)),
                vm_size: cluster.vm_size.unwrap_or_else(|| String::from(DEFAULT_VM_SIZE)),
                admin_username,
                ssh_public_key,
                node_count: cluster.node_count.unwrap_or(DEFAULT_NODE_COUNT),
                network: cluster.network,
                image: cluster.image,
            },
            state: raw.state,
            provider: raw.provider,
            executor: raw.executor,
        })
    }

    /// Reads public key material from a file, expanding a leading `~/`.
    fn read_public_key(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path);
        debug!("Reading public key from: {}", resolved.display());

        let content = std::fs::read_to_string(&resolved).map_err(|e| {
            ConfigError::invalid(
                "cluster.ssh_key_path",
                format!("cannot read {}: {e}", resolved.display()),
            )
        })?;

        Ok(content.trim().to_string())
    }

    /// Resolves a user-supplied path against the home directory or base path.
    fn resolve_path(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }

        let candidate = PathBuf::from(path);
        match &self.base_path {
            Some(base) if candidate.is_relative() => base.join(candidate),
            _ => candidate,
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                KestrelError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider bearer token from environment (optional).
    #[must_use]
    pub fn provider_token() -> Option<String> {
        std::env::var("KESTREL_PROVIDER_TOKEN").ok()
    }
}

fn require(value: Option<String>, key: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::missing(key).into()),
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["kestrel.yaml", "kestrel.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(KestrelError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_env_overrides_replace_file_values() {
        let mut raw = ConfigParser::new()
            .parse_yaml("cluster:\n  resource_group: from-file\n  node_count: 3\n", None)
            .unwrap();

        ConfigParser::apply_env_overrides(
            &mut raw,
            env(&[
                ("KESTREL_CLUSTER_RESOURCE_GROUP", "from-env"),
                ("KESTREL_CLUSTER_NODE_COUNT", "5"),
                ("KESTREL_PROVIDER_ENDPOINT", "http://localhost:9000"),
            ]),
        )
        .unwrap();

        assert_eq!(raw.cluster.resource_group.as_deref(), Some("from-env"));
        assert_eq!(raw.cluster.node_count, Some(5));
        assert_eq!(raw.provider.endpoint.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_unparsable_node_count_override_is_rejected() {
        let mut raw = RawConfig::default();
        let err = ConfigParser::apply_env_overrides(&mut raw, env(&[("KESTREL_CLUSTER_NODE_COUNT", "three")]))
            .unwrap_err();

        assert!(matches!(
            err,
            KestrelError::Config(ConfigError::InvalidValue { ref key, .. }) if key == "KESTREL_CLUSTER_NODE_COUNT"
        ));
        assert_eq!(raw.cluster.node_count, None);
    }

    #[test]
    fn test_resolve_minimal_config_applies_defaults() {
        let yaml = r#"
cluster:
  resource_group: k3s-rg
  admin_username: azureuser
  ssh_key: "ssh-ed25519 AAAAC3Nza test@host"
"#;
        let parser = ConfigParser::new();
        let raw = parser.parse_yaml(yaml, None).unwrap();
        let config = parser.resolve(raw).unwrap();

        assert_eq!(config.cluster.resource_group, "k3s-rg");
        assert_eq!(config.cluster.location, "East US");
        assert_eq!(config.cluster.vm_size, "Standard_B2s");
        assert_eq!(config.cluster.node_count, 3);
        assert_eq!(config.cluster.network.subnet_prefix, "10.0.1.0/24");
        assert_eq!(config.cluster.image.sku, "18.04-LTS");
        assert_eq!(config.provider.kind, ProviderKind::Memory);
        assert_eq!(config.executor.concurrency, 4);
    }

    #[test]
    fn test_missing_required_key_is_named() {
        let yaml = r"
cluster:
  resource_group: k3s-rg
  ssh_key: ssh-rsa AAAA
";
        let parser = ConfigParser::new();
        let raw = parser.parse_yaml(yaml, None).unwrap();
        let err = parser.resolve(raw).unwrap_err();

        match err {
            KestrelError::Config(ConfigError::MissingConfig { key }) => {
                assert_eq!(key, "cluster.admin_username");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_ssh_key_is_named() {
        let parser = ConfigParser::new();
        let raw = parser
            .parse_yaml("cluster:\n  resource_group: rg\n  admin_username: admin\n", None)
            .unwrap();
        let err = parser.resolve(raw).unwrap_err();
        assert!(err.to_string().contains("cluster.ssh_key"));
    }

    #[test]
    fn test_ssh_key_path_is_read_relative_to_base() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("id.pub"), "ssh-rsa AAAAB3Nza user@host\n").unwrap();

        let parser = ConfigParser::new().with_base_path(dir.path());
        let raw = parser
            .parse_yaml(
                "cluster:\n  resource_group: rg\n  admin_username: admin\n  ssh_key_path: id.pub\n",
                None,
            )
            .unwrap();
        let config = parser.resolve(raw).unwrap();
        assert_eq!(config.cluster.ssh_public_key, "ssh-rsa AAAAB3Nza user@host");
    }

    #[test]
    fn test_empty_document_is_all_defaults() {
        let raw = ConfigParser::new().parse_yaml("", None).unwrap();
        assert_eq!(raw, RawConfig::default());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("kestrel.yaml"), "").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("kestrel.yaml"));
    }
}
