// Configuration Manager implementation for msflow
//
// This module provides the ConfigManager that layers the engine settings:
// built-in defaults, then the TOML configuration file, then environment
// variables (highest priority).

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

use super::types::{
    ConfigPaths, EngineConfig, EnvVars, HostPort, RedisConfig, RedisMode, ValidationResult,
};

/// Main configuration manager for msflow
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Effective configuration
    config: EngineConfig,
    /// File the configuration was read from, if any
    source_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from `explicit_path`, `MSFLOW_CONFIG`, or the
    /// default location, then apply environment overrides
    pub async fn load(explicit_path: Option<&Path>) -> Result<Self> {
        tracing::debug!("Initializing configuration manager");

        let config_file = match explicit_path {
            Some(path) => Some(path.to_path_buf()),
            None => match env::var(EnvVars::CONFIG_FILE) {
                Ok(path) => Some(PathBuf::from(path)),
                Err(_) => ConfigPaths::config_file().ok(),
            },
        };

        let mut manager = Self {
            config: EngineConfig::default(),
            source_file: None,
        };

        if let Some(path) = config_file {
            manager.load_config_file(&path, explicit_path.is_some()).await?;
        }

        manager.apply_environment(|key| env::var(key).ok());

        tracing::info!("Configuration loaded successfully");
        Ok(manager)
    }

    /// Wrap an already-built configuration (no file, no environment)
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            source_file: None,
        }
    }

    /// Load the TOML configuration file
    async fn load_config_file(&mut self, path: &Path, required: bool) -> Result<()> {
        if !path.exists() {
            if required {
                return Err(anyhow::anyhow!(
                    "Configuration file not found: {}",
                    path.display()
                ));
            }
            tracing::debug!("Configuration file not found, using defaults");
            return Ok(());
        }

        tracing::debug!("Loading configuration from: {:?}", path);

        let content = async_fs::read_to_string(path)
            .await
            .context("Failed to read configuration file")?;

        self.config = toml::from_str(&content).context("Failed to parse configuration file")?;
        self.source_file = Some(path.to_path_buf());

        tracing::debug!("Configuration loaded from file");
        Ok(())
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_environment<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        tracing::debug!("Loading configuration from environment variables");

        if let Some(workspace) = lookup(EnvVars::WORKSPACE) {
            self.config.workspace_dir = PathBuf::from(workspace);
        }

        if let Some(presets) = lookup(EnvVars::PRESETS) {
            self.config.presets_file = PathBuf::from(presets);
        }

        if let Some(max_parallel) = lookup(EnvVars::MAX_PARALLEL) {
            match max_parallel.parse::<usize>() {
                Ok(value) => self.config.max_parallel = value,
                Err(_) => tracing::warn!(
                    "Ignoring invalid {}='{}'",
                    EnvVars::MAX_PARALLEL,
                    max_parallel
                ),
            }
        }

        if let Some(log_dir) = lookup(EnvVars::LOG_DIR) {
            self.config.log_dir = Some(PathBuf::from(log_dir));
        }

        // Any store endpoint in the environment switches to online mode
        let url = lookup(EnvVars::REDIS_URL);
        let cluster_nodes = lookup(EnvVars::REDIS_CLUSTER_NODES);
        let sentinel_hosts = lookup(EnvVars::REDIS_SENTINEL_HOSTS);
        if url.is_none() && cluster_nodes.is_none() && sentinel_hosts.is_none() {
            return;
        }

        self.config.online_deployment = true;
        let redis = self.config.redis.get_or_insert_with(RedisConfig::default);

        if let Some(mode) = lookup(EnvVars::REDIS_MODE) {
            redis.mode = mode.parse().unwrap_or_else(|_| {
                tracing::warn!("Invalid REDIS_MODE '{}', falling back to standalone", mode);
                RedisMode::Standalone
            });
        }

        if let Some(url) = url {
            redis.url = url;
        }

        if let Some(nodes) = cluster_nodes {
            match HostPort::parse_list(&nodes, ConfigPaths::REDIS_PORT) {
                Ok(nodes) => redis.cluster_nodes = nodes,
                Err(e) => tracing::warn!("Ignoring {}: {:#}", EnvVars::REDIS_CLUSTER_NODES, e),
            }
        }

        if let Some(hosts) = sentinel_hosts {
            match HostPort::parse_list(&hosts, ConfigPaths::SENTINEL_PORT) {
                Ok(hosts) => redis.sentinel_hosts = hosts,
                Err(e) => tracing::warn!("Ignoring {}: {:#}", EnvVars::REDIS_SENTINEL_HOSTS, e),
            }
        }

        if let Some(master) = lookup(EnvVars::REDIS_SENTINEL_MASTER) {
            redis.sentinel_master = master;
        }

        if let Some(password) = lookup(EnvVars::REDIS_PASSWORD) {
            redis.password = Some(password);
        }
    }

    /// Get the effective configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Consume the manager, returning the configuration
    pub fn into_config(self) -> EngineConfig {
        self.config
    }

    /// File the configuration was read from
    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    /// Whether queued execution should be attempted
    pub fn is_online(&self) -> bool {
        self.config.store_config().is_some()
    }

    /// Validate the current configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.config.max_parallel == 0 {
            result.add_error("max_parallel must be greater than 0".to_string());
        }

        if self.config.online_deployment && self.config.redis.is_none() {
            result.add_warning(
                "online_deployment is set but no store is configured; running locally".to_string(),
            );
        }

        if let Some(redis) = self.config.store_config() {
            match redis.mode {
                RedisMode::Cluster if redis.cluster_nodes.is_empty() => {
                    result.add_error(
                        "cluster mode requires cluster_nodes (e.g. 'host1:7000,host2:7001')"
                            .to_string(),
                    );
                }
                RedisMode::Sentinel if redis.sentinel_hosts.is_empty() => {
                    result.add_error(
                        "sentinel mode requires sentinel_hosts (e.g. 'sentinel1:26379')"
                            .to_string(),
                    );
                }
                _ => {}
            }
        }

        if !self.config.presets_file.exists() {
            result.add_warning(format!(
                "Preset catalog does not exist: {:?}",
                self.config.presets_file
            ));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[tokio::test]
    async fn test_load_from_explicit_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "workspace_dir = \"/srv/ws\"\nmax_parallel = 3\n").unwrap();

        let manager = ConfigManager::load(Some(&path)).await.unwrap();
        assert_eq!(manager.source_file(), Some(path.as_path()));
        assert_eq!(manager.config().max_parallel, 3);
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.toml");
        assert!(ConfigManager::load(Some(&path)).await.is_err());
    }

    #[test]
    fn test_environment_enables_online_mode() {
        let mut manager = ConfigManager::from_config(EngineConfig::default());
        assert!(!manager.is_online());

        manager.apply_environment(lookup_from(&[
            ("REDIS_MODE", "sentinel"),
            ("REDIS_SENTINEL_HOSTS", "s1,s2:26380"),
            ("REDIS_SENTINEL_MASTER", "primary"),
        ]));

        assert!(manager.is_online());
        let redis = manager.config().store_config().unwrap();
        assert_eq!(redis.mode, RedisMode::Sentinel);
        assert_eq!(redis.sentinel_hosts[0].port, 26379);
        assert_eq!(redis.sentinel_hosts[1].port, 26380);
        assert_eq!(redis.sentinel_master, "primary");
    }

    #[test]
    fn test_invalid_mode_falls_back_to_standalone() {
        let mut manager = ConfigManager::from_config(EngineConfig::default());
        manager.apply_environment(lookup_from(&[
            ("REDIS_MODE", "bogus"),
            ("REDIS_URL", "redis://queue:6379/1"),
        ]));

        let redis = manager.config().store_config().unwrap();
        assert_eq!(redis.mode, RedisMode::Standalone);
        assert_eq!(redis.url, "redis://queue:6379/1");
    }

    #[test]
    fn test_mode_without_endpoints_stays_local() {
        let mut manager = ConfigManager::from_config(EngineConfig::default());
        manager.apply_environment(lookup_from(&[("REDIS_MODE", "cluster")]));
        assert!(!manager.is_online());
    }

    #[test]
    fn test_validation_flags_cluster_without_nodes() {
        let mut config = EngineConfig::default();
        config.online_deployment = true;
        config.redis = Some(RedisConfig {
            mode: RedisMode::Cluster,
            ..RedisConfig::default()
        });
        config.max_parallel = 0;

        let result = ConfigManager::from_config(config).validate();
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);
    }
}
