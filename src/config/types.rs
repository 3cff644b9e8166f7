// Configuration types for msflow
//
// This module defines the engine settings, the key-value store topology
// settings and the environment variables that override them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::utils::serde_helpers::{duration_secs, duration_secs_f64};

/// Deployment topology of the key-value store backing the job queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    /// Single node behind a multiplexed connection
    #[default]
    Standalone,
    /// Hash-sharded cluster, requires an explicit node list
    Cluster,
    /// Primary discovered through sentinels, with failover
    Sentinel,
}

impl fmt::Display for RedisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisMode::Standalone => write!(f, "standalone"),
            RedisMode::Cluster => write!(f, "cluster"),
            RedisMode::Sentinel => write!(f, "sentinel"),
        }
    }
}

impl FromStr for RedisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standalone" => Ok(RedisMode::Standalone),
            "cluster" => Ok(RedisMode::Cluster),
            "sentinel" => Ok(RedisMode::Sentinel),
            other => Err(format!("Invalid store mode: {}", other)),
        }
    }
}

/// A `host:port` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Parse a comma-separated `host:port` list; bare hosts get `default_port`
    pub fn parse_list(value: &str, default_port: u16) -> Result<Vec<HostPort>> {
        let mut endpoints = Vec::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let endpoint = match item.rsplit_once(':') {
                Some((host, port)) => HostPort {
                    host: host.to_string(),
                    port: port
                        .parse()
                        .with_context(|| format!("Invalid port in endpoint '{}'", item))?,
                },
                None => HostPort {
                    host: item.to_string(),
                    port: default_port,
                },
            };
            endpoints.push(endpoint);
        }
        Ok(endpoints)
    }

    /// Connection URL for this endpoint
    pub fn to_url(&self, password: Option<&str>) -> String {
        match password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Key-value store connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Deployment topology
    pub mode: RedisMode,
    /// Connection URL for standalone mode
    pub url: String,
    /// Seed nodes for cluster mode
    pub cluster_nodes: Vec<HostPort>,
    /// Sentinel endpoints for sentinel mode
    pub sentinel_hosts: Vec<HostPort>,
    /// Name of the monitored primary in sentinel mode
    pub sentinel_master: String,
    /// Optional password for cluster and sentinel nodes
    pub password: Option<String>,
    /// Upper bound for establishing a connection
    #[serde(with = "duration_secs_f64")]
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::Standalone,
            url: "redis://localhost:6379/0".to_string(),
            cluster_nodes: Vec::new(),
            sentinel_hosts: Vec::new(),
            sentinel_master: "mymaster".to_string(),
            password: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Settings for queued execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Queue name, shared by submitters and workers
    pub name: String,
    /// Maximum run time of one queued job
    #[serde(with = "duration_secs")]
    pub job_timeout: Duration,
    /// How long finished job records are retained
    #[serde(with = "duration_secs")]
    pub result_ttl: Duration,
    /// Sleep between status polls and worker queue pops
    #[serde(with = "duration_secs_f64")]
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "msflow-workflows".to_string(),
            job_timeout: Duration::from_secs(7200), // 2 hours
            result_ttl: Duration::from_secs(86400), // 24 hours
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one subdirectory per workflow
    pub workspace_dir: PathBuf,
    /// Preset catalog (workflow name -> preset name -> bundle)
    pub presets_file: PathBuf,
    /// Upper bound on concurrently running tool invocations
    pub max_parallel: usize,
    /// Use the distributed queue when a store is configured
    pub online_deployment: bool,
    /// Directory for rolling service logs of long-running processes
    pub log_dir: Option<PathBuf>,
    /// Queue behaviour
    pub queue: QueueSettings,
    /// Store connection, present only in online deployments
    pub redis: Option<RedisConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspaces"),
            presets_file: PathBuf::from("presets.json"),
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            online_deployment: false,
            log_dir: None,
            queue: QueueSettings::default(),
            redis: None,
        }
    }
}

impl EngineConfig {
    /// Store settings when running as an online deployment
    pub fn store_config(&self) -> Option<&RedisConfig> {
        if self.online_deployment {
            self.redis.as_ref()
        } else {
            None
        }
    }
}

/// Configuration validation result
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Whether the configuration is valid
    pub is_valid: bool,
    /// Validation errors
    pub errors: Vec<String>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Create a new validation result
    pub fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error to the validation result
    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    /// Add a warning to the validation result
    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Check if there are any issues
    pub fn has_issues(&self) -> bool {
        !self.errors.is_empty() || !self.warnings.is_empty()
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Environment variable names read by msflow
pub struct EnvVars;

impl EnvVars {
    pub const CONFIG_FILE: &'static str = "MSFLOW_CONFIG";
    pub const WORKSPACE: &'static str = "MSFLOW_WORKSPACE";
    pub const PRESETS: &'static str = "MSFLOW_PRESETS";
    pub const MAX_PARALLEL: &'static str = "MSFLOW_MAX_PARALLEL";
    pub const LOG_DIR: &'static str = "MSFLOW_LOG_DIR";
    pub const REDIS_MODE: &'static str = "REDIS_MODE";
    pub const REDIS_URL: &'static str = "REDIS_URL";
    pub const REDIS_CLUSTER_NODES: &'static str = "REDIS_CLUSTER_NODES";
    pub const REDIS_SENTINEL_HOSTS: &'static str = "REDIS_SENTINEL_HOSTS";
    pub const REDIS_SENTINEL_MASTER: &'static str = "REDIS_SENTINEL_MASTER";
    pub const REDIS_PASSWORD: &'static str = "REDIS_PASSWORD";
}

/// Configuration file paths and names
pub struct ConfigPaths;

impl ConfigPaths {
    /// Configuration directory name below the platform config dir
    pub const CONFIG_DIR_NAME: &'static str = "msflow";

    /// Engine configuration file name
    pub const CONFIG_FILE: &'static str = "config.toml";

    /// Default standalone store port
    pub const REDIS_PORT: u16 = 6379;

    /// Default sentinel port
    pub const SENTINEL_PORT: u16 = 26379;

    /// Get the default configuration directory
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(Self::CONFIG_DIR_NAME))
            .context("Failed to determine configuration directory")
    }

    /// Get the default engine configuration file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join(Self::CONFIG_FILE))
    }
}
