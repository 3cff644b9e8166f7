// Configuration module for msflow
//
// This module handles engine settings: workspace layout, parallelism, the
// job queue and the key-value store topology.

pub mod manager;
pub mod types;

// Re-export commonly used types
pub use manager::ConfigManager;
pub use types::{
    ConfigPaths, EngineConfig, EnvVars, HostPort, QueueSettings, RedisConfig, RedisMode,
    ValidationResult,
};
