//! msflow library
//!
//! Workflow execution engine for mass-spectrometry tool pipelines: tool
//! parameter resolution, external process execution with leveled logs, a
//! result cache, and scheduling either as a local worker process or as a
//! job on a distributed queue.

pub mod config;
pub mod error;
pub mod executor;
pub mod files;
pub mod params;
pub mod queue;
pub mod utils;
pub mod workflow;

// Re-export main types for convenience
pub use config::ConfigManager;
pub use executor::CommandExecutor;
pub use files::FileManager;
pub use params::ParameterManager;
pub use queue::{QueueManager, RedisConnectionFactory};
pub use workflow::{EngineContext, WorkflowManager};
