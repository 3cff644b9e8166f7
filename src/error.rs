// Typed errors for msflow components
//
// Each engine concern has its own error enum; orchestration code wraps these
// in anyhow with context where a caller only needs to report the failure.

use std::path::PathBuf;

/// Errors raised while resolving or persisting tool parameters
#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    #[error("no defaults descriptor for tool `{tool}` and it could not be generated: {reason}")]
    MissingDefaults { tool: String, reason: String },
    #[error("failed to parse defaults descriptor {path}: {reason}")]
    InvalidDescriptor { path: PathBuf, reason: String },
    #[error("cannot register instance `{instance}`: {reason}")]
    InvalidInstance { instance: String, reason: String },
    #[error("parameter io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize parameters: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised before or while spawning tool processes
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("input/output lists for `{tool}` must have length 1 or a common length, got {lengths:?}")]
    MismatchedLengths { tool: String, lengths: Vec<usize> },
    #[error("no commands to execute for `{tool}`")]
    NoCommands { tool: String },
    #[error("tool executable `{program}` not found")]
    ToolNotFound { program: String },
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process marker io error at {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write script parameters to {path}: {source}")]
    ScriptParameters {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parameters(#[from] ParameterError),
}

/// Errors raised by path derivation and the result cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("`{tag}` does not exist for dataset `{dataset}`")]
    MissingTag { dataset: String, tag: String },
    #[error("no files found (file type {file_type:?}, results dir {results_dir:?})")]
    NoFiles {
        file_type: Option<String>,
        results_dir: Option<String>,
    },
    #[error("invalid cache tag `{0}`")]
    InvalidTag(String),
    #[error("invalid dataset id `{0}`")]
    InvalidDataset(String),
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("failed to (de)serialize cached value at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed table file {path}: {reason}")]
    Table { path: PathBuf, reason: String },
}

/// Errors raised by the key-value store connection and job queue
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid store configuration: {0}")]
    Config(String),
    #[error("store connection timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("store command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("queue backend is not available")]
    Unavailable,
}

/// Errors raised while loading workflow definitions
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read workflow definition {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse workflow definition {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid workflow definition: {0}")]
    Invalid(String),
}
