// ABOUTME: Application-wide error types for stevedore.
// ABOUTME: Uses thiserror for ergonomic error handling.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("compose file not found: {0}")]
    ComposeNotFound(PathBuf),

    #[error("no hosts specified")]
    NoHosts,

    #[error("invalid version tag: {0}")]
    InvalidTag(String),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Exec(#[from] crate::exec::ExecError),

    #[error(transparent)]
    State(#[from] crate::state::StateError),

    #[error(transparent)]
    Deploy(#[from] crate::deploy::DeployError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
