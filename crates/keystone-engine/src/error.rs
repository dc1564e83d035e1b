//! Engine error type.

use keystone_ecs::EcsError;

/// Errors produced by the runner and its configuration.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A configuration value is out of range.
    #[error("invalid runner config: {0}")]
    InvalidConfig(String),

    /// A configuration document could not be parsed.
    #[error("failed to parse runner config: {0}")]
    ConfigFormat(#[from] serde_json::Error),

    /// The driven state failed to save or restore.
    #[error(transparent)]
    State(#[from] EcsError),
}
