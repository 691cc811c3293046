//! Config loading and persistence.

use std::path::PathBuf;

use thiserror::Error;

mod load;
mod merge;
mod schema;

pub use load::{config_path, load, load_layer, load_or_default, load_user_config, write_config};
pub use merge::{apply_env_overrides, apply_env_overrides_from, merge_layers};
pub use schema::{
    Config, ConfigLayer, DEFAULT_GRACE_PERIOD_MS, DEFAULT_MAX_FRAME_BYTES, FileLoggingConfig,
    FileLoggingConfigOverride, Limits, LimitsOverride, LogFormat, LogRotation, LoggingConfig,
    LoggingConfigOverride, NetworkConfig, PathsConfig, WorkerConfig,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("failed to render config: {reason}")]
    Render { reason: String },
    #[error("failed to write {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },
}
