use std::fs;
use std::path::{Path, PathBuf};

use super::ConfigError;
use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigLayer};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn load_user_config() -> Result<Option<ConfigLayer>, ConfigError> {
    load_layer(&config_path())
}

/// Read one layer. A missing file is not an error.
pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// User config, then `explicit` (from `--config`), then environment.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let user = load_user_config()?;
    let explicit = match explicit {
        Some(path) if !path.exists() => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                reason: "file not found".into(),
            });
        }
        Some(path) => load_layer(path)?,
        None => None,
    };
    let mut config = merge_layers(user, explicit);
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Like [`load`], but falls back to defaults (plus environment) on failure.
pub fn load_or_default(explicit: Option<&Path>) -> Config {
    match load(explicit) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| ConfigError::Write {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
    }
    let contents = toml::to_string_pretty(cfg).map_err(|e| ConfigError::Render {
        reason: e.to_string(),
    })?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let write_err = |reason: String| ConfigError::Write {
        path: path.to_path_buf(),
        reason,
    };
    let dir = path
        .parent()
        .ok_or_else(|| write_err("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| write_err(format!("failed to create temp file: {e}")))?;
    fs::write(temp.path(), data)
        .map_err(|e| write_err(format!("failed to write config temp file: {e}")))?;
    temp.persist(path)
        .map_err(|e| write_err(format!("failed to persist config: {e}")))?;
    Ok(())
}
